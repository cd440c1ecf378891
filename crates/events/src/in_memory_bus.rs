//! In-memory partitioned bus for tests/dev.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{
    ChannelConsumer, ChannelPublisher, ConsumeError, ConsumedRecord, OffsetQueryError,
    PartitionControl, Position, PublishError, RebalanceListener, Watermarks,
};
use crate::{Channel, Envelope};

/// In-memory append-only log with consumer-group offsets.
///
/// - No IO
/// - Channels are created on first use with a fixed partition count
/// - Committed offsets are kept per (channel, group, partition), so a new
///   consumer in the same group resumes where the last one committed
/// - Fault injection hooks for publish and offset-query failures
#[derive(Debug)]
pub struct InMemoryBus {
    state: Mutex<BusState>,
    arrivals: Condvar,
    partitions: i32,
}

#[derive(Debug, Default)]
struct BusState {
    channels: HashMap<String, Vec<PartitionLog>>,
    committed: HashMap<(String, String, i32), i64>,
    unavailable: HashSet<String>,
    failing_offset_queries: HashSet<String>,
}

#[derive(Debug, Default, Clone)]
struct PartitionLog {
    /// Offset of `records[0]`; moves forward when retention truncates.
    base: i64,
    records: Vec<StoredRecord>,
}

impl PartitionLog {
    fn end(&self) -> i64 {
        self.base + self.records.len() as i64
    }

    fn get(&self, offset: i64) -> Option<&StoredRecord> {
        if offset < self.base {
            return None;
        }
        self.records.get((offset - self.base) as usize)
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: String,
    payload: Vec<u8>,
    timestamp_millis: i64,
}

impl InMemoryBus {
    /// Bus whose channels have a single partition.
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    pub fn with_partitions(partitions: i32) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            arrivals: Condvar::new(),
            partitions: partitions.max(1),
        }
    }

    pub fn partitions(&self) -> i32 {
        self.partitions
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn logs_mut<'a>(&self, state: &'a mut BusState, channel: &str) -> &'a mut Vec<PartitionLog> {
        state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| vec![PartitionLog::default(); self.partitions as usize])
    }

    /// Stable key → partition placement (FNV-1a).
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in key.as_bytes() {
            hash ^= u32::from(*byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        (hash % self.partitions as u32) as i32
    }

    /// Append to an explicit partition, bypassing key placement.
    pub fn publish_to_partition(
        &self,
        envelope: &Envelope,
        partition: i32,
    ) -> Result<Position, PublishError> {
        let channel = envelope.destination();
        let mut state = self.lock();

        if state.unavailable.contains(channel) {
            return Err(PublishError::Unavailable {
                channel: channel.to_string(),
                reason: "channel marked unavailable".to_string(),
            });
        }
        if partition < 0 || partition >= self.partitions {
            return Err(PublishError::Unavailable {
                channel: channel.to_string(),
                reason: format!("unknown partition {partition}"),
            });
        }

        let log = &mut self.logs_mut(&mut state, channel)[partition as usize];
        let offset = log.end();
        log.records.push(StoredRecord {
            key: envelope.key().to_string(),
            payload: envelope.payload().to_vec(),
            timestamp_millis: envelope.timestamp_millis(),
        });
        drop(state);

        self.arrivals.notify_all();
        Ok(Position { partition, offset })
    }

    /// Make publishes to `channel` fail (or succeed again).
    pub fn set_unavailable(&self, channel: &str, unavailable: bool) {
        let mut state = self.lock();
        if unavailable {
            state.unavailable.insert(channel.to_string());
        } else {
            state.unavailable.remove(channel);
        }
    }

    /// Make watermark queries and seeks on `channel` fail (or succeed again).
    pub fn fail_offset_queries(&self, channel: &str, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing_offset_queries.insert(channel.to_string());
        } else {
            state.failing_offset_queries.remove(channel);
        }
    }

    /// Drop every record of the partition below `offset` (retention).
    pub fn truncate_before(&self, channel: &str, partition: i32, offset: i64) {
        let mut state = self.lock();
        if let Some(log) = self.logs_mut(&mut state, channel).get_mut(partition as usize) {
            let cut = offset.clamp(log.base, log.end());
            log.records.drain(..(cut - log.base) as usize);
            log.base = cut;
        }
    }

    /// Everything currently retained on `channel`, by partition then offset.
    pub fn published(&self, channel: &str) -> Vec<(Position, Envelope)> {
        let state = self.lock();
        let Some(logs) = state.channels.get(channel) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for (partition, log) in logs.iter().enumerate() {
            for (i, r) in log.records.iter().enumerate() {
                out.push((
                    Position {
                        partition: partition as i32,
                        offset: log.base + i as i64,
                    },
                    Envelope::with_timestamp(
                        r.key.clone(),
                        r.payload.clone(),
                        channel,
                        r.timestamp_millis,
                    ),
                ));
            }
        }
        out
    }

    /// Next offset the group will read on that partition, if it ever committed.
    pub fn committed_offset(&self, channel: &str, group: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&(channel.to_string(), group.to_string(), partition))
            .copied()
    }

    pub fn end_offset(&self, channel: &str, partition: i32) -> i64 {
        let state = self.lock();
        state
            .channels
            .get(channel)
            .and_then(|logs| logs.get(partition as usize))
            .map(PartitionLog::end)
            .unwrap_or(0)
    }

    fn watermarks(&self, channel: &str, partition: i32) -> Result<Watermarks, OffsetQueryError> {
        let state = self.lock();
        if state.failing_offset_queries.contains(channel) {
            return Err(OffsetQueryError {
                channel: channel.to_string(),
                partition,
                reason: "broker unreachable".to_string(),
            });
        }
        Ok(state
            .channels
            .get(channel)
            .and_then(|logs| logs.get(partition as usize))
            .map(|log| Watermarks {
                low: log.base,
                high: log.end(),
            })
            .unwrap_or(Watermarks { low: 0, high: 0 }))
    }

    /// Join `channel`'s consumer group; this member gets every partition.
    pub fn consumer(self: &Arc<Self>, channel: Channel) -> InMemoryConsumer {
        InMemoryConsumer::new(Arc::clone(self), channel, None)
    }

    /// Like [`InMemoryBus::consumer`], running `listener` on every assignment.
    pub fn consumer_with_listener(
        self: &Arc<Self>,
        channel: Channel,
        listener: Arc<dyn RebalanceListener>,
    ) -> InMemoryConsumer {
        InMemoryConsumer::new(Arc::clone(self), channel, Some(listener))
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelPublisher for InMemoryBus {
    fn publish(&self, envelope: &Envelope) -> Result<Position, PublishError> {
        self.publish_to_partition(envelope, self.partition_for(envelope.key()))
    }
}

/// Single consumer-group member over an [`InMemoryBus`] channel.
pub struct InMemoryConsumer {
    bus: Arc<InMemoryBus>,
    channel: Channel,
    member_id: Uuid,
    positions: BTreeMap<i32, i64>,
    paused: BTreeSet<i32>,
    listener: Option<Arc<dyn RebalanceListener>>,
    assignment_pending: bool,
    next_partition: usize,
}

impl core::fmt::Debug for InMemoryConsumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryConsumer")
            .field("channel", &self.channel)
            .field("member_id", &self.member_id)
            .field("positions", &self.positions)
            .field("paused", &self.paused)
            .field("assignment_pending", &self.assignment_pending)
            .finish()
    }
}

impl InMemoryConsumer {
    fn new(
        bus: Arc<InMemoryBus>,
        channel: Channel,
        listener: Option<Arc<dyn RebalanceListener>>,
    ) -> Self {
        let mut consumer = Self {
            bus,
            channel,
            member_id: Uuid::now_v7(),
            positions: BTreeMap::new(),
            paused: BTreeSet::new(),
            listener,
            assignment_pending: true,
            next_partition: 0,
        };
        consumer.assign();
        consumer
    }

    /// Revoke and re-assign every partition, as a group rebalance would.
    pub fn rebalance(&mut self) {
        let revoked: Vec<i32> = self.positions.keys().copied().collect();
        if let Some(listener) = &self.listener {
            if !revoked.is_empty() {
                listener.on_partitions_revoked(&revoked);
            }
        }
        self.positions.clear();
        self.assign();
    }

    pub fn assignment(&self) -> Vec<i32> {
        self.positions.keys().copied().collect()
    }

    pub fn is_paused(&self, partition: i32) -> bool {
        self.paused.contains(&partition)
    }

    fn assign(&mut self) {
        let partitions: Vec<i32> = (0..self.bus.partitions).collect();
        self.paused.clear();

        let mut positions = BTreeMap::new();
        {
            let state = self.bus.lock();
            for &p in &partitions {
                let committed = state.committed.get(&(
                    self.channel.name().to_string(),
                    self.channel.consumer_group().to_string(),
                    p,
                ));
                let low = state
                    .channels
                    .get(self.channel.name())
                    .and_then(|logs| logs.get(p as usize))
                    .map(|log| log.base)
                    .unwrap_or(0);
                positions.insert(p, committed.copied().unwrap_or(low).max(low));
            }
        }

        if let Some(listener) = &self.listener {
            let control = AssignmentControl {
                bus: &self.bus,
                channel: self.channel.name(),
                seeks: RefCell::new(Vec::new()),
            };
            if let Err(err) = listener.on_partitions_assigned(&partitions, &control) {
                warn!(
                    channel = %self.channel.name(),
                    member = %self.member_id,
                    error = %err,
                    "partition assignment failed; will retry"
                );
                self.assignment_pending = true;
                return;
            }
            for (p, offset) in control.seeks.into_inner() {
                positions.insert(p, offset);
            }
        }

        debug!(
            channel = %self.channel.name(),
            group = %self.channel.consumer_group(),
            member = %self.member_id,
            partitions = ?partitions,
            "partitions assigned"
        );
        self.positions = positions;
        self.assignment_pending = false;
    }

    fn next_available(&mut self, state: &BusState) -> Option<ConsumedRecord> {
        let logs = state.channels.get(self.channel.name())?;
        let partitions: Vec<i32> = self.positions.keys().copied().collect();
        let n = partitions.len();

        for i in 0..n {
            let idx = (self.next_partition + i) % n;
            let p = partitions[idx];
            if self.paused.contains(&p) {
                continue;
            }
            let Some(log) = logs.get(p as usize) else {
                continue;
            };
            let pos = self.positions.get(&p).copied().unwrap_or(0).max(log.base);
            if let Some(stored) = log.get(pos) {
                self.positions.insert(p, pos + 1);
                self.next_partition = (idx + 1) % n;
                return Some(ConsumedRecord {
                    channel: self.channel.name().to_string(),
                    consumer_group: self.channel.consumer_group().to_string(),
                    partition: p,
                    offset: pos,
                    key: Some(stored.key.clone()),
                    payload: stored.payload.clone(),
                    timestamp_millis: Some(stored.timestamp_millis),
                });
            }
        }
        None
    }
}

impl ChannelConsumer for InMemoryConsumer {
    fn channel(&self) -> &str {
        self.channel.name()
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedRecord>, ConsumeError> {
        if self.assignment_pending {
            self.assign();
            if self.assignment_pending {
                std::thread::sleep(timeout);
                return Ok(None);
            }
        }

        let deadline = Instant::now() + timeout;
        let bus = Arc::clone(&self.bus);
        let mut state = bus.lock();
        loop {
            if let Some(record) = self.next_available(&state) {
                return Ok(Some(record));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = bus
                .arrivals
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    fn commit(&mut self, record: &ConsumedRecord) -> Result<(), ConsumeError> {
        self.bus.lock().committed.insert(
            (
                self.channel.name().to_string(),
                self.channel.consumer_group().to_string(),
                record.partition,
            ),
            record.offset + 1,
        );
        Ok(())
    }

    fn rewind(&mut self, record: &ConsumedRecord) -> Result<(), ConsumeError> {
        if let Some(pos) = self.positions.get_mut(&record.partition) {
            *pos = record.offset;
        }
        Ok(())
    }

    fn pause(&mut self, partition: i32) -> Result<(), ConsumeError> {
        self.paused.insert(partition);
        Ok(())
    }

    fn watermarks(&self, partition: i32) -> Result<Watermarks, OffsetQueryError> {
        self.bus.watermarks(self.channel.name(), partition)
    }
}

/// Offset access handed to a [`RebalanceListener`] during assignment.
struct AssignmentControl<'a> {
    bus: &'a InMemoryBus,
    channel: &'a str,
    seeks: RefCell<Vec<(i32, i64)>>,
}

impl PartitionControl for AssignmentControl<'_> {
    fn watermarks(&self, partition: i32) -> Result<Watermarks, OffsetQueryError> {
        self.bus.watermarks(self.channel, partition)
    }

    fn seek_to_earliest(&self, partition: i32) -> Result<(), OffsetQueryError> {
        let low = self.bus.watermarks(self.channel, partition)?.low;
        self.seeks.borrow_mut().push((partition, low));
        Ok(())
    }
}

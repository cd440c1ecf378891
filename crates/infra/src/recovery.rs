//! Bounded recovery over the `error` tier.
//!
//! When a partition is assigned, its current end offset is captured as a
//! snapshot and the consumer is rewound to the earliest retained record.
//! Records at or below the snapshot are reprocessed; anything appended
//! after the snapshot is left for a later recovery run. Once every tracked
//! partition has passed its snapshot the sweep is complete.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tracing::{error, info};

use orderflow_events::{OffsetQueryError, PartitionControl, RebalanceListener, Watermarks};

/// Last offset of a partition that belongs to the current recovery run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionOffsetSnapshot {
    pub partition: i32,
    pub recovery_offset: i64,
}

impl PartitionOffsetSnapshot {
    /// `high` is the end-of-log offset, so the last existing record is `high - 1`.
    pub fn from_watermarks(partition: i32, marks: Watermarks) -> Self {
        Self {
            partition,
            recovery_offset: marks.high - 1,
        }
    }
}

/// Verdict for a consumed error-tier record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Admission {
    /// At or below the snapshot; process it.
    Process,
    /// Past the snapshot; this partition is done for this run.
    Drained,
    /// No snapshot for this partition (assignment pending or revoked).
    Unassigned,
}

#[derive(Debug, Copy, Clone)]
struct PartitionState {
    snapshot: PartitionOffsetSnapshot,
    drained: bool,
}

/// Per-partition recovery state, shared between the consumer's rebalance
/// callback and the worker loop.
#[derive(Debug)]
pub struct RecoveryController {
    channel: String,
    partitions: RwLock<BTreeMap<i32, PartitionState>>,
}

impl RecoveryController {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            partitions: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<i32, PartitionState>> {
        self.partitions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<i32, PartitionState>> {
        self.partitions.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self, partition: i32) -> Option<PartitionOffsetSnapshot> {
        self.read().get(&partition).map(|s| s.snapshot)
    }

    pub fn snapshots(&self) -> Vec<PartitionOffsetSnapshot> {
        self.read().values().map(|s| s.snapshot).collect()
    }

    /// Decide whether a record at `offset` still belongs to this run.
    ///
    /// The first record past the snapshot marks the partition drained.
    pub fn admit(&self, partition: i32, offset: i64) -> Admission {
        {
            let partitions = self.read();
            match partitions.get(&partition) {
                None => return Admission::Unassigned,
                Some(state) if state.drained => return Admission::Drained,
                Some(state) if offset <= state.snapshot.recovery_offset => {
                    return Admission::Process;
                }
                Some(_) => {}
            }
        }

        let mut partitions = self.write();
        let Some(state) = partitions.get_mut(&partition) else {
            return Admission::Unassigned;
        };
        if offset <= state.snapshot.recovery_offset {
            return Admission::Process;
        }
        if !state.drained {
            state.drained = true;
            info!(
                channel = %self.channel,
                partition,
                offset,
                recovery_offset = state.snapshot.recovery_offset,
                outcome = "drained",
                "recovery reached snapshot; partition drained"
            );
        }
        Admission::Drained
    }

    /// Record that `offset` was processed and committed.
    ///
    /// Settling the snapshot offset itself drains the partition, so a sweep
    /// finishes even when nothing new is appended after it. Returns true when
    /// this call drained the partition.
    pub fn settle(&self, partition: i32, offset: i64) -> bool {
        let mut partitions = self.write();
        let Some(state) = partitions.get_mut(&partition) else {
            return false;
        };
        if state.drained || offset < state.snapshot.recovery_offset {
            return false;
        }
        state.drained = true;
        true
    }

    /// Account for the partition's current low watermark.
    ///
    /// Retention may delete the rest of the window after assignment; once
    /// the earliest retained offset is past the snapshot nothing in this run
    /// is left to deliver. Returns true when this call drained the partition.
    pub fn observe_low(&self, partition: i32, low: i64) -> bool {
        let mut partitions = self.write();
        let Some(state) = partitions.get_mut(&partition) else {
            return false;
        };
        if state.drained || low <= state.snapshot.recovery_offset {
            return false;
        }
        state.drained = true;
        info!(
            channel = %self.channel,
            partition,
            low,
            recovery_offset = state.snapshot.recovery_offset,
            outcome = "drained",
            "recovery window removed by retention; partition drained"
        );
        true
    }

    /// Tracked partitions that still have records to sweep.
    pub fn pending_partitions(&self) -> Vec<i32> {
        self.read()
            .iter()
            .filter(|(_, s)| !s.drained)
            .map(|(p, _)| *p)
            .collect()
    }

    pub fn drained_partitions(&self) -> Vec<i32> {
        self.read()
            .iter()
            .filter(|(_, s)| s.drained)
            .map(|(p, _)| *p)
            .collect()
    }

    /// True once at least one partition is tracked and all of them are drained.
    pub fn is_complete(&self) -> bool {
        let partitions = self.read();
        !partitions.is_empty() && partitions.values().all(|s| s.drained)
    }

    fn track(&self, partition: i32, control: &dyn PartitionControl) -> Result<(), OffsetQueryError> {
        let marks = control.watermarks(partition)?;
        control.seek_to_earliest(partition)?;

        let snapshot = PartitionOffsetSnapshot::from_watermarks(partition, marks);
        let drained = marks.low >= marks.high;
        self.write().insert(partition, PartitionState { snapshot, drained });

        info!(
            channel = %self.channel,
            partition,
            low = marks.low,
            high = marks.high,
            recovery_offset = snapshot.recovery_offset,
            drained,
            "recovery snapshot taken"
        );
        Ok(())
    }
}

impl RebalanceListener for RecoveryController {
    fn on_partitions_assigned(
        &self,
        partitions: &[i32],
        control: &dyn PartitionControl,
    ) -> Result<(), OffsetQueryError> {
        for &partition in partitions {
            if let Err(err) = self.track(partition, control) {
                self.write().remove(&partition);
                error!(
                    channel = %self.channel,
                    partition,
                    error = %err,
                    "offset query failed during assignment"
                );
                return Err(err);
            }
        }
        Ok(())
    }

    fn on_partitions_revoked(&self, partitions: &[i32]) {
        let mut state = self.write();
        for partition in partitions {
            state.remove(partition);
        }
    }
}

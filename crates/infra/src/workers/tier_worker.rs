use std::collections::BTreeSet;
use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use orderflow_events::{ChannelConsumer, ConsumeError, ConsumedRecord, Tier};

use crate::recovery::{Admission, RecoveryController};
use crate::tier_processor::{RecordProcessor, Resolution};

/// Counters for one tier worker.
#[derive(Debug, Clone, Serialize)]
pub struct TierStats {
    pub tier: Tier,
    pub channel: String,
    pub processed: u64,
    pub succeeded: u64,
    pub republished: u64,
    pub dropped: u64,
    pub redelivered: u64,
    /// Records polled but not processed (past the recovery snapshot, or
    /// seen while their partition had no snapshot).
    pub held_back: u64,
    pub started_at: DateTime<Utc>,
    pub finished: bool,
}

impl TierStats {
    fn new(tier: Tier, channel: impl Into<String>) -> Self {
        Self {
            tier,
            channel: channel.into(),
            processed: 0,
            succeeded: 0,
            republished: 0,
            dropped: 0,
            redelivered: 0,
            held_back: 0,
            started_at: Utc::now(),
            finished: false,
        }
    }

    fn record(&mut self, resolution: &Resolution) {
        self.processed += 1;
        match resolution {
            Resolution::Completed => self.succeeded += 1,
            Resolution::Republished { .. } => self.republished += 1,
            Resolution::Dropped { .. } => self.dropped += 1,
            Resolution::Redeliver { .. } => self.redelivered += 1,
        }
    }
}

/// Handle to control and join a background tier worker.
#[derive(Debug)]
pub struct WorkerHandle {
    tier: Tier,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<TierStats>>,
}

impl WorkerHandle {
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Ask the worker to stop after the record in flight, without waiting.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(self) -> TierStats {
        self.request_shutdown();
        self.join()
    }

    /// Wait for the worker to stop on its own (e.g. recovery complete).
    pub fn join(mut self) -> TierStats {
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
        self.stats()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    pub fn stats(&self) -> TierStats {
        lock(&self.stats).clone()
    }
}

fn lock(stats: &Mutex<TierStats>) -> MutexGuard<'_, TierStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Consumer loop for one tier.
///
/// - Polls its tier's channel with the tier's consumer group
/// - Hands each record to the [`RecordProcessor`], which commits or rewinds
/// - With a [`RecoveryController`], only records up to the partition
///   snapshot are processed; the worker exits once every partition drained
#[derive(Debug)]
pub struct TierWorker;

impl TierWorker {
    /// Spawn a named worker thread.
    pub fn spawn<C, P>(
        name: impl Into<String>,
        consumer: C,
        processor: P,
        recovery: Option<Arc<RecoveryController>>,
        poll_interval: Duration,
    ) -> io::Result<WorkerHandle>
    where
        C: ChannelConsumer + 'static,
        P: RecordProcessor + 'static,
    {
        let name = name.into();
        let tier = processor.tier();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(TierStats::new(tier, consumer.channel())));

        let loop_stats = Arc::clone(&stats);
        let worker = name.clone();
        let join = thread::Builder::new().name(name).spawn(move || {
            let mut run = WorkerLoop {
                name: worker,
                consumer,
                processor,
                recovery,
                paused: BTreeSet::new(),
                stats: loop_stats,
                tick: poll_interval,
            };
            run.run(shutdown_rx);
        })?;

        Ok(WorkerHandle {
            tier,
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

struct WorkerLoop<C, P> {
    name: String,
    consumer: C,
    processor: P,
    recovery: Option<Arc<RecoveryController>>,
    paused: BTreeSet<i32>,
    stats: Arc<Mutex<TierStats>>,
    tick: Duration,
}

impl<C, P> WorkerLoop<C, P>
where
    C: ChannelConsumer,
    P: RecordProcessor,
{
    fn run(&mut self, shutdown_rx: mpsc::Receiver<()>) {
        info!(
            worker = %self.name,
            channel = %self.consumer.channel(),
            tier = %self.processor.tier(),
            recovery = self.recovery.is_some(),
            "tier worker started"
        );

        loop {
            // Shutdown check (non-blocking)
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            if self.recovery_complete() {
                info!(worker = %self.name, "recovery sweep complete; stopping");
                break;
            }

            match self.consumer.poll(self.tick) {
                Ok(Some(record)) => self.dispatch(record),
                Ok(None) => self.check_retention(),
                Err(ConsumeError::Disconnected) => {
                    warn!(worker = %self.name, "subscription disconnected; stopping");
                    break;
                }
                Err(err) => {
                    warn!(worker = %self.name, error = %err, "poll failed");
                    thread::sleep(self.tick);
                }
            }
        }

        lock(&self.stats).finished = true;
        info!(worker = %self.name, "tier worker stopped");
    }

    /// Pause partitions that drained since the last tick; true once all are.
    fn recovery_complete(&mut self) -> bool {
        let Some(recovery) = self.recovery.clone() else {
            return false;
        };

        let drained: BTreeSet<i32> = recovery.drained_partitions().into_iter().collect();
        // a re-assignment resets pauses and snapshots
        self.paused.retain(|p| drained.contains(p));
        for partition in drained {
            self.pause(partition);
        }
        recovery.is_complete()
    }

    /// On an idle tick, drain partitions whose remaining window was deleted.
    fn check_retention(&mut self) {
        let Some(recovery) = self.recovery.clone() else {
            return;
        };
        for partition in recovery.pending_partitions() {
            match self.consumer.watermarks(partition) {
                Ok(marks) => {
                    recovery.observe_low(partition, marks.low);
                }
                Err(err) => {
                    debug!(worker = %self.name, partition, error = %err, "watermark query failed");
                }
            }
        }
    }

    fn pause(&mut self, partition: i32) {
        if !self.paused.insert(partition) {
            return;
        }
        if let Err(err) = self.consumer.pause(partition) {
            warn!(worker = %self.name, partition, error = %err, "failed to pause partition");
        }
    }

    fn dispatch(&mut self, record: ConsumedRecord) {
        if let Some(recovery) = self.recovery.clone() {
            match recovery.admit(record.partition, record.offset) {
                Admission::Process => {}
                Admission::Drained => {
                    self.hold_back(&record);
                    self.pause(record.partition);
                    return;
                }
                Admission::Unassigned => {
                    self.hold_back(&record);
                    return;
                }
            }
        }

        let resolution = self.processor.handle_record(&mut self.consumer, &record);
        if let Some(recovery) = &self.recovery {
            let settled = !matches!(resolution, Resolution::Redeliver { .. });
            if settled && recovery.settle(record.partition, record.offset) {
                info!(
                    worker = %self.name,
                    channel = %record.channel,
                    partition = record.partition,
                    offset = record.offset,
                    reference = %self.processor.reference_of(&record).unwrap_or_default(),
                    outcome = "drained",
                    "recovery reached snapshot; partition drained"
                );
            }
        }
        lock(&self.stats).record(&resolution);
    }

    /// Leave `record` unprocessed and back off one tick.
    fn hold_back(&mut self, record: &ConsumedRecord) {
        debug!(
            worker = %self.name,
            channel = %record.channel,
            partition = record.partition,
            offset = record.offset,
            reference = %self.processor.reference_of(record).unwrap_or_default(),
            outcome = "held_back",
            "record outside recovery window; not processed"
        );
        if let Err(err) = self.consumer.rewind(record) {
            warn!(worker = %self.name, error = %err, "failed to rewind held-back record");
        }
        lock(&self.stats).held_back += 1;
        thread::sleep(self.tick);
    }
}

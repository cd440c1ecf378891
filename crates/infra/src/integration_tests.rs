//! Integration tests for the full tiered pipeline.
//!
//! Tests: Envelope → main → retry → error, and bounded recovery over error,
//! with real worker threads on the in-memory bus.
//!
//! Verifies:
//! - Transient failures advance exactly one tier per failure
//! - Permanent failures never leave their tier
//! - A republish that fails leaves the source record to be redelivered
//! - Recovery processes only what existed when it started, then stops
//! - Per-partition order is preserved

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use orderflow_core::OrderReceived;
    use orderflow_events::{
        ChannelConsumer, ChannelPublisher, Envelope, EventCodec, EventHandler, InMemoryBus,
        InMemoryConsumer, OrderReceivedCodec, Retryable, RetryableClassifier, Tier, TierTopology,
    };

    use crate::recovery::RecoveryController;
    use crate::tier_processor::TierProcessor;
    use crate::workers::tier_worker::{TierStats, TierWorker, WorkerHandle};

    const TICK: Duration = Duration::from_millis(10);

    #[derive(Debug, Clone, Copy, thiserror::Error)]
    enum StubError {
        #[error("downstream timed out")]
        Timeout,
        #[error("order cannot be processed")]
        Malformed,
    }

    impl Retryable for StubError {
        fn is_retryable(&self) -> bool {
            matches!(self, StubError::Timeout)
        }
    }

    /// Fails the first `failures` attempts per reference, then succeeds.
    struct FlakyHandler {
        failures: usize,
        error: StubError,
        attempts: Mutex<HashMap<String, usize>>,
        seen: Mutex<Vec<String>>,
    }

    impl FlakyHandler {
        fn new(failures: usize, error: StubError) -> Arc<Self> {
            Arc::new(Self {
                failures,
                error,
                attempts: Mutex::new(HashMap::new()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn succeeding() -> Arc<Self> {
            Self::new(0, StubError::Timeout)
        }

        fn always(error: StubError) -> Arc<Self> {
            Self::new(usize::MAX, error)
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl EventHandler<OrderReceived> for FlakyHandler {
        type Error = StubError;

        fn handle(&self, event: &OrderReceived) -> Result<(), StubError> {
            let uri = event.reference_uri().to_string();
            self.seen.lock().unwrap().push(uri.clone());
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(uri).or_insert(0);
            *n += 1;
            if *n <= self.failures {
                Err(self.error)
            } else {
                Ok(())
            }
        }
    }

    fn topology() -> TierTopology {
        TierTopology::default()
    }

    fn publish_order(bus: &InMemoryBus, tier: Tier, uri: &str) {
        let payload = OrderReceivedCodec.encode(&OrderReceived::new(uri)).unwrap();
        bus.publish(&Envelope::new(uri, payload, topology().channel_name(tier)))
            .unwrap();
    }

    fn spawn_with(
        bus: &Arc<InMemoryBus>,
        tier: Tier,
        consumer: InMemoryConsumer,
        handler: Arc<FlakyHandler>,
        recovery: Option<Arc<RecoveryController>>,
    ) -> WorkerHandle {
        let processor = TierProcessor::new(
            tier,
            topology(),
            OrderReceivedCodec,
            handler,
            RetryableClassifier,
            bus.clone(),
        );
        TierWorker::spawn(format!("test-{tier}"), consumer, processor, recovery, TICK).unwrap()
    }

    fn spawn_tier(bus: &Arc<InMemoryBus>, tier: Tier, handler: Arc<FlakyHandler>) -> WorkerHandle {
        let consumer = bus.consumer(topology().channel(tier));
        spawn_with(bus, tier, consumer, handler, None)
    }

    fn feed(bus: &Arc<InMemoryBus>, handler: &Arc<FlakyHandler>) -> Vec<WorkerHandle> {
        [Tier::Main, Tier::Retry]
            .into_iter()
            .map(|tier| spawn_tier(bus, tier, handler.clone()))
            .collect()
    }

    fn recovery_consumer(bus: &Arc<InMemoryBus>) -> (InMemoryConsumer, Arc<RecoveryController>) {
        let channel = topology().channel(Tier::Error);
        let recovery = Arc::new(RecoveryController::new(channel.name()));
        let consumer = bus.consumer_with_listener(channel, recovery.clone());
        (consumer, recovery)
    }

    fn stop(workers: Vec<WorkerHandle>) -> Vec<TierStats> {
        for w in &workers {
            w.request_shutdown();
        }
        workers.into_iter().map(WorkerHandle::join).collect()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn committed(bus: &InMemoryBus, tier: Tier) -> Option<i64> {
        let t = topology();
        bus.committed_offset(&t.channel_name(tier), &t.consumer_group(tier), 0)
    }

    fn decoded(bus: &InMemoryBus, tier: Tier) -> Vec<String> {
        bus.published(&topology().channel_name(tier))
            .into_iter()
            .map(|(_, env)| {
                OrderReceivedCodec
                    .decode(env.payload())
                    .unwrap()
                    .reference_uri()
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn transient_failures_walk_the_whole_chain() {
        let bus = Arc::new(InMemoryBus::new());
        let handler = FlakyHandler::always(StubError::Timeout);
        let workers = feed(&bus, &handler);

        publish_order(&bus, Tier::Main, "/orders/ORD-1");

        assert!(wait_until(|| committed(&bus, Tier::Retry) == Some(1)));
        stop(workers);

        assert_eq!(decoded(&bus, Tier::Retry), vec!["/orders/ORD-1"]);
        assert_eq!(decoded(&bus, Tier::Error), vec!["/orders/ORD-1"]);
        assert_eq!(committed(&bus, Tier::Main), Some(1));
        // handled once on main, once on retry; feed mode never reads error
        assert_eq!(handler.seen().len(), 2);
        assert_eq!(committed(&bus, Tier::Error), None);
    }

    #[test]
    fn success_on_retry_stops_escalation() {
        let bus = Arc::new(InMemoryBus::new());
        let handler = FlakyHandler::new(1, StubError::Timeout);
        let workers = feed(&bus, &handler);

        publish_order(&bus, Tier::Main, "/orders/ORD-2");

        assert!(wait_until(|| committed(&bus, Tier::Retry) == Some(1)));
        let stats = stop(workers);

        assert_eq!(decoded(&bus, Tier::Retry), vec!["/orders/ORD-2"]);
        assert!(decoded(&bus, Tier::Error).is_empty());
        assert_eq!(stats[0].republished, 1);
        assert_eq!(stats[1].succeeded, 1);
    }

    #[test]
    fn permanent_failure_never_leaves_main() {
        let bus = Arc::new(InMemoryBus::new());
        let handler = FlakyHandler::always(StubError::Malformed);
        let workers = feed(&bus, &handler);

        publish_order(&bus, Tier::Main, "/orders/ORD-3");

        assert!(wait_until(|| committed(&bus, Tier::Main) == Some(1)));
        stop(workers);

        assert!(bus.published("order-received-retry").is_empty());
        assert!(bus.published("order-received-error").is_empty());
        assert_eq!(handler.seen(), vec!["/orders/ORD-3"]);
    }

    #[test]
    fn concrete_scenario_republishes_with_retry_channel_key() {
        let bus = Arc::new(InMemoryBus::new());
        let handler = FlakyHandler::always(StubError::Timeout);
        let main = spawn_tier(&bus, Tier::Main, handler);

        publish_order(&bus, Tier::Main, "/order/ORDER-12345");

        assert!(wait_until(|| !bus.published("order-received-retry").is_empty()));
        stop(vec![main]);

        let retried = bus.published("order-received-retry");
        assert_eq!(retried.len(), 1);
        let envelope = &retried[0].1;
        assert_eq!(envelope.key(), "order-received-retry");
        assert_eq!(envelope.destination(), "order-received-retry");
        assert_eq!(envelope.payload(), b"$/order/ORDER-12345");
        assert_eq!(committed(&bus, Tier::Main), Some(1));
    }

    #[test]
    fn failed_republish_is_redelivered_until_it_succeeds() {
        let bus = Arc::new(InMemoryBus::new());
        bus.set_unavailable("order-received-retry", true);
        let handler = FlakyHandler::always(StubError::Timeout);
        let main = spawn_tier(&bus, Tier::Main, handler.clone());

        publish_order(&bus, Tier::Main, "/orders/ORD-4");

        assert!(wait_until(|| main.stats().redelivered >= 2));
        assert_eq!(committed(&bus, Tier::Main), None);

        bus.set_unavailable("order-received-retry", false);
        assert!(wait_until(|| committed(&bus, Tier::Main) == Some(1)));
        let stats = main.shutdown();

        assert_eq!(decoded(&bus, Tier::Retry), vec!["/orders/ORD-4"]);
        assert_eq!(stats.republished, 1);
        assert!(handler.seen().len() >= 3);
    }

    #[test]
    fn per_partition_order_is_preserved() {
        let bus = Arc::new(InMemoryBus::new());
        let handler = FlakyHandler::succeeding();
        let main = spawn_tier(&bus, Tier::Main, handler.clone());

        let uris: Vec<String> = (0..20).map(|i| format!("/orders/ORD-{i}")).collect();
        for uri in &uris {
            publish_order(&bus, Tier::Main, uri);
        }

        assert!(wait_until(|| committed(&bus, Tier::Main) == Some(20)));
        stop(vec![main]);
        assert_eq!(handler.seen(), uris);
    }

    #[test]
    fn recovery_is_bounded_by_the_start_up_snapshot() {
        let bus = Arc::new(InMemoryBus::new());
        for i in 0..3 {
            publish_order(&bus, Tier::Error, &format!("/orders/OLD-{i}"));
        }

        // an earlier run already committed everything; recovery still rereads it
        let mut previous = bus.consumer(topology().channel(Tier::Error));
        while let Some(record) = previous.poll(TICK).unwrap() {
            previous.commit(&record).unwrap();
        }
        drop(previous);

        let (consumer, recovery) = recovery_consumer(&bus);
        // appended after activation: outside this run
        publish_order(&bus, Tier::Error, "/orders/NEW-0");
        publish_order(&bus, Tier::Error, "/orders/NEW-1");

        let handler = FlakyHandler::succeeding();
        let worker = spawn_with(&bus, Tier::Error, consumer, handler.clone(), Some(recovery.clone()));

        assert!(wait_until(|| worker.is_finished()));
        let stats = worker.join();

        assert_eq!(
            handler.seen(),
            vec!["/orders/OLD-0", "/orders/OLD-1", "/orders/OLD-2"]
        );
        assert_eq!(stats.succeeded, 3);
        assert!(stats.finished);
        assert!(recovery.is_complete());
        assert_eq!(committed(&bus, Tier::Error), Some(3));
    }

    #[test]
    fn recovery_finishes_when_retention_removes_the_window() {
        let bus = Arc::new(InMemoryBus::new());
        for i in 0..3 {
            publish_order(&bus, Tier::Error, &format!("/orders/OLD-{i}"));
        }

        let (consumer, recovery) = recovery_consumer(&bus);
        assert_eq!(recovery.snapshot(0).map(|s| s.recovery_offset), Some(2));
        // everything up to the snapshot expires before the worker reads it
        bus.truncate_before("order-received-error", 0, 3);

        let handler = FlakyHandler::succeeding();
        let worker = spawn_with(&bus, Tier::Error, consumer, handler.clone(), Some(recovery.clone()));

        assert!(wait_until(|| worker.is_finished()));
        let stats = worker.join();

        assert!(stats.finished);
        assert_eq!(stats.processed, 0);
        assert!(handler.seen().is_empty());
        assert!(recovery.is_complete());
        assert_eq!(recovery.drained_partitions(), vec![0]);
    }

    #[test]
    fn partially_expired_window_processes_what_remains() {
        let bus = Arc::new(InMemoryBus::new());
        for i in 0..4 {
            publish_order(&bus, Tier::Error, &format!("/orders/OLD-{i}"));
        }

        let (consumer, recovery) = recovery_consumer(&bus);
        bus.truncate_before("order-received-error", 0, 2);

        let handler = FlakyHandler::succeeding();
        let worker = spawn_with(&bus, Tier::Error, consumer, handler.clone(), Some(recovery.clone()));

        assert!(wait_until(|| worker.is_finished()));
        let stats = worker.join();

        assert_eq!(handler.seen(), vec!["/orders/OLD-2", "/orders/OLD-3"]);
        assert_eq!(stats.succeeded, 2);
        assert!(recovery.is_complete());
    }

    #[test]
    fn transient_failure_during_recovery_is_terminal() {
        let bus = Arc::new(InMemoryBus::new());
        publish_order(&bus, Tier::Error, "/orders/ORD-5");
        publish_order(&bus, Tier::Error, "/orders/ORD-6");

        let (consumer, recovery) = recovery_consumer(&bus);
        let handler = FlakyHandler::always(StubError::Timeout);
        let worker = spawn_with(&bus, Tier::Error, consumer, handler.clone(), Some(recovery));

        assert!(wait_until(|| worker.is_finished()));
        let stats = worker.join();

        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.republished, 0);
        // nothing was appended back onto error
        assert_eq!(bus.published("order-received-error").len(), 2);
        assert_eq!(handler.seen().len(), 2);
    }

    #[test]
    fn recovery_over_empty_error_channel_finishes_immediately() {
        let bus = Arc::new(InMemoryBus::new());
        let (consumer, recovery) = recovery_consumer(&bus);
        let handler = FlakyHandler::succeeding();
        let worker = spawn_with(&bus, Tier::Error, consumer, handler.clone(), Some(recovery));

        assert!(wait_until(|| worker.is_finished()));
        let stats = worker.join();
        assert_eq!(stats.processed, 0);
        assert!(handler.seen().is_empty());
    }

    #[test]
    fn recovery_drains_every_partition_independently() {
        let bus = Arc::new(InMemoryBus::with_partitions(3));
        let payload = |uri: &str| OrderReceivedCodec.encode(&OrderReceived::new(uri)).unwrap();
        for (partition, count) in [(0, 2), (1, 0), (2, 3)] {
            for i in 0..count {
                let uri = format!("/orders/P{partition}-{i}");
                bus.publish_to_partition(
                    &Envelope::new(uri.clone(), payload(&uri), "order-received-error"),
                    partition,
                )
                .unwrap();
            }
        }

        let (consumer, recovery) = recovery_consumer(&bus);
        assert_eq!(recovery.snapshots().len(), 3);
        assert_eq!(recovery.drained_partitions(), vec![1]);

        let handler = FlakyHandler::succeeding();
        let worker = spawn_with(&bus, Tier::Error, consumer, handler.clone(), Some(recovery));
        assert!(wait_until(|| worker.is_finished()));
        let stats = worker.join();

        assert_eq!(stats.succeeded, 5);
        let seen = handler.seen();
        let p2: Vec<_> = seen.iter().filter(|u| u.contains("/P2-")).cloned().collect();
        assert_eq!(p2, vec!["/orders/P2-0", "/orders/P2-1", "/orders/P2-2"]);
    }

    #[test]
    fn failed_offset_query_is_retried_before_recovery_starts() {
        let bus = Arc::new(InMemoryBus::new());
        publish_order(&bus, Tier::Error, "/orders/ORD-7");
        bus.fail_offset_queries("order-received-error", true);

        let (consumer, recovery) = recovery_consumer(&bus);
        assert!(recovery.snapshots().is_empty());

        let handler = FlakyHandler::succeeding();
        let worker = spawn_with(&bus, Tier::Error, consumer, handler.clone(), Some(recovery.clone()));

        thread::sleep(Duration::from_millis(50));
        assert!(!worker.is_finished());
        assert!(handler.seen().is_empty());

        bus.fail_offset_queries("order-received-error", false);
        assert!(wait_until(|| worker.is_finished()));
        let stats = worker.join();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(handler.seen(), vec!["/orders/ORD-7"]);
    }

    #[test]
    fn shutdown_stops_an_idle_feed_worker() {
        let bus = Arc::new(InMemoryBus::new());
        let worker = spawn_tier(&bus, Tier::Main, FlakyHandler::succeeding());
        assert!(!worker.is_finished());
        let stats = worker.shutdown();
        assert!(stats.finished);
        assert_eq!(stats.tier, Tier::Main);
    }
}

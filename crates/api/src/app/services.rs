use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use thiserror::Error;
use tracing::{info, warn};

use orderflow_core::{DomainError, OrderReceived, OrderReference};
use orderflow_events::{
    Channel, ChannelConsumer, ChannelPublisher, CodecError, Envelope, EventCodec, InMemoryBus,
    OrderReceivedCodec, Position, PublishError, RebalanceListener, RetryableClassifier, Tier,
    TierTopology,
};
use orderflow_infra::{
    AppConfig, PartitionOffsetSnapshot, RecoveryController, RuntimeMode, TierProcessor, TierStats,
    TierWorker, WorkerHandle,
};

#[cfg(feature = "kafka")]
use orderflow_infra::event_bus::{KafkaChannelConsumer, KafkaChannelPublisher, KafkaSettings};

use crate::handler::OrderReceivedHandler;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    InvalidReference(#[from] DomainError),

    #[error(transparent)]
    Encoding(#[from] CodecError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Result of an administrative publish.
#[derive(Debug, Clone)]
pub struct PublishedOrder {
    pub channel: String,
    pub position: Position,
    pub reference_uri: String,
}

/// Everything the HTTP layer needs: the publish path into `main` and the
/// tier workers this process runs.
pub struct AppServices {
    mode: RuntimeMode,
    topology: TierTopology,
    admin_trigger_path: String,
    publisher: Arc<dyn ChannelPublisher>,
    codec: OrderReceivedCodec,
    recovery: Option<Arc<RecoveryController>>,
    workers: Mutex<Vec<WorkerHandle>>,
    stopped: Mutex<Vec<TierStats>>,
}

impl AppServices {
    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    pub fn topology(&self) -> &TierTopology {
        &self.topology
    }

    pub fn admin_trigger_path(&self) -> &str {
        &self.admin_trigger_path
    }

    /// Publish a synthetic `OrderReceived` for `order` onto the main channel.
    ///
    /// Blocks until the bus acknowledges the record.
    pub fn publish_order_received(&self, order: &str) -> Result<PublishedOrder, TriggerError> {
        let reference = OrderReference::parse(order)?;
        let event = OrderReceived::for_order(&reference);
        let payload = self.codec.encode(&event)?;

        let channel = self.topology.channel_name(Tier::Main);
        let envelope = Envelope::new(event.reference_uri(), payload, channel.clone());
        let position = self.publisher.publish(&envelope)?;

        info!(
            channel = %channel,
            partition = position.partition,
            offset = position.offset,
            reference = %event.reference_uri(),
            "order-received event injected"
        );
        Ok(PublishedOrder {
            channel,
            position,
            reference_uri: event.reference_uri().to_string(),
        })
    }

    /// Current counters of every worker, including ones already stopped.
    pub fn stats(&self) -> Vec<TierStats> {
        let mut stats: Vec<TierStats> = lock(&self.workers).iter().map(|w| w.stats()).collect();
        stats.extend(lock(&self.stopped).iter().cloned());
        stats
    }

    pub fn snapshots(&self) -> Vec<PartitionOffsetSnapshot> {
        self.recovery
            .as_ref()
            .map(|r| r.snapshots())
            .unwrap_or_default()
    }

    /// Stop every worker and wait for it. Blocking.
    pub fn shutdown(&self) {
        let workers: Vec<WorkerHandle> = lock(&self.workers).drain(..).collect();
        for worker in &workers {
            worker.request_shutdown();
        }
        let stopped: Vec<TierStats> = workers.into_iter().map(WorkerHandle::join).collect();
        for stats in &stopped {
            info!(
                tier = %stats.tier,
                processed = stats.processed,
                republished = stats.republished,
                dropped = stats.dropped,
                "tier worker joined"
            );
        }
        lock(&self.stopped).extend(stopped);
    }
}

impl Drop for AppServices {
    fn drop(&mut self) {
        for worker in lock(&self.workers).iter() {
            worker.request_shutdown();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wire the bus backend and start the workers for `config.mode`.
pub fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    #[cfg(feature = "kafka")]
    {
        build_kafka_services(config)
    }
    #[cfg(not(feature = "kafka"))]
    {
        warn!(
            bootstrap_servers = %config.bootstrap_servers,
            "kafka feature not enabled, falling back to the in-memory bus"
        );
        build_in_memory_services(config, Arc::new(InMemoryBus::with_partitions(config.partitions)))
    }
}

/// In-memory wiring (dev/test). The caller keeps `bus` to inspect or seed it.
pub fn build_in_memory_services(
    config: &AppConfig,
    bus: Arc<InMemoryBus>,
) -> anyhow::Result<AppServices> {
    let publisher: Arc<dyn ChannelPublisher> = bus.clone();
    assemble(config, publisher, |channel, listener| {
        Ok(match listener {
            Some(listener) => bus.consumer_with_listener(channel, listener),
            None => bus.consumer(channel),
        })
    })
}

#[cfg(feature = "kafka")]
fn build_kafka_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let settings = KafkaSettings::from_config(config);
    let publisher: Arc<dyn ChannelPublisher> = Arc::new(
        KafkaChannelPublisher::new(&settings).context("failed to create Kafka producer")?,
    );
    assemble(config, publisher, |channel, listener| {
        let name = channel.name().to_string();
        KafkaChannelConsumer::new(&settings, channel, listener)
            .with_context(|| format!("failed to create Kafka consumer for {name}"))
    })
}

fn assemble<C, F>(
    config: &AppConfig,
    publisher: Arc<dyn ChannelPublisher>,
    mut consumer_for: F,
) -> anyhow::Result<AppServices>
where
    C: ChannelConsumer + 'static,
    F: FnMut(Channel, Option<Arc<dyn RebalanceListener>>) -> anyhow::Result<C>,
{
    let topology = config.topology();
    let recovery = match config.mode {
        RuntimeMode::Feed => None,
        RuntimeMode::ErrorRecovery => {
            warn!(
                channel = %topology.channel_name(Tier::Error),
                "error-recovery mode: feed processes must not consume the error channel concurrently"
            );
            Some(Arc::new(RecoveryController::new(
                topology.channel_name(Tier::Error),
            )))
        }
    };

    let mut workers = Vec::with_capacity(config.mode.tiers().len());
    for &tier in config.mode.tiers() {
        let listener = match (tier, &recovery) {
            (Tier::Error, Some(r)) => Some(Arc::clone(r) as Arc<dyn RebalanceListener>),
            _ => None,
        };
        let consumer = consumer_for(topology.channel(tier), listener)?;
        let processor = TierProcessor::new(
            tier,
            topology.clone(),
            OrderReceivedCodec,
            OrderReceivedHandler,
            RetryableClassifier,
            Arc::clone(&publisher),
        );
        let worker = TierWorker::spawn(
            format!("{}-{tier}", topology.namespace()),
            consumer,
            processor,
            recovery.clone(),
            config.poll_interval,
        )
        .with_context(|| format!("failed to spawn {tier} worker"))?;
        workers.push(worker);
    }

    info!(
        mode = config.mode.as_str(),
        workers = workers.len(),
        "tier workers started"
    );

    Ok(AppServices {
        mode: config.mode,
        topology,
        admin_trigger_path: config.admin_trigger_path.clone(),
        publisher,
        codec: OrderReceivedCodec,
        recovery,
        workers: Mutex::new(workers),
        stopped: Mutex::new(Vec::new()),
    })
}

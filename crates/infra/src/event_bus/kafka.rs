//! Kafka transport (rdkafka).
//!
//! - **Publisher**: `FutureProducer`; each publish blocks until the broker
//!   acknowledges or `message.timeout.ms` expires
//! - **Consumer**: `BaseConsumer` per tier with auto-commit disabled; offsets
//!   are committed synchronously one record at a time
//! - **Rebalances**: assignments are forwarded to the tier's
//!   [`RebalanceListener`]; requested seeks to the beginning are applied by
//!   re-assigning the partitions with explicit start offsets
//!
//! Both sides are blocking and meant to be driven from worker threads (or
//! `spawn_blocking`), never from inside an async task.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rdkafka::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use tracing::{info, instrument, warn};

use orderflow_events::{
    Channel, ChannelConsumer, ChannelPublisher, ConsumeError, ConsumedRecord, Envelope,
    OffsetQueryError, PartitionControl, Position, PublishError, RebalanceListener, Watermarks,
};

use crate::config::AppConfig;

/// Broker connection settings shared by publisher and consumers.
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub bootstrap_servers: String,
    pub publish_timeout: Duration,
    /// Bound for watermark queries, seeks and commits.
    pub operation_timeout: Duration,
}

impl KafkaSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            bootstrap_servers: config.bootstrap_servers.clone(),
            publish_timeout: config.publish_timeout,
            operation_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KafkaTransportError {
    #[error("failed to create Kafka client: {0}")]
    Client(String),

    #[error("failed to subscribe to {channel}: {reason}")]
    Subscribe { channel: String, reason: String },
}

pub struct KafkaChannelPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaChannelPublisher {
    pub fn new(settings: &KafkaSettings) -> Result<Self, KafkaTransportError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.bootstrap_servers)
            .set(
                "message.timeout.ms",
                settings.publish_timeout.as_millis().to_string(),
            )
            .set("acks", "all")
            .create()
            .map_err(|e| KafkaTransportError::Client(e.to_string()))?;

        Ok(Self {
            producer,
            timeout: settings.publish_timeout,
        })
    }
}

impl ChannelPublisher for KafkaChannelPublisher {
    #[instrument(
        skip(self, envelope),
        fields(channel = %envelope.destination(), key = %envelope.key()),
        err
    )]
    fn publish(&self, envelope: &Envelope) -> Result<Position, PublishError> {
        let record = FutureRecord::to(envelope.destination())
            .key(envelope.key())
            .payload(envelope.payload())
            .timestamp(envelope.timestamp_millis());

        // Works without a tokio runtime on the calling thread.
        let delivery =
            futures::executor::block_on(self.producer.send(record, Timeout::After(self.timeout)));

        match delivery {
            Ok((partition, offset)) => Ok(Position { partition, offset }),
            Err((err, _)) => Err(publish_error(envelope.destination(), &err, self.timeout)),
        }
    }
}

fn publish_error(channel: &str, err: &KafkaError, waited: Duration) -> PublishError {
    match err {
        KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut) => PublishError::Timeout {
            channel: channel.to_string(),
            waited,
        },
        other => PublishError::Unavailable {
            channel: channel.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Consumer context bridging librdkafka rebalances to a [`RebalanceListener`].
pub struct TierConsumerContext {
    channel: String,
    listener: Option<Arc<dyn RebalanceListener>>,
    timeout: Duration,
    resubscribe: AtomicBool,
}

impl ClientContext for TierConsumerContext {}

impl ConsumerContext for TierConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let (Rebalance::Revoke(tpl), Some(listener)) = (rebalance, &self.listener) {
            let partitions = partitions_of(tpl, &self.channel);
            info!(channel = %self.channel, partitions = ?partitions, "partitions revoked");
            listener.on_partitions_revoked(&partitions);
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let partitions = partitions_of(tpl, &self.channel);
                info!(channel = %self.channel, partitions = ?partitions, "partitions assigned");

                let Some(listener) = &self.listener else {
                    return;
                };
                let control = KafkaPartitionControl {
                    consumer: base_consumer,
                    channel: &self.channel,
                    timeout: self.timeout,
                    seeks: RefCell::new(Vec::new()),
                };
                match listener.on_partitions_assigned(&partitions, &control) {
                    Ok(()) => control.apply_seeks(tpl),
                    Err(err) => {
                        warn!(
                            channel = %self.channel,
                            error = %err,
                            "assignment rejected; re-subscribing on next poll"
                        );
                        self.resubscribe.store(true, Ordering::SeqCst);
                    }
                }
            }
            Rebalance::Error(err) => {
                warn!(channel = %self.channel, error = %err, "rebalance error");
            }
            Rebalance::Revoke(_) => {}
        }
    }
}

fn partitions_of(tpl: &TopicPartitionList, channel: &str) -> Vec<i32> {
    tpl.elements()
        .iter()
        .filter(|e| e.topic() == channel)
        .map(|e| e.partition())
        .collect()
}

struct KafkaPartitionControl<'a> {
    consumer: &'a BaseConsumer<TierConsumerContext>,
    channel: &'a str,
    timeout: Duration,
    seeks: RefCell<Vec<i32>>,
}

impl KafkaPartitionControl<'_> {
    fn query_error(&self, partition: i32, err: KafkaError) -> OffsetQueryError {
        OffsetQueryError {
            channel: self.channel.to_string(),
            partition,
            reason: err.to_string(),
        }
    }

    /// Re-assign with explicit start offsets for the partitions that asked
    /// to start from the beginning.
    fn apply_seeks(&self, assigned: &TopicPartitionList) {
        let seeks = self.seeks.borrow();
        if seeks.is_empty() {
            return;
        }

        let mut tpl = TopicPartitionList::new();
        for elem in assigned.elements() {
            let offset = if elem.topic() == self.channel && seeks.contains(&elem.partition()) {
                Offset::Beginning
            } else {
                elem.offset()
            };
            if let Err(err) = tpl.add_partition_offset(elem.topic(), elem.partition(), offset) {
                warn!(channel = %self.channel, error = %err, "failed to build assignment");
                return;
            }
        }
        if let Err(err) = self.consumer.assign(&tpl) {
            warn!(channel = %self.channel, error = %err, "failed to rewind assignment");
            self.consumer.context().resubscribe.store(true, Ordering::SeqCst);
        }
    }
}

impl PartitionControl for KafkaPartitionControl<'_> {
    fn watermarks(&self, partition: i32) -> Result<Watermarks, OffsetQueryError> {
        let (low, high) = self
            .consumer
            .fetch_watermarks(self.channel, partition, self.timeout)
            .map_err(|e| self.query_error(partition, e))?;
        Ok(Watermarks { low, high })
    }

    fn seek_to_earliest(&self, partition: i32) -> Result<(), OffsetQueryError> {
        self.seeks.borrow_mut().push(partition);
        Ok(())
    }
}

pub struct KafkaChannelConsumer {
    channel: Channel,
    consumer: BaseConsumer<TierConsumerContext>,
    timeout: Duration,
}

impl KafkaChannelConsumer {
    /// Join `channel`'s consumer group and subscribe.
    pub fn new(
        settings: &KafkaSettings,
        channel: Channel,
        listener: Option<Arc<dyn RebalanceListener>>,
    ) -> Result<Self, KafkaTransportError> {
        let context = TierConsumerContext {
            channel: channel.name().to_string(),
            listener,
            timeout: settings.operation_timeout,
            resubscribe: AtomicBool::new(false),
        };

        let consumer: BaseConsumer<TierConsumerContext> = ClientConfig::new()
            .set("bootstrap.servers", &settings.bootstrap_servers)
            .set("group.id", channel.consumer_group())
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .create_with_context(context)
            .map_err(|e| KafkaTransportError::Client(e.to_string()))?;

        consumer
            .subscribe(&[channel.name()])
            .map_err(|e| KafkaTransportError::Subscribe {
                channel: channel.name().to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            channel,
            consumer,
            timeout: settings.operation_timeout,
        })
    }

    fn partition_list(&self, partition: i32, offset: Option<i64>) -> Result<TopicPartitionList, KafkaError> {
        let mut tpl = TopicPartitionList::new();
        match offset {
            Some(offset) => tpl.add_partition_offset(self.channel.name(), partition, Offset::Offset(offset))?,
            None => {
                tpl.add_partition(self.channel.name(), partition);
            }
        }
        Ok(tpl)
    }
}

impl ChannelConsumer for KafkaChannelConsumer {
    fn channel(&self) -> &str {
        self.channel.name()
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedRecord>, ConsumeError> {
        if self.consumer.context().resubscribe.swap(false, Ordering::SeqCst) {
            self.consumer.unsubscribe();
            self.consumer
                .subscribe(&[self.channel.name()])
                .map_err(|e| ConsumeError::Transport(e.to_string()))?;
        }

        match self.consumer.poll(timeout) {
            None => Ok(None),
            Some(Err(err)) => Err(ConsumeError::Transport(err.to_string())),
            Some(Ok(msg)) => Ok(Some(ConsumedRecord {
                channel: msg.topic().to_string(),
                consumer_group: self.channel.consumer_group().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(|k| String::from_utf8_lossy(k).into_owned()),
                payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                timestamp_millis: msg.timestamp().to_millis(),
            })),
        }
    }

    fn commit(&mut self, record: &ConsumedRecord) -> Result<(), ConsumeError> {
        let tpl = self
            .partition_list(record.partition, Some(record.offset + 1))
            .map_err(|e| ConsumeError::Commit(e.to_string()))?;
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| ConsumeError::Commit(e.to_string()))
    }

    fn rewind(&mut self, record: &ConsumedRecord) -> Result<(), ConsumeError> {
        self.consumer
            .seek(
                self.channel.name(),
                record.partition,
                Offset::Offset(record.offset),
                self.timeout,
            )
            .map_err(|e| ConsumeError::Transport(e.to_string()))
    }

    fn pause(&mut self, partition: i32) -> Result<(), ConsumeError> {
        let tpl = self
            .partition_list(partition, None)
            .map_err(|e| ConsumeError::Transport(e.to_string()))?;
        self.consumer
            .pause(&tpl)
            .map_err(|e| ConsumeError::Transport(e.to_string()))
    }
    fn watermarks(&self, partition: i32) -> Result<Watermarks, OffsetQueryError> {
        let (low, high) = self
            .consumer
            .fetch_watermarks(self.channel.name(), partition, self.timeout)
            .map_err(|e| OffsetQueryError {
                channel: self.channel.name().to_string(),
                partition,
                reason: e.to_string(),
            })?;
        Ok(Watermarks { low, high })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_timeout_maps_to_publish_timeout() {
        let err = KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut);
        assert_eq!(
            publish_error("order-received-retry", &err, Duration::from_secs(10)),
            PublishError::Timeout {
                channel: "order-received-retry".to_string(),
                waited: Duration::from_secs(10),
            }
        );
    }

    #[test]
    fn other_delivery_errors_are_unavailable() {
        let err = KafkaError::MessageProduction(RDKafkaErrorCode::UnknownTopicOrPartition);
        let mapped = publish_error("order-received-error", &err, Duration::from_secs(1));
        assert!(matches!(mapped, PublishError::Unavailable { .. }));
        assert_eq!(mapped.channel(), "order-received-error");
    }

    #[test]
    fn partitions_are_filtered_by_channel() {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("order-received-error", 0);
        tpl.add_partition("order-received-error", 2);
        tpl.add_partition("other", 1);
        assert_eq!(partitions_of(&tpl, "order-received-error"), vec![0, 2]);
    }
}

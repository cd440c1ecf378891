//! Tiered record processing.
//!
//! One [`TierProcessor`] serves one tier. For every consumed record it
//! decodes, invokes the handler, classifies a failure and then settles the
//! record's offset:
//!
//! | outcome                        | action                          | offset    |
//! |--------------------------------|---------------------------------|-----------|
//! | success                        | none                            | committed |
//! | permanent failure (any tier)   | logged at error level           | committed |
//! | transient failure, main/retry  | republished to the next tier    | committed |
//! | transient failure, error tier  | logged at error level           | committed |
//! | republish failed               | logged, consumer rewound        | untouched |
//!
//! A publish failure never commits, so the bus redelivers the record and the
//! event is not lost between tiers.

use std::sync::Arc;

use tracing::{error, info, warn};

use orderflow_events::{
    ChannelConsumer, ChannelPublisher, ConsumedRecord, Envelope, EventCodec, EventHandler,
    FailureClassifier, FailureKind, Position, ProcessingOutcome, ReferencedEvent, RepublishKey,
    Tier, TierTopology,
};

/// How a single record was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Handler succeeded; offset committed.
    Completed,
    /// Transient failure moved to `next`; offset committed after the publish.
    Republished { next: Tier, position: Position },
    /// Not retried any further; offset committed.
    Dropped { kind: FailureKind, cause: String },
    /// Republish failed; offset not committed, record will be presented again.
    Redeliver { cause: String },
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Completed => "completed",
            Resolution::Republished { .. } => "republished",
            Resolution::Dropped { .. } => "dropped",
            Resolution::Redeliver { .. } => "redeliver",
        }
    }
}

/// Seam driven by the worker loop.
pub trait RecordProcessor: Send {
    fn tier(&self) -> Tier;

    /// Resolve one record and commit or rewind it on `consumer`.
    fn handle_record(
        &self,
        consumer: &mut dyn ChannelConsumer,
        record: &ConsumedRecord,
    ) -> Resolution;

    /// Reference carried by the record, if its payload decodes.
    fn reference_of(&self, record: &ConsumedRecord) -> Option<String>;
}

pub struct TierProcessor<C, H, F> {
    tier: Tier,
    topology: TierTopology,
    codec: C,
    handler: H,
    classifier: F,
    publisher: Arc<dyn ChannelPublisher>,
    republish_key: RepublishKey,
}

impl<C, H, F> TierProcessor<C, H, F>
where
    C: EventCodec,
    C::Event: ReferencedEvent,
    H: EventHandler<C::Event>,
    F: FailureClassifier<H::Error>,
{
    /// Processor for `tier`; republishes are keyed by the retry channel name.
    pub fn new(
        tier: Tier,
        topology: TierTopology,
        codec: C,
        handler: H,
        classifier: F,
        publisher: Arc<dyn ChannelPublisher>,
    ) -> Self {
        let republish_key = RepublishKey::retry_channel(&topology);
        Self {
            tier,
            topology,
            codec,
            handler,
            classifier,
            publisher,
            republish_key,
        }
    }

    pub fn with_republish_key(mut self, key: RepublishKey) -> Self {
        self.republish_key = key;
        self
    }

    pub fn topology(&self) -> &TierTopology {
        &self.topology
    }

    /// Decode and handle without touching offsets.
    ///
    /// The event is `None` only when decoding failed, which is always a
    /// permanent failure.
    pub fn evaluate(&self, record: &ConsumedRecord) -> (Option<C::Event>, ProcessingOutcome) {
        let event = match self.codec.decode(&record.payload) {
            Ok(event) => event,
            Err(err) => return (None, ProcessingOutcome::PermanentFailure(err.to_string())),
        };

        info!(
            channel = %record.channel,
            partition = record.partition,
            offset = record.offset,
            reference = %event.reference_uri(),
            tier = %self.tier,
            "order received"
        );

        let outcome = match self.handler.handle(&event) {
            Ok(()) => ProcessingOutcome::Success,
            Err(err) => ProcessingOutcome::failure(self.classifier.classify(&err), err.to_string()),
        };
        (Some(event), outcome)
    }

    fn resolve(&self, record: &ConsumedRecord) -> (String, Resolution) {
        let (event, outcome) = self.evaluate(record);
        let reference = event
            .as_ref()
            .map(|e| e.reference_uri().to_string())
            .unwrap_or_default();

        let resolution = match (outcome, event) {
            (ProcessingOutcome::Success, _) => Resolution::Completed,
            (ProcessingOutcome::PermanentFailure(cause), _) => Resolution::Dropped {
                kind: FailureKind::Permanent,
                cause,
            },
            (ProcessingOutcome::TransientFailure(cause), Some(event)) => match self.tier.next() {
                Some(next) => self.republish(event, record, next),
                None => Resolution::Dropped {
                    kind: FailureKind::Transient,
                    cause,
                },
            },
            (ProcessingOutcome::TransientFailure(cause), None) => Resolution::Dropped {
                kind: FailureKind::Transient,
                cause,
            },
        };
        (reference, resolution)
    }

    fn republish(&self, event: C::Event, record: &ConsumedRecord, next: Tier) -> Resolution {
        let event = event.for_republish();
        let payload = match self.codec.encode(&event) {
            Ok(payload) => payload,
            Err(err) => {
                return Resolution::Dropped {
                    kind: FailureKind::Permanent,
                    cause: err.to_string(),
                };
            }
        };

        let key = self
            .republish_key
            .resolve(record.key.as_deref().unwrap_or_default());
        let envelope = Envelope::new(key, payload, self.topology.channel_name(next));

        match self.publisher.publish(&envelope) {
            Ok(position) => Resolution::Republished { next, position },
            Err(err) => Resolution::Redeliver {
                cause: err.to_string(),
            },
        }
    }
}

impl<C, H, F> RecordProcessor for TierProcessor<C, H, F>
where
    C: EventCodec,
    C::Event: ReferencedEvent,
    H: EventHandler<C::Event>,
    F: FailureClassifier<H::Error>,
{
    fn tier(&self) -> Tier {
        self.tier
    }

    fn reference_of(&self, record: &ConsumedRecord) -> Option<String> {
        self.codec
            .decode(&record.payload)
            .ok()
            .map(|event| event.reference_uri().to_string())
    }

    fn handle_record(
        &self,
        consumer: &mut dyn ChannelConsumer,
        record: &ConsumedRecord,
    ) -> Resolution {
        let (reference, resolution) = self.resolve(record);
        let outcome = resolution.as_str();

        match &resolution {
            Resolution::Completed => info!(
                channel = %record.channel,
                partition = record.partition,
                offset = record.offset,
                reference = %reference,
                outcome,
                "order processed"
            ),
            Resolution::Republished { next, position } => info!(
                channel = %record.channel,
                partition = record.partition,
                offset = record.offset,
                reference = %reference,
                outcome,
                next_tier = %next,
                next_partition = position.partition,
                next_offset = position.offset,
                "transient failure; moved to next tier"
            ),
            Resolution::Dropped { kind, cause } => error!(
                channel = %record.channel,
                partition = record.partition,
                offset = record.offset,
                reference = %reference,
                outcome,
                failure = kind.as_str(),
                cause = %cause,
                "order processing failed permanently"
            ),
            Resolution::Redeliver { cause } => warn!(
                channel = %record.channel,
                partition = record.partition,
                offset = record.offset,
                reference = %reference,
                outcome,
                cause = %cause,
                "republish failed; leaving offset uncommitted"
            ),
        }

        let settled = match resolution {
            Resolution::Redeliver { .. } => consumer.rewind(record),
            _ => consumer.commit(record),
        };
        if let Err(err) = settled {
            warn!(
                channel = %record.channel,
                partition = record.partition,
                offset = record.offset,
                error = %err,
                "failed to settle offset"
            );
        }

        resolution
    }
}

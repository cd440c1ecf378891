//! Transport-facing building blocks of the tiered `order-received` pipeline.
//!
//! Everything here is mechanics only: envelopes, wire codecs, channel naming,
//! the publisher/consumer seams and failure classification. The processing
//! loop itself lives in `orderflow-infra`.

pub mod bus;
pub mod channel;
pub mod codec;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{
    ChannelConsumer, ChannelPublisher, ConsumeError, ConsumedRecord, OffsetQueryError,
    PartitionControl, Position, PublishError, RebalanceListener, Watermarks,
};
pub use channel::{Channel, RepublishKey, Tier, TierTopology};
pub use codec::{CodecError, EventCodec, JsonCodec, OrderReceivedCodec};
pub use envelope::Envelope;
pub use event::ReferencedEvent;
pub use handler::{
    EventHandler, FailureClassifier, FailureKind, ProcessingOutcome, Retryable,
    RetryableClassifier,
};
pub use in_memory_bus::{InMemoryBus, InMemoryConsumer};

//! Infrastructure-backed channel transports.
//!
//! The publisher/consumer seams live in `orderflow-events` as pure
//! mechanics, next to the in-memory bus. This module provides the broker
//! implementation.

#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(feature = "kafka")]
pub use kafka::{KafkaChannelConsumer, KafkaChannelPublisher, KafkaSettings, KafkaTransportError};

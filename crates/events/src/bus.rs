//! Channel publishing/consumption abstraction (mechanics only).
//!
//! This module defines the narrow seams the tiered pipeline needs from a
//! message bus: publish an envelope and learn where it landed, poll records
//! from a consumer group, commit/rewind/pause per partition, and react to
//! partition assignment.
//!
//! ## Delivery Guarantees
//!
//! Implementations provide **at-least-once delivery**:
//! - A record whose offset was never committed is presented again (after a
//!   [`ChannelConsumer::rewind`], a restart or a rebalance)
//! - Order is preserved **within a partition** only
//! - Consumers must be idempotent or accept duplicated side effects
//!
//! ## Blocking
//!
//! Both seams are synchronous from the caller's point of view. A publish
//! blocks until the broker acknowledges or the transport's timeout fires,
//! because the caller decides whether to commit based on the result.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Envelope;

/// Broker-acknowledged location of a record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub partition: i32,
    pub offset: i64,
}

/// A record as seen by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub channel: String,
    pub consumer_group: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp_millis: Option<i64>,
}

impl ConsumedRecord {
    pub fn position(&self) -> Position {
        Position {
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// Publishing failure.
///
/// Every variant is transient: the broker may come back, so callers leave
/// the source record uncommitted and let the bus redeliver it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("no acknowledgement from {channel} within {waited:?}")]
    Timeout { channel: String, waited: Duration },

    #[error("{channel} unavailable: {reason}")]
    Unavailable { channel: String, reason: String },
}

impl PublishError {
    pub fn channel(&self) -> &str {
        match self {
            PublishError::Timeout { channel, .. } | PublishError::Unavailable { channel, .. } => {
                channel
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsumeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("offset commit failed: {0}")]
    Commit(String),

    /// The bus side of the subscription is gone; the loop should stop.
    #[error("subscription disconnected")]
    Disconnected,
}

/// End-offset / earliest-offset query (or seek) failed during assignment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("offset query for {channel}[{partition}] failed: {reason}")]
pub struct OffsetQueryError {
    pub channel: String,
    pub partition: i32,
    pub reason: String,
}

/// Publishes envelopes to the channel named by [`Envelope::destination`].
///
/// Implementations must be safe to call from several tier loops at once.
pub trait ChannelPublisher: Send + Sync {
    fn publish(&self, envelope: &Envelope) -> Result<Position, PublishError>;
}

impl<P> ChannelPublisher for Arc<P>
where
    P: ChannelPublisher + ?Sized,
{
    fn publish(&self, envelope: &Envelope) -> Result<Position, PublishError> {
        (**self).publish(envelope)
    }
}

/// A consumer-group member reading one channel.
///
/// Owned by a single processing loop; records of one partition are handed
/// out strictly in log order.
pub trait ChannelConsumer: Send {
    fn channel(&self) -> &str;

    /// Wait up to `timeout` for the next record. `Ok(None)` on timeout.
    fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedRecord>, ConsumeError>;

    /// Mark `record` (and everything before it on its partition) as done.
    fn commit(&mut self, record: &ConsumedRecord) -> Result<(), ConsumeError>;

    /// Reposition the record's partition so the same record is polled again.
    fn rewind(&mut self, record: &ConsumedRecord) -> Result<(), ConsumeError>;

    /// Stop handing out records from `partition` until the next assignment.
    fn pause(&mut self, partition: i32) -> Result<(), ConsumeError>;

    /// Current retained range of `partition` on this channel.
    fn watermarks(&self, partition: i32) -> Result<Watermarks, OffsetQueryError>;
}

impl<C> ChannelConsumer for Box<C>
where
    C: ChannelConsumer + ?Sized,
{
    fn channel(&self) -> &str {
        (**self).channel()
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedRecord>, ConsumeError> {
        (**self).poll(timeout)
    }

    fn commit(&mut self, record: &ConsumedRecord) -> Result<(), ConsumeError> {
        (**self).commit(record)
    }

    fn rewind(&mut self, record: &ConsumedRecord) -> Result<(), ConsumeError> {
        (**self).rewind(record)
    }

    fn pause(&mut self, partition: i32) -> Result<(), ConsumeError> {
        (**self).pause(partition)
    }

    fn watermarks(&self, partition: i32) -> Result<Watermarks, OffsetQueryError> {
        (**self).watermarks(partition)
    }
}

/// Earliest retained offset and end-of-log offset of a partition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Watermarks {
    pub low: i64,
    pub high: i64,
}

/// Offset queries and seeks available while an assignment is being handled.
pub trait PartitionControl {
    fn watermarks(&self, partition: i32) -> Result<Watermarks, OffsetQueryError>;

    fn seek_to_earliest(&self, partition: i32) -> Result<(), OffsetQueryError>;
}

/// Hook invoked by the transport around consumer-group rebalances.
///
/// Rebalances are serialized by the group protocol, so implementations see
/// at most one callback at a time per consumer.
pub trait RebalanceListener: Send + Sync {
    /// Returning an error fails the assignment; the transport retries it.
    fn on_partitions_assigned(
        &self,
        partitions: &[i32],
        control: &dyn PartitionControl,
    ) -> Result<(), OffsetQueryError>;

    fn on_partitions_revoked(&self, _partitions: &[i32]) {}
}

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Transport wrapper around an encoded event.
///
/// This is the unit handed to a [`ChannelPublisher`](crate::ChannelPublisher).
///
/// Notes:
/// - Built fresh for every publish, republishes included; never mutated.
/// - `key` drives partition placement, so it must be stable per logical entity.
/// - `payload` is codec output; the envelope never looks inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    key: String,
    payload: Vec<u8>,
    destination: String,

    /// Creation time, milliseconds since the Unix epoch.
    timestamp_millis: i64,
}

impl Envelope {
    /// Create an envelope stamped with the current wall-clock time.
    pub fn new(key: impl Into<String>, payload: Vec<u8>, destination: impl Into<String>) -> Self {
        Self::with_timestamp(key, payload, destination, Utc::now().timestamp_millis())
    }

    pub fn with_timestamp(
        key: impl Into<String>,
        payload: Vec<u8>,
        destination: impl Into<String>,
        timestamp_millis: i64,
    ) -> Self {
        Self {
            key: key.into(),
            payload,
            destination: destination.into(),
            timestamp_millis,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp_millis
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_stamps_current_time() {
        let before = Utc::now().timestamp_millis();
        let envelope = Envelope::new("k", vec![1, 2], "order-received");
        let after = Utc::now().timestamp_millis();

        assert!(envelope.timestamp_millis() >= before && envelope.timestamp_millis() <= after);
        assert_eq!(envelope.destination(), "order-received");
        assert_eq!(envelope.key(), "k");
        assert_eq!(envelope.payload(), &[1, 2]);
    }
}

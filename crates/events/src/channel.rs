//! Tier chain and channel naming.
//!
//! Three channels form an escalation chain:
//!
//! ```text
//! order-received → order-received-retry → order-received-error
//!      (main)             (retry)                 (error)
//! ```
//!
//! Each tier consumes with its own consumer group so a stuck tier never
//! holds back the others.

use serde::{Deserialize, Serialize};

/// Default consumer-group namespace.
pub const DEFAULT_NAMESPACE: &str = "item-handler";

/// Default base channel name.
pub const DEFAULT_BASE_TOPIC: &str = "order-received";

/// One step of the escalation chain.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Main,
    Retry,
    Error,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Main, Tier::Retry, Tier::Error];

    /// Tier a transient failure escalates to; `None` for the terminal tier.
    pub fn next(self) -> Option<Tier> {
        match self {
            Tier::Main => Some(Tier::Retry),
            Tier::Retry => Some(Tier::Error),
            Tier::Error => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Main => "main",
            Tier::Retry => "retry",
            Tier::Error => "error",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Tier::Main => "",
            Tier::Retry => "-retry",
            Tier::Error => "-error",
        }
    }
}

impl core::fmt::Display for Tier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named channel together with the consumer group that reads it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    name: String,
    consumer_group: String,
}

impl Channel {
    pub fn new(name: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            consumer_group: consumer_group.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }
}

/// Derives channel names and consumer groups for every tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTopology {
    namespace: String,
    base_topic: String,
}

impl TierTopology {
    pub fn new(namespace: impl Into<String>, base_topic: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            base_topic: base_topic.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn channel_name(&self, tier: Tier) -> String {
        format!("{}{}", self.base_topic, tier.suffix())
    }

    /// `<namespace>-<channel>`, e.g. `item-handler-order-received-retry`.
    pub fn consumer_group(&self, tier: Tier) -> String {
        format!("{}-{}", self.namespace, self.channel_name(tier))
    }

    pub fn channel(&self, tier: Tier) -> Channel {
        Channel::new(self.channel_name(tier), self.consumer_group(tier))
    }
}

impl Default for TierTopology {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE, DEFAULT_BASE_TOPIC)
    }
}

/// Key written on envelopes produced by a republish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepublishKey {
    /// Every republished envelope carries this key.
    Fixed(String),
    /// Keep the key of the record being republished.
    Source,
}

impl RepublishKey {
    /// The key historically used for retries: the retry channel's own name.
    pub fn retry_channel(topology: &TierTopology) -> Self {
        Self::Fixed(topology.channel_name(Tier::Retry))
    }

    pub fn resolve<'a>(&'a self, source_key: &'a str) -> &'a str {
        match self {
            RepublishKey::Fixed(key) => key,
            RepublishKey::Source => source_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_chain_ends_at_error() {
        assert_eq!(Tier::Main.next(), Some(Tier::Retry));
        assert_eq!(Tier::Retry.next(), Some(Tier::Error));
        assert_eq!(Tier::Error.next(), None);
    }

    #[test]
    fn default_topology_names() {
        let topology = TierTopology::default();
        assert_eq!(topology.channel_name(Tier::Main), "order-received");
        assert_eq!(topology.channel_name(Tier::Retry), "order-received-retry");
        assert_eq!(topology.channel_name(Tier::Error), "order-received-error");
        assert_eq!(
            topology.consumer_group(Tier::Error),
            "item-handler-order-received-error"
        );
    }

    #[test]
    fn consumer_groups_are_distinct_per_tier() {
        let topology = TierTopology::new("ns", "orders");
        let groups: std::collections::HashSet<_> =
            Tier::ALL.iter().map(|t| topology.consumer_group(*t)).collect();
        assert_eq!(groups.len(), 3);
    }

    #[test]
    fn republish_key_resolution() {
        let topology = TierTopology::default();
        let fixed = RepublishKey::retry_channel(&topology);
        assert_eq!(fixed.resolve("/orders/ORD-1"), "order-received-retry");
        assert_eq!(RepublishKey::Source.resolve("/orders/ORD-1"), "/orders/ORD-1");
    }
}

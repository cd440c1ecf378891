use serde::Serialize;

use orderflow_infra::{PartitionOffsetSnapshot, RuntimeMode, TierStats};

/// Where an administratively injected event landed.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerResponse {
    pub channel: String,
    pub partition: i32,
    pub offset: i64,
    pub reference_uri: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub mode: RuntimeMode,
    pub namespace: String,
    pub tiers: Vec<TierStats>,
    /// Only populated in error-recovery mode.
    pub recovery: Vec<PartitionOffsetSnapshot>,
}

//! Infrastructure layer: tier processing, bounded recovery, workers, config
//! and the Kafka transport.

pub mod config;
pub mod event_bus;
pub mod recovery;
pub mod tier_processor;
pub mod workers;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod log_capture;

pub use config::{AppConfig, ConfigError, RuntimeMode};
pub use recovery::{Admission, PartitionOffsetSnapshot, RecoveryController};
pub use tier_processor::{RecordProcessor, Resolution, TierProcessor};
pub use workers::tier_worker::{TierStats, TierWorker, WorkerHandle};

//! Runtime configuration, read from environment variables.
//!
//! Every variable has a default so a bare `cargo run` starts a feed process
//! against a local broker. Values are read through a lookup function so
//! tests never touch the process environment.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use orderflow_events::channel::{DEFAULT_BASE_TOPIC, DEFAULT_NAMESPACE};
use orderflow_events::{Tier, TierTopology};

pub const IS_ERROR_QUEUE_CONSUMER: &str = "IS_ERROR_QUEUE_CONSUMER";
pub const APPLICATION_NAMESPACE: &str = "APPLICATION_NAMESPACE";
pub const ORDER_RECEIVED_TOPIC: &str = "ORDER_RECEIVED_TOPIC";
pub const BOOTSTRAP_SERVERS: &str = "BOOTSTRAP_SERVERS";
pub const PUBLISH_TIMEOUT_MS: &str = "PUBLISH_TIMEOUT_MS";
pub const POLL_INTERVAL_MS: &str = "POLL_INTERVAL_MS";
pub const PARTITIONS: &str = "PARTITIONS";
pub const HTTP_BIND_ADDR: &str = "HTTP_BIND_ADDR";
pub const ADMIN_TRIGGER_PATH: &str = "ADMIN_TRIGGER_PATH";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name} must be true or false, got {value:?}")]
    InvalidBool { name: &'static str, value: String },

    #[error("{name} must be a positive integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("{name} must be a socket address, got {value:?}")]
    InvalidAddress { name: &'static str, value: String },

    #[error("{name} must not be empty")]
    Empty { name: &'static str },
}

/// Which subscriptions this process runs. Chosen once at start-up.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    /// Normal operation: consume `main` and `retry`.
    Feed,
    /// Operator-triggered sweep over `error`, bounded by start-up snapshots.
    ErrorRecovery,
}

impl RuntimeMode {
    pub fn tiers(self) -> &'static [Tier] {
        match self {
            RuntimeMode::Feed => &[Tier::Main, Tier::Retry],
            RuntimeMode::ErrorRecovery => &[Tier::Error],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeMode::Feed => "feed",
            RuntimeMode::ErrorRecovery => "error_recovery",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub mode: RuntimeMode,
    pub namespace: String,
    pub base_topic: String,
    pub bootstrap_servers: String,
    pub publish_timeout: Duration,
    pub poll_interval: Duration,
    pub partitions: i32,
    pub http_bind_addr: SocketAddr,
    pub admin_trigger_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::Feed,
            namespace: DEFAULT_NAMESPACE.to_string(),
            base_topic: DEFAULT_BASE_TOPIC.to_string(),
            bootstrap_servers: "localhost:9092".to_string(),
            publish_timeout: Duration::from_millis(10_000),
            poll_interval: Duration::from_millis(250),
            partitions: 1,
            http_bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            admin_trigger_path: "/test".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any name → value source; unset or blank means default.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let mode = match get(IS_ERROR_QUEUE_CONSUMER) {
            None => defaults.mode,
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" => RuntimeMode::ErrorRecovery,
                "false" => RuntimeMode::Feed,
                _ => {
                    return Err(ConfigError::InvalidBool {
                        name: IS_ERROR_QUEUE_CONSUMER,
                        value: v,
                    });
                }
            },
        };

        let bootstrap_servers = get(BOOTSTRAP_SERVERS).unwrap_or_else(|| {
            warn!("BOOTSTRAP_SERVERS not set; using {}", defaults.bootstrap_servers);
            defaults.bootstrap_servers.clone()
        });

        let http_bind_addr = match get(HTTP_BIND_ADDR) {
            None => defaults.http_bind_addr,
            Some(v) => v.parse().map_err(|_| ConfigError::InvalidAddress {
                name: HTTP_BIND_ADDR,
                value: v,
            })?,
        };

        let admin_trigger_path = get(ADMIN_TRIGGER_PATH)
            .map(|p| format!("/{}", p.trim_matches('/')))
            .unwrap_or(defaults.admin_trigger_path);
        if admin_trigger_path == "/" {
            return Err(ConfigError::Empty {
                name: ADMIN_TRIGGER_PATH,
            });
        }

        let partitions = number(&get, PARTITIONS, defaults.partitions as u64)?;

        Ok(Self {
            mode,
            namespace: get(APPLICATION_NAMESPACE).unwrap_or(defaults.namespace),
            base_topic: get(ORDER_RECEIVED_TOPIC).unwrap_or(defaults.base_topic),
            bootstrap_servers,
            publish_timeout: Duration::from_millis(number(&get, PUBLISH_TIMEOUT_MS, 10_000)?),
            poll_interval: Duration::from_millis(number(&get, POLL_INTERVAL_MS, 250)?),
            partitions: i32::try_from(partitions).map_err(|_| ConfigError::InvalidNumber {
                name: PARTITIONS,
                value: partitions.to_string(),
            })?,
            http_bind_addr,
            admin_trigger_path,
        })
    }

    pub fn topology(&self) -> TierTopology {
        TierTopology::new(&self.namespace, &self.base_topic)
    }
}

fn number<G>(get: &G, name: &'static str, default: u64) -> Result<u64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(v) => match v.parse::<u64>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(ConfigError::InvalidNumber { name, value: v }),
        },
    }
}

//! Tracing/logging initialization.
//!
//! One JSON object per line on stdout. Event fields are flattened to the
//! top level, so `channel`, `partition`, `offset`, `reference` and `outcome`
//! can be filtered on directly by log tooling.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::SystemTime;

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_DIRECTIVE: &str = "info";

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed (the call is
/// then a no-op).
pub fn init_with_default(directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_timer(SystemTime)
        .with_target(false)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}

//! Logging initialization for the Wharf daemon.
//!
//! Human-readable logs to stdout through `tracing-subscriber`. `RUST_LOG`
//! takes precedence over the configured level.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Call once at startup, before any
/// `tracing` events are emitted.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

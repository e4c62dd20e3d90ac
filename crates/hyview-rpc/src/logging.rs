//! Tracing subscriber setup for the `hyview` binary.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use hyview::Config;

/// Filter for a process: `RUST_LOG` when set, else the configured level.
pub fn filter(config: &Config) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_directive()))
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(config: &Config) {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter(config))
        .try_init();
}

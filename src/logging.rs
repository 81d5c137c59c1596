//! Logging setup
//!
//! The library only emits `tracing` events. Applications that want them
//! printed call [`init`] once at startup.

use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Error returned when a global subscriber is already installed
pub type InitError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Build the filter: `RUST_LOG` wins, otherwise the configured level
fn filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install a compact `fmt` subscriber as the global default
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(config))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .try_init()
}

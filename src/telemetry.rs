//! Telemetry
//!
//! Structured logging setup, following the same `tracing`/`tracing-subscriber`
//! call pattern the teacher's `main.rs` uses, generalized to the two output
//! formats the configuration exposes.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber. Safe to call once per process;
/// a second call returns an error from `tracing`, which we log and ignore
/// rather than panic on (tests may initialize more than once).
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };

    if let Err(e) = result {
        eprintln!("tracing subscriber already initialized: {e}");
    }
}

//! Process wide tracing subscriber.
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("invalid log filter {filter:?}: {reason}")]
    Filter { filter: String, reason: String },
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Install the global subscriber. `RUST_LOG` wins over `config.log_level`.
/// Fails if a subscriber is already installed.
pub fn init_tracing(config: &Config) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| TelemetryError::Filter {
            filter: config.log_level.clone(),
            reason: e.to_string(),
        })?;

    let installed = if config.json_logs {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .try_init()
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_ansi(true);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
    };
    installed.map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))?;

    tracing::info!(
        log_level = %config.log_level,
        json_logs = config.json_logs,
        "tracing initialised"
    );
    Ok(())
}

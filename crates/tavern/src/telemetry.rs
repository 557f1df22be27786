//! Tracing subscriber setup.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::TavernError;
use crate::config::LoggingSettings;

/// Builds the filter: `RUST_LOG` wins over the configured level.
pub fn env_filter(settings: &LoggingSettings) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level))
}

/// Installs the global `tracing` subscriber.
///
/// Fails if a subscriber is already installed (for example by a test
/// harness); callers that don't care can ignore the error.
pub fn init_tracing(settings: &LoggingSettings) -> Result<(), TavernError> {
    let registry = tracing_subscriber::registry().with(env_filter(settings));
    let result = if settings.json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()
    };
    result.map_err(|e| TavernError::Telemetry(e.to_string()))?;
    tracing::info!(level = %settings.level, json = settings.json, "logging initialized");
    Ok(())
}

//! Tracing initialization.
//!
//! Structured, async-aware logging via `tracing`. The filter comes from
//! `RUST_LOG` when set, otherwise from the configured log level, so
//! deployments can raise verbosity per module without touching the config
//! file.

use tracing_subscriber::EnvFilter;

use crate::config::ServiceSettings;
use crate::error::{AppResult, TelemetryError};

/// Install the global subscriber. Call once, before any spans are entered.
pub fn init(settings: &ServiceSettings) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .map_err(|err| TelemetryError::Configuration(format!("bad log filter: {err}")))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|err| TelemetryError::Configuration(format!("tracing init failed: {err}")))
}

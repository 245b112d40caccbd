//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level, so
//! `RUST_LOG=spectro_daq::acquisition=debug` shows per-frame retry detail
//! without touching the config file.

use crate::config::ApplicationConfig;
use crate::error::{AppResult, DaqError};
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber described by `config`.
pub fn init_from_config(config: &ApplicationConfig) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = if config.log_format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| DaqError::Configuration(format!("failed to install tracing subscriber: {e}")))
}

//! # Logging
//!
//! `tracing` subscriber setup. `RUST_LOG` wins over `LOG_LEVEL` when set.

use crate::config::RuntimeConfig;
use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Default filter when neither `RUST_LOG` nor `LOG_LEVEL` is usable.
pub const DEFAULT_LOG_FILTER: &str = "controller_runtime=info";

/// Install the global subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &RuntimeConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_directive(&config.log_level)))
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if config.log_format.eq_ignore_ascii_case("text") {
        builder.try_init()
    } else {
        builder.json().with_current_span(true).try_init()
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}

fn level_directive(level: &str) -> String {
    match level.to_ascii_lowercase().as_str() {
        lvl @ ("error" | "warn" | "info" | "debug" | "trace") => {
            format!("controller_runtime={lvl}")
        }
        other => other.to_string(),
    }
}

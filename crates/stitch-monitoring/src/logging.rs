//! Structured logging using tracing.
//!
//! Pretty output for development, JSON for log aggregation.

use anyhow::Context;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::MonitoringConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured filter. If a subscriber is already
/// installed (another test, an embedding application) this is a no-op.
pub fn init_logging(config: &MonitoringConfig) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_filter)
            .with_context(|| format!("Invalid log filter: {}", config.log_filter))?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if config.json_logs {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true);
        registry.with(json_layer).try_init()
    } else {
        let fmt_layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_file(true)
            .with_line_number(true);
        registry.with(fmt_layer).try_init()
    };

    match installed {
        Ok(()) => info!(
            service_name = %config.service_name,
            log_format = if config.json_logs { "json" } else { "pretty" },
            "Logging initialized"
        ),
        Err(e) => debug!(error = %e, "Tracing subscriber already installed"),
    }
    Ok(())
}

/// Log a result on the way through
pub trait LogExt<T, E> {
    /// Log the error, if any, with `message` as context
    fn log_err(self, message: &str) -> Result<T, E>;
}

impl<T, E: std::fmt::Display> LogExt<T, E> for Result<T, E> {
    fn log_err(self, message: &str) -> Result<T, E> {
        if let Err(ref e) = self {
            tracing::error!(error = %e, "{}", message);
        }
        self
    }
}

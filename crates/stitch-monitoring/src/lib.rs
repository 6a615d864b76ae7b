//! Monitoring for the Stitch flow engine.
//!
//! A [`Monitoring`] value is built once per process and passed to whatever
//! needs it. `start` installs logging and turns on metric export, `stop`
//! turns export off again and logs the final counts.

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stitch_core::OperationEventHandler;
use tracing::{info, warn};

pub mod logging;
pub mod metrics;

pub use crate::logging::{init_logging, LogExt};
pub use crate::metrics::{MetricsEventHandler, MetricsSnapshot};

/// Configuration for the monitoring context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringConfig {
    /// Service name attached to log output
    pub service_name: String,
    /// Log filter directive (e.g. "info,stitch_core=debug")
    pub log_filter: String,
    /// Emit JSON instead of pretty logs
    pub json_logs: bool,
    /// Forward counters to the `metrics` recorder
    pub enable_metrics: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "stitch".to_string(),
            log_filter: "info".to_string(),
            json_logs: false,
            enable_metrics: true,
        }
    }
}

impl MonitoringConfig {
    /// Defaults overridden by `STITCH_LOG` and `STITCH_LOG_JSON`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(filter) = env::var("STITCH_LOG") {
            config.log_filter = filter;
        }
        if let Ok(value) = env::var("STITCH_LOG_JSON") {
            match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => config.json_logs = true,
                "0" | "false" | "no" => config.json_logs = false,
                _ => warn!("Invalid STITCH_LOG_JSON value: {}", value),
            }
        }
        config
    }
}

/// Process-wide monitoring context with explicit lifecycle
pub struct Monitoring {
    config: MonitoringConfig,
    handler: Arc<MetricsEventHandler>,
    running: AtomicBool,
}

impl Monitoring {
    /// Build the context; nothing is installed until [`start`](Self::start)
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            config,
            handler: Arc::new(MetricsEventHandler::new(false)),
            running: AtomicBool::new(false),
        }
    }

    /// Install logging and enable metric export. Idempotent.
    pub fn start(&self) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        init_logging(&self.config)?;
        self.handler.set_exporting(self.config.enable_metrics);
        info!(
            service_name = %self.config.service_name,
            metrics = self.config.enable_metrics,
            "Monitoring started"
        );
        Ok(())
    }

    /// Disable metric export and log the final counts
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.handler.set_exporting(false);
        let snapshot = self.handler.snapshot();
        info!(
            started = snapshot.started,
            succeeded = snapshot.succeeded,
            failed = snapshot.failed,
            suspended = snapshot.suspended,
            "Monitoring stopped"
        );
    }

    /// Whether `start` has been called without a matching `stop`
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Handler to pass to the flow engine
    pub fn event_handler(&self) -> Arc<dyn OperationEventHandler> {
        self.handler.clone()
    }

    /// Current counter values
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.handler.snapshot()
    }

    /// The configuration this context was built with
    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }
}

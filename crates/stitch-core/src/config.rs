//! Engine configuration
//!
//! Defaults are suitable for tests and single-process deployments; every
//! field can be overridden from the environment.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

use crate::CoreError;

/// Flow engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How often the waker polls for due sleeps and finished sub-flows
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Concurrency used by `schedule_flows` when the caller passes 0
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    /// Fail a run whose replayed calls differ from the recorded tape
    #[serde(default = "default_strict_replay")]
    pub strict_replay: bool,
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_concurrency() -> usize {
    4
}

fn default_strict_replay() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            default_concurrency: default_concurrency(),
            strict_replay: default_strict_replay(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `STITCH_*` environment variables on top of
    /// the defaults. Unparsable values are logged and ignored.
    pub fn from_env() -> Result<Self, CoreError> {
        let mut config = Self::default();

        if let Ok(value) = env::var("STITCH_POLL_INTERVAL_MS") {
            match value.parse::<u64>() {
                Ok(ms) => config.poll_interval_ms = ms,
                Err(_) => warn!("Invalid STITCH_POLL_INTERVAL_MS value: {}", value),
            }
        }

        if let Ok(value) = env::var("STITCH_DEFAULT_CONCURRENCY") {
            match value.parse::<usize>() {
                Ok(n) => config.default_concurrency = n,
                Err(_) => warn!("Invalid STITCH_DEFAULT_CONCURRENCY value: {}", value),
            }
        }

        if let Ok(value) = env::var("STITCH_STRICT_REPLAY") {
            match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => config.strict_replay = true,
                "0" | "false" | "no" => config.strict_replay = false,
                _ => warn!("Invalid STITCH_STRICT_REPLAY value: {}", value),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine can't run with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.poll_interval_ms == 0 {
            return Err(CoreError::ConfigurationError(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.default_concurrency == 0 {
            return Err(CoreError::ConfigurationError(
                "default_concurrency must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

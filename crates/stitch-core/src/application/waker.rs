//! Polling waker for due sleeps and finished sub-flows.

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::engine::FlowEngine;
use crate::domain::operation::{Operation, OperationStatus, PendingSuspension};
use crate::CoreError;

/// Handle of a background waker started with [`FlowEngine::spawn_waker`]
pub struct WakerHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl WakerHandle {
    /// Signal the waker to stop and wait for it. A wake pass in progress is
    /// finished first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Waker task ended abnormally");
        }
    }
}

impl FlowEngine {
    /// Resume every suspended operation whose sleep is due or whose watched
    /// operations are all terminal. Returns how many were resumed.
    ///
    /// Losing a resume race to another caller is not an error here.
    pub async fn wake_ready(&self) -> Result<usize, CoreError> {
        let suspended = self.store().list(Some(OperationStatus::Suspended)).await?;
        let mut resumed = 0;

        for operation in suspended {
            let Some(pending) = operation.pending_suspension.as_ref() else {
                continue;
            };
            if !self.is_ready(&operation).await? {
                continue;
            }

            match self.resume(&operation.id, pending.name(), Value::Null).await {
                Ok(summary) => {
                    debug!(
                        operation_id = %operation.id,
                        status = %summary.status,
                        "Woke operation"
                    );
                    resumed += 1;
                }
                Err(CoreError::ConcurrentResumeConflict(_)) | Err(CoreError::ResumeMismatch(_)) => {
                    debug!(operation_id = %operation.id, "Operation was resumed elsewhere");
                }
                Err(e) => {
                    warn!(operation_id = %operation.id, error = %e, "Failed to wake operation");
                }
            }
        }

        Ok(resumed)
    }

    async fn is_ready(&self, operation: &Operation) -> Result<bool, CoreError> {
        match &operation.pending_suspension {
            Some(PendingSuspension::Sleep { wake_at, .. }) => Ok(self.now() >= *wake_at),
            Some(PendingSuspension::SubflowWait { watched_ids, .. }) => {
                for id in watched_ids {
                    // Unknown ids are reported by the wait itself
                    if let Some(watched) = self.store().get(id).await? {
                        if !watched.status.is_terminal() {
                            return Ok(false);
                        }
                    }
                }
                Ok(true)
            }
            Some(PendingSuspension::Interrupt { .. }) | None => Ok(false),
        }
    }

    /// Run [`wake_ready`](Self::wake_ready) every `poll_interval_ms` on a
    /// background task until the returned handle is shut down
    pub fn spawn_waker(&self) -> WakerHandle {
        let (shutdown, mut signal) = watch::channel(false);
        let engine = self.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(engine.config().poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(poll_interval_ms = engine.config().poll_interval_ms, "Waker started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.wake_ready().await {
                            Ok(0) => {}
                            Ok(count) => debug!(count, "Woke suspended operations"),
                            Err(e) => warn!(error = %e, "Wake pass failed"),
                        }
                    }
                    changed = signal.changed() => {
                        if changed.is_err() || *signal.borrow() {
                            info!("Waker shutting down");
                            break;
                        }
                    }
                }
            }
        });

        WakerHandle { shutdown, handle }
    }
}

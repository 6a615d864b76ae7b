//! Operation metrics, recorded through the `metrics` facade and mirrored in
//! local counters for inspection.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use stitch_core::{CoreError, OperationEvent, OperationEventHandler};
use tracing::debug;

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Operations created
    pub started: u64,
    /// Step records written
    pub steps_recorded: u64,
    /// Step records holding an error
    pub step_failures: u64,
    /// Suspensions persisted
    pub suspended: u64,
    /// Resumes that won the transition
    pub resumed: u64,
    /// Operations that succeeded
    pub succeeded: u64,
    /// Operations that failed
    pub failed: u64,
}

/// Event handler counting operation lifecycle events
#[derive(Debug, Default)]
pub struct MetricsEventHandler {
    started: AtomicU64,
    steps_recorded: AtomicU64,
    step_failures: AtomicU64,
    suspended: AtomicU64,
    resumed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    exporting: AtomicBool,
}

impl MetricsEventHandler {
    /// Create a handler; `export` forwards counts to the `metrics` recorder
    pub fn new(export: bool) -> Self {
        let handler = Self::default();
        handler.exporting.store(export, Ordering::Relaxed);
        handler
    }

    /// Turn forwarding to the `metrics` recorder on or off
    pub fn set_exporting(&self, export: bool) {
        self.exporting.store(export, Ordering::Relaxed);
    }

    /// Current counter values
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            steps_recorded: self.steps_recorded.load(Ordering::Relaxed),
            step_failures: self.step_failures.load(Ordering::Relaxed),
            suspended: self.suspended.load(Ordering::Relaxed),
            resumed: self.resumed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn export(&self, event: &OperationEvent) {
        if !self.exporting.load(Ordering::Relaxed) {
            return;
        }
        match event {
            OperationEvent::Started { flow_name, .. } => {
                ::metrics::increment_counter!("stitch_operations_started_total", "flow" => flow_name.clone());
            }
            OperationEvent::StepRecorded { failed, .. } => {
                let outcome = if *failed { "err" } else { "ok" };
                ::metrics::increment_counter!("stitch_steps_recorded_total", "outcome" => outcome);
            }
            OperationEvent::Suspended { kind, .. } => {
                ::metrics::increment_counter!("stitch_operations_suspended_total", "kind" => kind.to_string());
            }
            OperationEvent::Resumed { .. } => {
                ::metrics::increment_counter!("stitch_operations_resumed_total");
            }
            OperationEvent::Succeeded { .. } => {
                ::metrics::increment_counter!("stitch_operations_finished_total", "status" => "succeeded");
            }
            OperationEvent::Failed { .. } => {
                ::metrics::increment_counter!("stitch_operations_finished_total", "status" => "failed");
            }
        }
    }
}

#[async_trait]
impl OperationEventHandler for MetricsEventHandler {
    async fn handle_event(&self, event: &OperationEvent) -> Result<(), CoreError> {
        let counter = match event {
            OperationEvent::Started { .. } => &self.started,
            OperationEvent::StepRecorded { failed, .. } => {
                if *failed {
                    self.step_failures.fetch_add(1, Ordering::Relaxed);
                }
                &self.steps_recorded
            }
            OperationEvent::Suspended { .. } => &self.suspended,
            OperationEvent::Resumed { .. } => &self.resumed,
            OperationEvent::Succeeded { .. } => &self.succeeded,
            OperationEvent::Failed { .. } => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.export(event);

        debug!(
            event_type = event.event_type(),
            operation_id = %event.operation_id(),
            "Operation event"
        );
        Ok(())
    }
}

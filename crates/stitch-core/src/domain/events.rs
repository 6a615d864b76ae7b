use crate::domain::operation::{OperationId, StepKey, SuspensionKind};
use crate::CoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Lifecycle events emitted by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    /// A fresh operation was created
    Started {
        /// Operation id
        operation_id: OperationId,
        /// Flow name
        flow_name: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// A new step record was appended to the tape
    StepRecorded {
        /// Operation id
        operation_id: OperationId,
        /// Key of the recorded step
        step: StepKey,
        /// Whether the recorded outcome is an error
        failed: bool,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// The operation was suspended and persisted
    Suspended {
        /// Operation id
        operation_id: OperationId,
        /// Kind of suspension
        kind: SuspensionKind,
        /// Suspension name
        name: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// A resume won the suspended -> running transition
    Resumed {
        /// Operation id
        operation_id: OperationId,
        /// Suspension name that was resumed
        name: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// The flow body returned a value
    Succeeded {
        /// Operation id
        operation_id: OperationId,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// An error escaped the flow body
    Failed {
        /// Operation id
        operation_id: OperationId,
        /// Error message
        error: String,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
}

impl OperationEvent {
    /// Returns the type of the event as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            OperationEvent::Started { .. } => "operation.started",
            OperationEvent::StepRecorded { .. } => "operation.step_recorded",
            OperationEvent::Suspended { .. } => "operation.suspended",
            OperationEvent::Resumed { .. } => "operation.resumed",
            OperationEvent::Succeeded { .. } => "operation.succeeded",
            OperationEvent::Failed { .. } => "operation.failed",
        }
    }

    /// Returns the operation this event is associated with
    pub fn operation_id(&self) -> &OperationId {
        match self {
            OperationEvent::Started { operation_id, .. }
            | OperationEvent::StepRecorded { operation_id, .. }
            | OperationEvent::Suspended { operation_id, .. }
            | OperationEvent::Resumed { operation_id, .. }
            | OperationEvent::Succeeded { operation_id, .. }
            | OperationEvent::Failed { operation_id, .. } => operation_id,
        }
    }

    /// Returns the timestamp when the event occurred
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            OperationEvent::Started { timestamp, .. }
            | OperationEvent::StepRecorded { timestamp, .. }
            | OperationEvent::Suspended { timestamp, .. }
            | OperationEvent::Resumed { timestamp, .. }
            | OperationEvent::Succeeded { timestamp, .. }
            | OperationEvent::Failed { timestamp, .. } => *timestamp,
        }
    }
}

/// Receives engine events. Handler errors are logged and never fail a run.
#[async_trait]
pub trait OperationEventHandler: Send + Sync {
    /// Handle one event
    async fn handle_event(&self, event: &OperationEvent) -> Result<(), CoreError>;
}

/// Handler that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventHandler;

#[async_trait]
impl OperationEventHandler for NoopEventHandler {
    async fn handle_event(&self, _event: &OperationEvent) -> Result<(), CoreError> {
        Ok(())
    }
}

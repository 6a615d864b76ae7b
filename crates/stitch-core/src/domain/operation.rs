use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Value object: Operation ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub String);

impl OperationId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// A run attempt is executing the flow body
    Running,

    /// Waiting on time, external input or other operations
    Suspended,

    /// Flow body returned a value
    Succeeded,

    /// An error escaped the flow body
    Failed,
}

impl OperationStatus {
    /// `Succeeded` and `Failed` never change again
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationStatus::Succeeded | OperationStatus::Failed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationStatus::Running => "running",
            OperationStatus::Suspended => "suspended",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Identity of one step invocation within a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepKey {
    /// Step name chosen by the flow author
    pub step_name: String,

    /// Number of earlier reaches of the same name in this run
    pub occurrence_index: u32,
}

impl StepKey {
    /// Create a step key
    pub fn new(step_name: impl Into<String>, occurrence_index: u32) -> Self {
        Self {
            step_name: step_name.into(),
            occurrence_index,
        }
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.step_name, self.occurrence_index)
    }
}

/// Frozen outcome of a step. Serialises as `{"ok": value}` or `{"err": message}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    /// Step succeeded with a value
    Ok(Value),
    /// Step failed with a message
    Err(String),
}

impl StepOutcome {
    /// Whether the step failed
    pub fn is_err(&self) -> bool {
        matches!(self, StepOutcome::Err(_))
    }
}

/// One entry of the replay tape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// Step name
    pub step_name: String,

    /// Occurrence index of the name at the time it was first reached
    pub occurrence_index: u32,

    /// Recorded outcome
    pub outcome: StepOutcome,
}

impl StepRecord {
    /// Create a record for `key`
    pub fn new(key: StepKey, outcome: StepOutcome) -> Self {
        Self {
            step_name: key.step_name,
            occurrence_index: key.occurrence_index,
            outcome,
        }
    }

    /// The record's key
    pub fn key(&self) -> StepKey {
        StepKey::new(self.step_name.clone(), self.occurrence_index)
    }

    /// Whether this record was written for `key`
    #[inline]
    pub fn matches(&self, key: &StepKey) -> bool {
        self.step_name == key.step_name && self.occurrence_index == key.occurrence_index
    }
}

/// The three kinds of suspension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SuspensionKind {
    /// Timed sleep
    Sleep,
    /// External input
    Interrupt,
    /// Waiting for other operations to finish
    SubflowWait,
}

impl fmt::Display for SuspensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SuspensionKind::Sleep => "sleep",
            SuspensionKind::Interrupt => "interrupt",
            SuspensionKind::SubflowWait => "subflowWait",
        };
        f.write_str(s)
    }
}

/// What a suspended operation is waiting for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PendingSuspension {
    /// Waiting until `wake_at`
    Sleep {
        /// Step name of the sleep
        name: String,
        /// Earliest time the sleep may complete
        #[serde(rename = "wakeAt")]
        wake_at: DateTime<Utc>,
    },

    /// Waiting for a caller to supply input matching `input_schema`
    Interrupt {
        /// Step name of the interrupt
        name: String,
        /// JSON schema the resume input must satisfy
        #[serde(rename = "inputSchema")]
        input_schema: Value,
    },

    /// Waiting for every watched operation to become terminal
    SubflowWait {
        /// Step name of the wait
        name: String,
        /// Operations being watched, in caller order
        #[serde(rename = "watchedIds")]
        watched_ids: Vec<OperationId>,
    },
}

impl PendingSuspension {
    /// Step name of the suspension point
    pub fn name(&self) -> &str {
        match self {
            PendingSuspension::Sleep { name, .. }
            | PendingSuspension::Interrupt { name, .. }
            | PendingSuspension::SubflowWait { name, .. } => name,
        }
    }

    /// Kind of the suspension point
    pub fn kind(&self) -> SuspensionKind {
        match self {
            PendingSuspension::Sleep { .. } => SuspensionKind::Sleep,
            PendingSuspension::Interrupt { .. } => SuspensionKind::Interrupt,
            PendingSuspension::SubflowWait { .. } => SuspensionKind::SubflowWait,
        }
    }

    /// Whether this suspension was produced by the call `(name, kind)`
    pub fn is_for(&self, name: &str, kind: SuspensionKind) -> bool {
        self.name() == name && self.kind() == kind
    }
}

impl fmt::Display for PendingSuspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind(), self.name())
    }
}

/// Aggregate: one flow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Unique identifier
    pub id: OperationId,

    /// Flow definition that produced this run
    pub flow_name: String,

    /// Current status
    pub status: OperationStatus,

    /// Input the flow was started with
    #[serde(default)]
    pub input: Value,

    /// Replay tape, in first-reach order
    #[serde(default)]
    pub cursor: Vec<StepRecord>,

    /// Present only while suspended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_suspension: Option<PendingSuspension>,

    /// Return value of the flow body, once succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error message, once failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Operation that scheduled this one, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<OperationId>,

    /// Store version, bumped on every conditional update
    #[serde(default)]
    pub version: u64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    /// Create a new running operation
    pub fn new(flow_name: impl Into<String>, input: Value) -> Self {
        let now = Utc::now();
        Self {
            id: OperationId::generate(),
            flow_name: flow_name.into(),
            status: OperationStatus::Running,
            input,
            cursor: Vec::with_capacity(8),
            pending_suspension: None,
            result: None,
            error: None,
            parent_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark the operation as scheduled by `parent`
    pub fn with_parent(mut self, parent: OperationId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    /// Update the timestamp
    #[inline]
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Append a step record to the tape
    pub fn append_step(&mut self, record: StepRecord) {
        self.cursor.push(record);
        self.touch();
    }

    /// Find the record for `key`
    pub fn find_step(&self, key: &StepKey) -> Option<&StepRecord> {
        self.cursor.iter().find(|record| record.matches(key))
    }

    /// Running -> Suspended
    pub fn suspend(&mut self, pending: PendingSuspension) -> Result<(), CoreError> {
        if self.status != OperationStatus::Running {
            return Err(CoreError::FlowFailure(format!(
                "Cannot suspend operation {} in state: {}",
                self.id, self.status
            )));
        }

        self.status = OperationStatus::Suspended;
        self.pending_suspension = Some(pending);
        self.touch();
        Ok(())
    }

    /// Suspended -> Running, handing back what the run was waiting for
    pub fn begin_resume(&mut self) -> Result<PendingSuspension, CoreError> {
        if self.status != OperationStatus::Suspended {
            return Err(CoreError::ResumeMismatch(format!(
                "Operation {} is not suspended (status: {})",
                self.id, self.status
            )));
        }

        let pending = self.pending_suspension.take().ok_or_else(|| {
            CoreError::ResumeMismatch(format!(
                "Operation {} is suspended without a pending suspension",
                self.id
            ))
        })?;

        self.status = OperationStatus::Running;
        self.touch();
        Ok(pending)
    }

    /// Running -> Succeeded
    pub fn succeed(&mut self, result: Value) -> Result<(), CoreError> {
        if self.status != OperationStatus::Running {
            return Err(CoreError::FlowFailure(format!(
                "Cannot complete operation {} in state: {}",
                self.id, self.status
            )));
        }

        self.status = OperationStatus::Succeeded;
        self.result = Some(result);
        self.touch();
        Ok(())
    }

    /// Running -> Failed
    pub fn fail(&mut self, error: String) -> Result<(), CoreError> {
        if self.status != OperationStatus::Running {
            return Err(CoreError::FlowFailure(format!(
                "Cannot fail operation {} in state: {}",
                self.id, self.status
            )));
        }

        self.status = OperationStatus::Failed;
        self.error = Some(error);
        self.touch();
        Ok(())
    }

    /// Read-only projection without the replay tape
    pub fn view(&self) -> OperationView {
        OperationView {
            id: self.id.clone(),
            flow_name: self.flow_name.clone(),
            status: self.status,
            pending_suspension: self.pending_suspension.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            step_count: self.cursor.len(),
            parent_id: self.parent_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Status projection of an operation handed to external callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationView {
    /// Operation id
    pub id: OperationId,
    /// Flow name
    pub flow_name: String,
    /// Current status
    pub status: OperationStatus,
    /// Pending suspension, if suspended
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_suspension: Option<PendingSuspension>,
    /// Result, if succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error, if failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of recorded steps
    pub step_count: usize,
    /// Scheduling parent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<OperationId>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

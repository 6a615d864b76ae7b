//! Per-run execution context
//!
//! A [`FlowContext`] is handed to the flow body for one run attempt. It owns
//! the checked-out [`Operation`] and memoizes every step on its replay tape:
//! the first reach of a `(name, occurrence)` key runs the step and records
//! the outcome, every later reach returns the recorded outcome.
//!
//! Suspension is an ordinary return value. Primitives return
//! `Err(Halt::Suspended(..))` and the body propagates it with `?`. The
//! context also keeps the halt, so a body that swallows it still suspends.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::future::Future;
use tracing::{debug, trace, warn};

use super::engine::FlowEngine;
use crate::domain::events::OperationEvent;
use crate::domain::operation::{
    Operation, OperationId, PendingSuspension, StepKey, StepOutcome, StepRecord, SuspensionKind,
};
use crate::streaming::bridge::ChunkSender;
use crate::CoreError;

/// Why a flow body stopped early
#[derive(Debug, Clone, PartialEq)]
pub enum Halt {
    /// The run is waiting; the engine persists the pending suspension
    Suspended(PendingSuspension),
    /// The run hit an error
    Failed(CoreError),
}

impl Halt {
    /// Whether this halt is a suspension
    pub fn is_suspended(&self) -> bool {
        matches!(self, Halt::Suspended(_))
    }
}

impl From<CoreError> for Halt {
    fn from(err: CoreError) -> Self {
        Halt::Failed(err)
    }
}

impl Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Halt::Suspended(pending) => write!(f, "suspended on {}", pending),
            Halt::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// Result type of flow bodies and flow context calls
pub type FlowResult<T> = Result<T, Halt>;

/// How a run attempt ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The body returned a value
    Completed(Value),
    /// The body is waiting
    Suspended(PendingSuspension),
    /// An error escaped the body
    Failed(CoreError),
}

impl From<Halt> for RunOutcome {
    fn from(halt: Halt) -> Self {
        match halt {
            Halt::Suspended(pending) => RunOutcome::Suspended(pending),
            Halt::Failed(e) => RunOutcome::Failed(e),
        }
    }
}

/// Suspension a run was resumed from, with the caller's input
#[derive(Debug, Clone)]
pub(crate) struct ResumeSignal {
    pub(crate) pending: PendingSuspension,
    pub(crate) input: Value,
}

/// What the engine takes back from a finished run attempt
pub(crate) struct Settled {
    pub(crate) operation: Operation,
    pub(crate) outcome: RunOutcome,
    pub(crate) events: Vec<OperationEvent>,
}

/// Execution context of one run attempt
pub struct FlowContext {
    operation: Operation,
    /// Next unread record on the tape
    position: usize,
    /// Reaches per step name during this attempt
    occurrences: HashMap<String, u32>,
    resuming: Option<ResumeSignal>,
    halted: Option<Halt>,
    events: Vec<OperationEvent>,
    engine: FlowEngine,
    chunks: Option<ChunkSender<Value>>,
    strict: bool,
}

impl FlowContext {
    pub(crate) fn new(
        engine: FlowEngine,
        operation: Operation,
        resuming: Option<ResumeSignal>,
        chunks: Option<ChunkSender<Value>>,
    ) -> Self {
        let strict = engine.config().strict_replay;
        Self {
            operation,
            position: 0,
            occurrences: HashMap::new(),
            resuming,
            halted: None,
            events: Vec::new(),
            engine,
            chunks,
            strict,
        }
    }

    /// Id of the running operation
    pub fn operation_id(&self) -> &OperationId {
        &self.operation.id
    }

    /// Name of the running flow
    pub fn flow_name(&self) -> &str {
        &self.operation.flow_name
    }

    /// Emit a chunk to the streaming reader of this run, if there is one.
    /// Returns whether the chunk was delivered.
    pub fn send_chunk(&self, chunk: Value) -> bool {
        match &self.chunks {
            Some(sender) => sender.send(chunk),
            None => false,
        }
    }

    /// Run a memoized step.
    ///
    /// On the first reach of this `(name, occurrence)` key `f` is invoked and
    /// its outcome recorded; afterwards the recorded outcome is returned
    /// without calling `f`. A recorded error surfaces as
    /// `CoreError::StepFailure` on every reach; the body may catch it.
    pub async fn run_step<T, E, F, Fut>(&mut self, name: &str, f: F) -> FlowResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        E: Display + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        self.check_halted()?;
        let key = self.next_key(name);

        if let Some(outcome) = self.replay(&key)? {
            trace!(operation_id = %self.operation.id, step = %key, "Replaying recorded step");
            return self.surface(&key, outcome);
        }

        self.enter_fresh(&key)?;
        debug!(operation_id = %self.operation.id, step = %key, "Running step");
        let outcome = outcome_of(f().await);
        self.record(key.clone(), outcome.clone());

        // Fresh and replayed reaches observe the same decoded value
        self.surface(&key, outcome)
    }

    pub(crate) fn settle(mut self, returned: FlowResult<Value>) -> Settled {
        let outcome = if let Some(halt) = self.halted.take() {
            if returned.is_ok() {
                warn!(
                    operation_id = %self.operation.id,
                    halt = %halt,
                    "Flow body returned after halting; keeping the halt"
                );
            }
            RunOutcome::from(halt)
        } else if let Some(signal) = self.resuming.as_ref().filter(|_| self.strict) {
            RunOutcome::Failed(CoreError::ReplayDivergence {
                expected: format!("resume of {}", signal.pending),
                found: "end of flow".to_string(),
            })
        } else {
            match returned {
                Ok(value) => RunOutcome::Completed(value),
                Err(halt) => RunOutcome::from(halt),
            }
        };

        Settled {
            operation: self.operation,
            outcome,
            events: self.events,
        }
    }

    pub(super) fn engine(&self) -> &FlowEngine {
        &self.engine
    }

    pub(crate) fn chunk_sender(&self) -> Option<ChunkSender<Value>> {
        self.chunks.clone()
    }

    pub(super) fn check_halted(&self) -> FlowResult<()> {
        match &self.halted {
            Some(halt) => Err(halt.clone()),
            None => Ok(()),
        }
    }

    pub(super) fn next_key(&mut self, name: &str) -> StepKey {
        let occurrence = self.reserve_keys(name, 1);
        StepKey::new(name, occurrence)
    }

    /// Reserve `count` consecutive occurrence indexes, returning the first
    pub(super) fn reserve_keys(&mut self, name: &str, count: u32) -> u32 {
        let counter = self.occurrences.entry(name.to_string()).or_insert(0);
        let base = *counter;
        *counter += count;
        base
    }

    /// Next occurrence index of `name`, without taking it
    pub(super) fn peek_occurrence(&self, name: &str) -> u32 {
        self.occurrences.get(name).copied().unwrap_or(0)
    }

    /// Recorded outcome for `key`, if the tape has it where it is expected
    pub(super) fn take_recorded(&mut self, key: &StepKey) -> Option<StepOutcome> {
        if self.strict {
            let record = self.operation.cursor.get(self.position)?;
            if !record.matches(key) {
                return None;
            }
            let outcome = record.outcome.clone();
            self.position += 1;
            Some(outcome)
        } else {
            let outcome = self.operation.find_step(key).map(|r| r.outcome.clone())?;
            self.position = (self.position + 1).min(self.operation.cursor.len());
            Some(outcome)
        }
    }

    /// Like [`take_recorded`](Self::take_recorded), but a different record at
    /// the current position is a divergence in strict mode
    pub(super) fn replay(&mut self, key: &StepKey) -> FlowResult<Option<StepOutcome>> {
        if let Some(outcome) = self.take_recorded(key) {
            return Ok(Some(outcome));
        }
        if self.strict {
            if let Some(record) = self.operation.cursor.get(self.position) {
                let expected = record.key().to_string();
                return Err(self.diverge(expected, key.to_string()));
            }
        }
        Ok(None)
    }

    /// Check that executing `key` for the first time is consistent with the
    /// tape and any pending resume
    pub(super) fn enter_fresh(&mut self, key: &StepKey) -> FlowResult<()> {
        if !self.strict {
            return Ok(());
        }
        if let Some(record) = self.operation.cursor.get(self.position) {
            let expected = record.key().to_string();
            return Err(self.diverge(expected, key.to_string()));
        }
        if let Some(signal) = &self.resuming {
            let expected = format!("resume of {}", signal.pending);
            return Err(self.diverge(expected, format!("new step {}", key)));
        }
        Ok(())
    }

    /// Consume the resume signal if it belongs to the suspension call
    /// `(name, kind)`
    pub(super) fn take_resume(
        &mut self,
        name: &str,
        kind: SuspensionKind,
    ) -> FlowResult<Option<ResumeSignal>> {
        let belongs = match &self.resuming {
            None => return Ok(None),
            Some(signal) => signal.pending.is_for(name, kind),
        };
        if belongs {
            return Ok(self.resuming.take());
        }
        if !self.strict {
            return Ok(None);
        }

        let expected = self
            .resuming
            .as_ref()
            .map(|signal| format!("resume of {}", signal.pending))
            .unwrap_or_default();
        Err(self.diverge(expected, format!("{} '{}'", kind, name)))
    }

    pub(super) fn record(&mut self, key: StepKey, outcome: StepOutcome) {
        let failed = outcome.is_err();
        self.operation
            .append_step(StepRecord::new(key.clone(), outcome));
        self.position = self.operation.cursor.len();

        trace!(operation_id = %self.operation.id, step = %key, failed, "Recorded step");
        self.events.push(OperationEvent::StepRecorded {
            operation_id: self.operation.id.clone(),
            step: key,
            failed,
            timestamp: self.engine.now(),
        });
    }

    pub(super) fn suspend(&mut self, pending: PendingSuspension) -> Halt {
        debug!(operation_id = %self.operation.id, suspension = %pending, "Suspending run");
        let halt = Halt::Suspended(pending);
        self.halted = Some(halt.clone());
        halt
    }

    pub(super) fn surface<T: DeserializeOwned>(
        &self,
        key: &StepKey,
        outcome: StepOutcome,
    ) -> FlowResult<T> {
        match outcome {
            StepOutcome::Ok(value) => decode(key, value),
            StepOutcome::Err(message) => Err(step_failure(key, message)),
        }
    }

    fn diverge(&mut self, expected: String, found: String) -> Halt {
        warn!(
            operation_id = %self.operation.id,
            expected = %expected,
            found = %found,
            "Replay diverged from the recorded history"
        );
        let halt = Halt::Failed(CoreError::ReplayDivergence { expected, found });
        self.halted = Some(halt.clone());
        halt
    }
}

pub(super) fn outcome_of<T: Serialize, E: Display>(result: Result<T, E>) -> StepOutcome {
    match result {
        Ok(value) => match serde_json::to_value(&value) {
            Ok(json) => StepOutcome::Ok(json),
            Err(e) => StepOutcome::Err(format!("step output is not serializable: {}", e)),
        },
        Err(e) => StepOutcome::Err(e.to_string()),
    }
}

pub(super) fn decode<T: DeserializeOwned>(key: &StepKey, value: Value) -> FlowResult<T> {
    serde_json::from_value(value).map_err(|e| {
        Halt::Failed(CoreError::SerializationError(format!(
            "recorded output of step {} does not decode: {}",
            key, e
        )))
    })
}

pub(super) fn step_failure(key: &StepKey, message: String) -> Halt {
    Halt::Failed(CoreError::StepFailure {
        step: key.step_name.clone(),
        occurrence: key.occurrence_index,
        message,
    })
}

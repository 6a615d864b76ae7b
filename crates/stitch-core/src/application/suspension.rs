//! Suspension primitives: timed sleep, external interrupt and sub-flow wait.
//!
//! None of these write a step record when they suspend. The record is
//! written when the suspension resolves, so the tape only ever holds
//! completed outcomes.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use super::context::{outcome_of, FlowContext, FlowResult};
use crate::domain::operation::{
    Operation, OperationId, OperationStatus, PendingSuspension, StepOutcome, SuspensionKind,
};
use crate::CoreError;

/// Terminal state of a watched operation, as returned by
/// [`FlowContext::wait_for`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubflowResult {
    /// Watched operation
    pub id: OperationId,
    /// `succeeded` or `failed`
    pub status: OperationStatus,
    /// Result, if it succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error, if it failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubflowResult {
    /// Whether the watched operation succeeded
    pub fn succeeded(&self) -> bool {
        self.status == OperationStatus::Succeeded
    }
}

impl From<&Operation> for SubflowResult {
    fn from(op: &Operation) -> Self {
        Self {
            id: op.id.clone(),
            status: op.status,
            result: op.result.clone(),
            error: op.error.clone(),
        }
    }
}

impl FlowContext {
    /// Suspend until `duration` has elapsed.
    ///
    /// The first reach always suspends with `wakeAt = now + duration`. A
    /// resume before `wakeAt` suspends again with the same `wakeAt`; a resume
    /// at or after it completes the step.
    pub async fn sleep(&mut self, name: &str, duration: Duration) -> FlowResult<()> {
        self.check_halted()?;
        let key = self.next_key(name);
        if self.replay(&key)?.is_some() {
            return Ok(());
        }

        let now = self.engine().now();
        if let Some(signal) = self.take_resume(name, SuspensionKind::Sleep)? {
            if let PendingSuspension::Sleep { wake_at, .. } = signal.pending {
                if now >= wake_at {
                    debug!(operation_id = %self.operation_id(), step = %key, "Sleep elapsed");
                    self.record(key, StepOutcome::Ok(json!({ "wakeAt": wake_at.to_rfc3339() })));
                    return Ok(());
                }
                return Err(self.suspend(PendingSuspension::Sleep {
                    name: name.to_string(),
                    wake_at,
                }));
            }
        }

        let delay = chrono::Duration::from_std(duration).map_err(|e| {
            CoreError::ValidationError(format!("sleep '{}' duration out of range: {}", name, e))
        })?;
        Err(self.suspend(PendingSuspension::Sleep {
            name: name.to_string(),
            wake_at: now + delay,
        }))
    }

    /// Suspend until a caller supplies input conforming to `input_schema`.
    ///
    /// The engine validates the input before resuming; `on_resume` receives
    /// it and its outcome becomes the step's recorded outcome.
    pub async fn interrupt<T, E, F, Fut>(
        &mut self,
        name: &str,
        input_schema: Value,
        on_resume: F,
    ) -> FlowResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
        E: Display + Send,
        F: FnOnce(Value) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        self.check_halted()?;
        let key = self.next_key(name);
        if let Some(outcome) = self.replay(&key)? {
            return self.surface(&key, outcome);
        }

        match self.take_resume(name, SuspensionKind::Interrupt)? {
            Some(signal) => {
                debug!(operation_id = %self.operation_id(), step = %key, "Interrupt answered");
                let outcome = outcome_of(on_resume(signal.input).await);
                self.record(key.clone(), outcome.clone());
                self.surface(&key, outcome)
            }
            None => Err(self.suspend(PendingSuspension::Interrupt {
                name: name.to_string(),
                input_schema,
            })),
        }
    }

    /// [`interrupt`](Self::interrupt) that returns the supplied input as is
    pub async fn wait_for_input<T>(&mut self, name: &str, input_schema: Value) -> FlowResult<T>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        self.interrupt(name, input_schema, |input| async move {
            serde_json::from_value::<T>(input)
        })
        .await
    }

    /// Wait until every watched operation is terminal and return their
    /// results in the order given.
    ///
    /// An id the store doesn't know is recorded as a step failure.
    pub async fn wait_for(
        &mut self,
        name: &str,
        watched: &[OperationId],
    ) -> FlowResult<Vec<SubflowResult>> {
        self.check_halted()?;
        let key = self.next_key(name);
        if let Some(outcome) = self.replay(&key)? {
            return self.surface(&key, outcome);
        }
        self.take_resume(name, SuspensionKind::SubflowWait)?;

        let store = self.engine().store().clone();
        let mut results = Vec::with_capacity(watched.len());
        let mut outstanding = 0usize;
        for id in watched {
            match store.get(id).await? {
                Some(op) if op.status.is_terminal() => results.push(SubflowResult::from(&op)),
                Some(_) => outstanding += 1,
                None => {
                    let outcome = StepOutcome::Err(format!("Watched operation not found: {}", id));
                    self.record(key.clone(), outcome.clone());
                    return self.surface(&key, outcome);
                }
            }
        }

        if outstanding > 0 {
            debug!(
                operation_id = %self.operation_id(),
                step = %key,
                outstanding,
                "Sub-flows still running"
            );
            return Err(self.suspend(PendingSuspension::SubflowWait {
                name: name.to_string(),
                watched_ids: watched.to_vec(),
            }));
        }

        let outcome = outcome_of(Ok::<_, CoreError>(results));
        self.record(key.clone(), outcome.clone());
        self.surface(&key, outcome)
    }

    /// Start a child operation of `flow_name`. The dispatch is a memoized
    /// step, so replays return the same child id without starting another.
    pub async fn schedule_flow(
        &mut self,
        step_name: &str,
        flow_name: &str,
        input: Value,
    ) -> FlowResult<OperationId> {
        let engine = self.engine().clone();
        let parent = self.operation_id().clone();
        let flow_name = flow_name.to_string();
        self.run_step(step_name, move || async move {
            engine.dispatch(&flow_name, input, Some(parent)).await
        })
        .await
    }

    /// Start several child operations through a memoized fan-out, at most
    /// `concurrency` dispatches at a time (0 uses the configured default).
    pub async fn schedule_flows(
        &mut self,
        step_name: &str,
        flows: Vec<(String, Value)>,
        concurrency: usize,
    ) -> FlowResult<Vec<OperationId>> {
        let engine = self.engine().clone();
        let parent = self.operation_id().clone();
        self.map(step_name, flows, concurrency, move |(flow_name, input)| {
            let engine = engine.clone();
            let parent = parent.clone();
            async move { engine.dispatch(&flow_name, input, Some(parent)).await }
        })
        .await
    }
}

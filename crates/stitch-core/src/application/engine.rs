use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::context::{FlowContext, ResumeSignal, RunOutcome};
use super::flow::Flow;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::domain::events::{NoopEventHandler, OperationEvent, OperationEventHandler};
use crate::domain::operation::{
    Operation, OperationId, OperationStatus, OperationView, PendingSuspension,
};
use crate::domain::store::OperationStore;
use crate::streaming::bridge::{ChunkSender, StreamingBridge, StreamingResponse};
use crate::validation::{JsonSchemaValidator, SchemaValidator};
use crate::CoreError;

/// Outcome of a `start` or `resume` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Operation id
    pub id: OperationId,

    /// Status after the run attempt
    pub status: OperationStatus,

    /// Result, if the flow succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error, if the flow failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// What the operation waits for, if suspended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_suspension: Option<PendingSuspension>,
}

impl From<&Operation> for RunSummary {
    fn from(op: &Operation) -> Self {
        Self {
            id: op.id.clone(),
            status: op.status,
            result: op.result.clone(),
            error: op.error.clone(),
            pending_suspension: op.pending_suspension.clone(),
        }
    }
}

struct EngineInner {
    store: Arc<dyn OperationStore>,
    flows: DashMap<String, Arc<dyn Flow>>,
    clock: Arc<dyn Clock>,
    validator: Arc<dyn SchemaValidator>,
    event_handler: Arc<dyn OperationEventHandler>,
    config: EngineConfig,
}

/// Drives flow runs from start or resume to suspension or completion.
///
/// Cloning is cheap; clones share the registry, store and collaborators.
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

/// Builder for [`FlowEngine`]
pub struct FlowEngineBuilder {
    store: Arc<dyn OperationStore>,
    clock: Arc<dyn Clock>,
    validator: Arc<dyn SchemaValidator>,
    event_handler: Arc<dyn OperationEventHandler>,
    config: EngineConfig,
}

impl FlowEngineBuilder {
    /// Start from defaults: system clock, JSON Schema validation, no-op
    /// event handler and default configuration
    pub fn new(store: Arc<dyn OperationStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            validator: Arc::new(JsonSchemaValidator),
            event_handler: Arc::new(NoopEventHandler),
            config: EngineConfig::default(),
        }
    }

    /// Time source for sleeps
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validator for interrupt inputs
    pub fn validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Receiver of lifecycle events
    pub fn event_handler(mut self, handler: Arc<dyn OperationEventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// Engine configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and build the engine
    pub fn build(self) -> Result<FlowEngine, CoreError> {
        self.config.validate()?;
        Ok(self.assemble())
    }

    fn assemble(self) -> FlowEngine {
        FlowEngine {
            inner: Arc::new(EngineInner {
                store: self.store,
                flows: DashMap::new(),
                clock: self.clock,
                validator: self.validator,
                event_handler: self.event_handler,
                config: self.config,
            }),
        }
    }
}

impl FlowEngine {
    /// Engine with default collaborators
    pub fn new(store: Arc<dyn OperationStore>) -> Self {
        FlowEngineBuilder::new(store).assemble()
    }

    /// Builder with custom collaborators
    pub fn builder(store: Arc<dyn OperationStore>) -> FlowEngineBuilder {
        FlowEngineBuilder::new(store)
    }

    /// Register a flow under its name, replacing any earlier registration
    pub fn register<F: Flow + 'static>(&self, flow: F) {
        let name = flow.name().to_string();
        debug!(flow = %name, "Registering flow");
        self.inner.flows.insert(name, Arc::new(flow));
    }

    /// Names of registered flows
    pub fn flow_names(&self) -> Vec<String> {
        self.inner.flows.iter().map(|e| e.key().clone()).collect()
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Operation store
    pub fn store(&self) -> &Arc<dyn OperationStore> {
        &self.inner.store
    }

    /// Current time according to the engine clock
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Create a fresh operation for `flow_name` and run it until it
    /// suspends or finishes
    pub async fn start(&self, flow_name: &str, input: Value) -> Result<RunSummary, CoreError> {
        self.start_with(flow_name, input, None).await
    }

    /// Resume the operation suspended on `suspension_name`.
    ///
    /// Fails without touching the stored record when the operation is not
    /// suspended on that name or the input doesn't match an interrupt's
    /// schema. Of several concurrent resumes only one wins; the others get
    /// `CoreError::ConcurrentResumeConflict`. If the winner's run attempt
    /// errors before its outcome is stored, the operation is suspended again.
    pub async fn resume(
        &self,
        id: &OperationId,
        suspension_name: &str,
        input: Value,
    ) -> Result<RunSummary, CoreError> {
        let mut operation = self.load(id).await?;

        match operation.status {
            OperationStatus::Suspended => {}
            OperationStatus::Running => {
                return Err(CoreError::ConcurrentResumeConflict(format!(
                    "Operation {} is already running",
                    id
                )))
            }
            status => {
                return Err(CoreError::ResumeMismatch(format!(
                    "Operation {} has already finished ({})",
                    id, status
                )))
            }
        }

        let pending = operation.pending_suspension.as_ref().ok_or_else(|| {
            CoreError::ResumeMismatch(format!(
                "Operation {} is suspended without a pending suspension",
                id
            ))
        })?;
        if pending.name() != suspension_name {
            return Err(CoreError::ResumeMismatch(format!(
                "Operation {} is waiting on {}, not '{}'",
                id, pending, suspension_name
            )));
        }
        if let PendingSuspension::Interrupt { input_schema, .. } = pending {
            self.inner
                .validator
                .validate(&input, input_schema)
                .map_err(|reason| {
                    CoreError::ResumeMismatch(format!(
                        "Input for '{}' rejected: {}",
                        suspension_name, reason
                    ))
                })?;
        }

        let flow = self.flow(&operation.flow_name)?;

        // Single-winner transition: only one writer can move from this version
        let expected = operation.version;
        let pending = operation.begin_resume()?;
        operation.version = match self.inner.store.update(&operation, expected).await {
            Ok(version) => version,
            Err(CoreError::VersionConflict { .. }) => {
                return Err(CoreError::ConcurrentResumeConflict(format!(
                    "Operation {} was resumed by another caller",
                    id
                )))
            }
            Err(e) => return Err(e),
        };

        info!(operation_id = %id, suspension = %pending, "Resuming operation");
        self.emit(OperationEvent::Resumed {
            operation_id: id.clone(),
            name: pending.name().to_string(),
            timestamp: self.now(),
        })
        .await;

        let checkpoint = operation.clone();
        let signal = ResumeSignal {
            pending: pending.clone(),
            input,
        };
        match self.execute(flow, operation, Some(signal), None).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                self.restore_suspension(checkpoint, pending).await;
                Err(e)
            }
        }
    }

    /// Read-only status of an operation
    pub async fn get_status(&self, id: &OperationId) -> Result<OperationView, CoreError> {
        Ok(self.load(id).await?.view())
    }

    /// Full operation record, replay tape included
    pub async fn get_operation(&self, id: &OperationId) -> Result<Operation, CoreError> {
        self.load(id).await
    }

    /// Start a fresh run whose body may emit chunks with
    /// [`FlowContext::send_chunk`]. The final value is the run's summary; a
    /// failed run ends the stream with an error record.
    pub async fn start_streaming(
        &self,
        flow_name: &str,
        input: Value,
    ) -> Result<StreamingResponse<Value, RunSummary>, CoreError> {
        self.flow(flow_name)?;

        let engine = self.clone();
        let flow_name = flow_name.to_string();
        StreamingBridge::start(move |sink: ChunkSender<Value>| async move {
            let summary = engine.start_with(&flow_name, input, Some(sink)).await?;
            match summary.status {
                OperationStatus::Failed => Err(CoreError::FlowFailure(
                    summary.error.unwrap_or_else(|| "flow failed".to_string()),
                )),
                _ => Ok(summary),
            }
        })
        .await
    }

    /// Create a child operation and run it on a background task
    pub(crate) async fn dispatch(
        &self,
        flow_name: &str,
        input: Value,
        parent: Option<OperationId>,
    ) -> Result<OperationId, CoreError> {
        let flow = self.flow(flow_name)?;
        let mut operation = Operation::new(flow_name, input);
        if let Some(parent) = parent {
            operation = operation.with_parent(parent);
        }
        self.create(&operation).await?;

        let engine = self.clone();
        let id = operation.id.clone();
        tokio::spawn(async move {
            let id = operation.id.clone();
            let run = tokio::spawn({
                let engine = engine.clone();
                async move { engine.execute(flow, operation, None, None).await }
            });
            let reason = match run.await {
                Ok(Ok(_)) => return,
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("Run aborted: {}", e),
            };
            error!(operation_id = %id, error = %reason, "Dispatched operation failed to run");
            engine.fail_unsettled(&id, reason).await;
        });

        Ok(id)
    }

    async fn start_with(
        &self,
        flow_name: &str,
        input: Value,
        chunks: Option<ChunkSender<Value>>,
    ) -> Result<RunSummary, CoreError> {
        let flow = self.flow(flow_name)?;
        let operation = Operation::new(flow_name, input);
        self.create(&operation).await?;
        self.execute(flow, operation, None, chunks).await
    }

    async fn create(&self, operation: &Operation) -> Result<(), CoreError> {
        self.inner.store.insert(operation).await?;
        info!(
            operation_id = %operation.id,
            flow = %operation.flow_name,
            parent_id = ?operation.parent_id.as_ref().map(|p| p.as_str()),
            "Started operation"
        );
        self.emit(OperationEvent::Started {
            operation_id: operation.id.clone(),
            flow_name: operation.flow_name.clone(),
            timestamp: self.now(),
        })
        .await;
        Ok(())
    }

    /// Run the flow body once over `operation` and persist the outcome
    async fn execute(
        &self,
        flow: Arc<dyn Flow>,
        operation: Operation,
        resuming: Option<ResumeSignal>,
        chunks: Option<ChunkSender<Value>>,
    ) -> Result<RunSummary, CoreError> {
        let span = info_span!("flow_run", operation_id = %operation.id, flow = %operation.flow_name);
        let input = operation.input.clone();

        let mut ctx = FlowContext::new(self.clone(), operation, resuming, chunks);
        let returned = flow.run(&mut ctx, input).instrument(span).await;
        let settled = ctx.settle(returned);

        let mut operation = settled.operation;
        let expected = operation.version;
        let terminal_event = match &settled.outcome {
            RunOutcome::Completed(value) => {
                operation.succeed(value.clone())?;
                OperationEvent::Succeeded {
                    operation_id: operation.id.clone(),
                    timestamp: self.now(),
                }
            }
            RunOutcome::Suspended(pending) => {
                operation.suspend(pending.clone())?;
                OperationEvent::Suspended {
                    operation_id: operation.id.clone(),
                    kind: pending.kind(),
                    name: pending.name().to_string(),
                    timestamp: self.now(),
                }
            }
            RunOutcome::Failed(e) => {
                operation.fail(e.to_string())?;
                OperationEvent::Failed {
                    operation_id: operation.id.clone(),
                    error: e.to_string(),
                    timestamp: self.now(),
                }
            }
        };

        operation.version = self.inner.store.update(&operation, expected).await?;
        info!(
            operation_id = %operation.id,
            flow = %operation.flow_name,
            status = %operation.status,
            steps = operation.cursor.len(),
            "Run attempt settled"
        );

        for event in settled.events {
            self.emit(event).await;
        }
        self.emit(terminal_event).await;

        Ok(RunSummary::from(&operation))
    }

    /// Put a resumed operation back on its suspension after its run attempt
    /// errored, so it can be resumed again
    async fn restore_suspension(&self, mut operation: Operation, pending: PendingSuspension) {
        let expected = operation.version;
        let restored = match operation.suspend(pending) {
            Ok(()) => self.inner.store.update(&operation, expected).await,
            Err(e) => Err(e),
        };
        match restored {
            Ok(_) => warn!(
                operation_id = %operation.id,
                "Run attempt errored; operation is suspended again"
            ),
            Err(e) => error!(
                operation_id = %operation.id,
                error = %e,
                "Failed to restore suspended operation"
            ),
        }
    }

    /// Fail an operation whose run ended without persisting an outcome
    async fn fail_unsettled(&self, id: &OperationId, reason: String) {
        let failed = async {
            let mut operation = self.load(id).await?;
            if operation.status != OperationStatus::Running {
                return Ok(false);
            }
            let expected = operation.version;
            operation.fail(reason.clone())?;
            self.inner.store.update(&operation, expected).await?;
            Ok::<_, CoreError>(true)
        }
        .await;

        match failed {
            Ok(true) => {
                self.emit(OperationEvent::Failed {
                    operation_id: id.clone(),
                    error: reason,
                    timestamp: self.now(),
                })
                .await
            }
            Ok(false) => {}
            Err(e) => error!(operation_id = %id, error = %e, "Failed to mark operation as failed"),
        }
    }

    async fn load(&self, id: &OperationId) -> Result<Operation, CoreError> {
        self.inner
            .store
            .get(id)
            .await?
            .ok_or_else(|| CoreError::OperationNotFound(id.to_string()))
    }

    fn flow(&self, flow_name: &str) -> Result<Arc<dyn Flow>, CoreError> {
        self.inner
            .flows
            .get(flow_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::FlowNotRegistered(flow_name.to_string()))
    }

    async fn emit(&self, event: OperationEvent) {
        if let Err(e) = self.inner.event_handler.handle_event(&event).await {
            warn!(
                event_type = event.event_type(),
                operation_id = %event.operation_id(),
                error = %e,
                "Event handler failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::context::{FlowResult, Halt};
    use crate::clock::ManualClock;
    use crate::domain::store::memory::MemoryOperationStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("stitch_core=debug")
            .with_test_writer()
            .try_init();
    }

    struct Approval;

    #[async_trait]
    impl Flow for Approval {
        fn name(&self) -> &str {
            "approval"
        }

        async fn run(&self, ctx: &mut FlowContext, input: Value) -> FlowResult<Value> {
            let amount = input["amount"].as_u64().unwrap_or(0);
            let quote: u64 = ctx
                .run_step("quote", move || async move { Ok::<_, String>(amount * 2) })
                .await?;
            let approved: bool = ctx
                .wait_for_input("approve", json!({"type": "boolean"}))
                .await?;
            Ok(json!({"quote": quote, "approved": approved}))
        }
    }

    struct Failing;

    #[async_trait]
    impl Flow for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(&self, ctx: &mut FlowContext, _input: Value) -> FlowResult<Value> {
            ctx.run_step("explode", || async { Err::<u32, _>("kaboom") })
                .await?;
            Ok(Value::Null)
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl OperationEventHandler for RecordingHandler {
        async fn handle_event(&self, event: &OperationEvent) -> Result<(), CoreError> {
            self.events.lock().unwrap().push(event.event_type());
            Ok(())
        }
    }

    fn engine() -> (FlowEngine, Arc<MemoryOperationStore>) {
        init_test_tracing();
        let store = Arc::new(MemoryOperationStore::new());
        let engine = FlowEngine::new(store.clone());
        engine.register(Approval);
        engine.register(Failing);
        (engine, store)
    }

    #[tokio::test]
    async fn test_start_suspends_and_resume_completes() {
        let (engine, _) = engine();

        let summary = engine.start("approval", json!({"amount": 21})).await.unwrap();
        assert_eq!(summary.status, OperationStatus::Suspended);
        assert_eq!(
            summary.pending_suspension.as_ref().map(|p| p.name()),
            Some("approve")
        );

        let done = engine.resume(&summary.id, "approve", json!(true)).await.unwrap();
        assert_eq!(done.status, OperationStatus::Succeeded);
        assert_eq!(done.result, Some(json!({"quote": 42, "approved": true})));

        let view = engine.get_status(&summary.id).await.unwrap();
        assert_eq!(view.status, OperationStatus::Succeeded);
        assert_eq!(view.step_count, 2);
    }

    #[test]
    fn test_registered_flow_names() {
        let (engine, _) = engine();
        let mut names = engine.flow_names();
        names.sort();
        assert_eq!(names, vec!["approval", "failing"]);
    }

    #[tokio::test]
    async fn test_unknown_flow_creates_nothing() {
        let (engine, store) = engine();
        let err = engine.start("missing", Value::Null).await.unwrap_err();
        assert_eq!(err, CoreError::FlowNotRegistered("missing".to_string()));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_step_failure_fails_the_operation() {
        let (engine, _) = engine();
        let summary = engine.start("failing", Value::Null).await.unwrap();
        assert_eq!(summary.status, OperationStatus::Failed);
        assert_eq!(
            summary.error.as_deref(),
            Some("Step 'explode' (occurrence 0) failed: kaboom")
        );
    }

    #[tokio::test]
    async fn test_rejected_resumes_leave_the_record_untouched() {
        let (engine, _) = engine();
        let summary = engine.start("approval", json!({"amount": 1})).await.unwrap();
        let before = engine.get_operation(&summary.id).await.unwrap();

        let wrong_name = engine.resume(&summary.id, "other", json!(true)).await;
        assert!(matches!(wrong_name, Err(CoreError::ResumeMismatch(_))));

        let bad_input = engine.resume(&summary.id, "approve", json!("yes")).await;
        assert!(matches!(bad_input, Err(CoreError::ResumeMismatch(_))));

        let missing = engine
            .resume(&OperationId::from("nope"), "approve", json!(true))
            .await;
        assert!(matches!(missing, Err(CoreError::OperationNotFound(_))));

        assert_eq!(engine.get_operation(&summary.id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_resuming_a_finished_operation_is_a_mismatch() {
        let (engine, _) = engine();
        let summary = engine.start("failing", Value::Null).await.unwrap();
        let err = engine.resume(&summary.id, "anything", Value::Null).await.unwrap_err();
        assert!(matches!(err, CoreError::ResumeMismatch(_)));
    }

    /// Store whose reads yield, so concurrent resumes both load the same
    /// version before either writes
    struct YieldingStore(MemoryOperationStore);

    #[async_trait]
    impl OperationStore for YieldingStore {
        async fn get(&self, id: &OperationId) -> Result<Option<Operation>, CoreError> {
            let found = self.0.get(id).await?;
            tokio::task::yield_now().await;
            Ok(found)
        }

        async fn insert(&self, operation: &Operation) -> Result<(), CoreError> {
            self.0.insert(operation).await
        }

        async fn update(&self, operation: &Operation, expected: u64) -> Result<u64, CoreError> {
            self.0.update(operation, expected).await
        }

        async fn list(
            &self,
            status: Option<OperationStatus>,
        ) -> Result<Vec<Operation>, CoreError> {
            self.0.list(status).await
        }

        async fn delete(&self, id: &OperationId) -> Result<(), CoreError> {
            self.0.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_resumes_have_one_winner() {
        let engine = FlowEngine::new(Arc::new(YieldingStore(MemoryOperationStore::new())));
        engine.register(Approval);

        let summary = engine.start("approval", json!({"amount": 5})).await.unwrap();
        let (a, b) = tokio::join!(
            engine.resume(&summary.id, "approve", json!(true)),
            engine.resume(&summary.id, "approve", json!(false)),
        );

        let (won, lost) = match (a, b) {
            (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
            other => panic!("expected exactly one winner, got {:?}", other),
        };
        assert_eq!(won.status, OperationStatus::Succeeded);
        assert!(matches!(lost, CoreError::ConcurrentResumeConflict(_)));

        let view = engine.get_status(&summary.id).await.unwrap();
        assert_eq!(view.step_count, 2);
    }

    #[tokio::test]
    async fn test_events_are_emitted_in_order() {
        let handler = Arc::new(RecordingHandler::default());
        let engine = FlowEngine::builder(Arc::new(MemoryOperationStore::new()))
            .event_handler(handler.clone())
            .build()
            .unwrap();
        engine.register(Approval);

        let summary = engine.start("approval", json!({"amount": 2})).await.unwrap();
        engine.resume(&summary.id, "approve", json!(false)).await.unwrap();

        assert_eq!(
            *handler.events.lock().unwrap(),
            vec![
                "operation.started",
                "operation.step_recorded",
                "operation.suspended",
                "operation.resumed",
                "operation.step_recorded",
                "operation.succeeded",
            ]
        );
    }

    struct Napper {
        naps: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Flow for Napper {
        fn name(&self) -> &str {
            "napper"
        }

        async fn run(&self, ctx: &mut FlowContext, _input: Value) -> FlowResult<Value> {
            ctx.sleep("nap", Duration::from_secs(1)).await?;
            let naps = self.naps.clone();
            let count: usize = ctx
                .run_step("count", move || async move {
                    Ok::<_, String>(naps.fetch_add(1, Ordering::SeqCst) + 1)
                })
                .await?;
            Ok(json!(count))
        }
    }

    #[tokio::test]
    async fn test_sleep_resume_before_and_after_wake_time() {
        let clock = ManualClock::from_millis(0);
        let naps = Arc::new(AtomicUsize::new(0));
        let engine = FlowEngine::builder(Arc::new(MemoryOperationStore::new()))
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        engine.register(Napper { naps: naps.clone() });

        let started = engine.start("napper", Value::Null).await.unwrap();
        let pending = started.pending_suspension.clone();
        assert!(matches!(
            pending,
            Some(PendingSuspension::Sleep { wake_at, .. }) if wake_at.timestamp_millis() == 1_000
        ));

        clock.advance(Duration::from_millis(999));
        let early = engine.resume(&started.id, "nap", Value::Null).await.unwrap();
        assert_eq!(early.status, OperationStatus::Suspended);
        assert_eq!(early.pending_suspension, pending);

        clock.advance(Duration::from_millis(1));
        let done = engine.resume(&started.id, "nap", Value::Null).await.unwrap();
        assert_eq!(done.result, Some(json!(1)));
        assert_eq!(naps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_swallowed_suspension_is_still_persisted() {
        struct Sneaky;

        #[async_trait]
        impl Flow for Sneaky {
            fn name(&self) -> &str {
                "sneaky"
            }

            async fn run(&self, ctx: &mut FlowContext, _input: Value) -> FlowResult<Value> {
                match ctx.wait_for_input::<Value>("input", json!({})).await {
                    Err(Halt::Suspended(_)) => Ok(json!("pretend we finished")),
                    other => other,
                }
            }
        }

        let (engine, _) = engine();
        engine.register(Sneaky);
        let summary = engine.start("sneaky", Value::Null).await.unwrap();
        assert_eq!(summary.status, OperationStatus::Suspended);
        assert!(summary.result.is_none());
    }

    /// Store that fails one update once `countdown` further updates reach it
    struct FlakyStore {
        inner: MemoryOperationStore,
        countdown: AtomicUsize,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryOperationStore::new(),
                countdown: AtomicUsize::new(0),
            }
        }

        fn fail_update(&self, nth: usize) {
            self.countdown.store(nth, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl OperationStore for FlakyStore {
        async fn get(&self, id: &OperationId) -> Result<Option<Operation>, CoreError> {
            self.inner.get(id).await
        }

        async fn insert(&self, operation: &Operation) -> Result<(), CoreError> {
            self.inner.insert(operation).await
        }

        async fn update(&self, operation: &Operation, expected: u64) -> Result<u64, CoreError> {
            let due = self
                .countdown
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if due == Ok(1) {
                return Err(CoreError::StoreError("disk full".to_string()));
            }
            self.inner.update(operation, expected).await
        }

        async fn list(
            &self,
            status: Option<OperationStatus>,
        ) -> Result<Vec<Operation>, CoreError> {
            self.inner.list(status).await
        }

        async fn delete(&self, id: &OperationId) -> Result<(), CoreError> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_failed_write_after_resume_restores_the_suspension() {
        init_test_tracing();
        let store = Arc::new(FlakyStore::new());
        let engine = FlowEngine::new(store.clone());
        engine.register(Approval);

        let summary = engine.start("approval", json!({"amount": 4})).await.unwrap();
        let before = engine.get_operation(&summary.id).await.unwrap();

        // The resume's claim goes through, the write of its outcome does not
        store.fail_update(2);
        let err = engine.resume(&summary.id, "approve", json!(true)).await.unwrap_err();
        assert_eq!(err, CoreError::StoreError("disk full".to_string()));

        let after = engine.get_operation(&summary.id).await.unwrap();
        assert_eq!(after.status, OperationStatus::Suspended);
        assert_eq!(after.pending_suspension, before.pending_suspension);
        assert_eq!(after.cursor, before.cursor);

        let done = engine.resume(&summary.id, "approve", json!(true)).await.unwrap();
        assert_eq!(done.status, OperationStatus::Succeeded);
        assert_eq!(done.result, Some(json!({"quote": 8, "approved": true})));
    }

    struct Panicky;

    #[async_trait]
    impl Flow for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn run(&self, _ctx: &mut FlowContext, _input: Value) -> FlowResult<Value> {
            panic!("child blew up");
        }
    }

    async fn wait_until_finished(engine: &FlowEngine, id: &OperationId) -> OperationView {
        for _ in 0..100 {
            let view = engine.get_status(id).await.unwrap();
            if view.status.is_terminal() {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("operation {} never finished", id);
    }

    #[tokio::test]
    async fn test_panicking_child_is_marked_failed() {
        let (engine, _) = engine();
        engine.register(Panicky);

        let child = engine
            .dispatch("panicky", Value::Null, None)
            .await
            .unwrap();
        let view = wait_until_finished(&engine, &child).await;
        assert_eq!(view.status, OperationStatus::Failed);
        let operation = engine.get_operation(&child).await.unwrap();
        assert!(operation.error.unwrap().starts_with("Run aborted"));
    }

    #[tokio::test]
    async fn test_child_whose_write_fails_is_marked_failed() {
        init_test_tracing();
        let store = Arc::new(FlakyStore::new());
        let engine = FlowEngine::new(store.clone());
        engine.register(Failing);

        store.fail_update(1);
        let child = engine.dispatch("failing", Value::Null, None).await.unwrap();
        let view = wait_until_finished(&engine, &child).await;
        assert_eq!(view.status, OperationStatus::Failed);
        let operation = engine.get_operation(&child).await.unwrap();
        assert_eq!(
            operation.error.as_deref(),
            Some("Operation store error: disk full")
        );
    }
}

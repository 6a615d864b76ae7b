//!
//! Stitch Core - resumable flow runtime
//!
//! Flows are async bodies whose steps are memoized on a persisted replay
//! tape. A run can suspend on a timed sleep, on external input or on other
//! runs, and a later resume re-executes the body from the top while the
//! recorded steps fast-forward to where it left off.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - operations, step records, events and the store contract
pub mod domain;

/// Application layer - flow context, suspension, fan-out and the engine
pub mod application;

/// Push-to-pull streaming
pub mod streaming;

/// Time source
pub mod clock;

/// Engine configuration
pub mod config;

/// Input schema validation
pub mod validation;

/// Error types
pub mod error;

// Re-export key types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use error::{CoreError, CoreResult};
pub use validation::{JsonSchemaValidator, SchemaValidator};

pub use domain::events::{NoopEventHandler, OperationEvent, OperationEventHandler};
pub use domain::operation::{
    Operation, OperationId, OperationStatus, OperationView, PendingSuspension, StepKey,
    StepOutcome, StepRecord, SuspensionKind,
};
pub use domain::store::OperationStore;

#[cfg(feature = "testing")]
pub use domain::store::memory::MemoryOperationStore;

pub use application::context::{FlowContext, FlowResult, Halt, RunOutcome};
pub use application::engine::{FlowEngine, FlowEngineBuilder, RunSummary};
pub use application::fan_out::FanOutFailure;
pub use application::flow::Flow;
pub use application::suspension::SubflowResult;
pub use application::waker::WakerHandle;

pub use streaming::bridge::{
    ChunkSender, ChunkStream, FinalResult, StreamRecord, StreamingBridge, StreamingResponse,
};
pub use streaming::model::{
    collect_response, generate_stream, Model, ModelChunk, ModelRequest, ModelResponse,
};

#[cfg(feature = "testing")]
pub use streaming::model::EchoModel;

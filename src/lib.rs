//! Stitch: resumable, step-memoized flows.
//!
//! This crate bundles the runtime ([`stitch_core`]) with its logging and
//! metrics ([`stitch_monitoring`]). Most users only need the prelude.

pub use stitch_core as runtime;
pub use stitch_monitoring as monitoring;

/// Everything needed to define, run and observe flows
pub mod prelude {
    pub use stitch_core::{
        ChunkSender, CoreError, EngineConfig, Flow, FlowContext, FlowEngine, FlowResult, Halt,
        Model, ModelChunk, ModelRequest, ModelResponse, OperationId, OperationStatus,
        OperationStore, RunSummary, StreamRecord, StreamingBridge, StreamingResponse,
        SubflowResult,
    };

    pub use stitch_monitoring::{Monitoring, MonitoringConfig};
}

use thiserror::Error;

/// Core error type for the Stitch runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A step function returned an error. The failure is recorded on the
    /// replay tape and surfaced again every time the step is reached.
    #[error("Step '{step}' (occurrence {occurrence}) failed: {message}")]
    StepFailure {
        /// Step name
        step: String,
        /// Occurrence index of the step within the run
        occurrence: u32,
        /// Captured error message
        message: String,
    },

    /// The resume request does not fit the stored suspension
    #[error("Resume mismatch: {0}")]
    ResumeMismatch(String),

    /// Another caller already resumed the operation
    #[error("Concurrent resume conflict: {0}")]
    ConcurrentResumeConflict(String),

    /// An error escaped the flow body
    #[error("Flow failure: {0}")]
    FlowFailure(String),

    /// A streaming producer failed
    #[error("Stream failure: {0}")]
    StreamFailure(String),

    /// A replayed call does not match the recorded history
    #[error("Replay divergence: expected {expected}, found {found}")]
    ReplayDivergence {
        /// What the recorded history expected at this point
        expected: String,
        /// What the flow body actually called
        found: String,
    },

    /// Operation not found
    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    /// No flow registered under this name
    #[error("Flow not registered: {0}")]
    FlowNotRegistered(String),

    /// Conditional store update lost against a newer version
    #[error("Version conflict for operation {id}: expected {expected}, found {found}")]
    VersionConflict {
        /// Operation id
        id: String,
        /// Version the writer expected
        expected: u64,
        /// Version actually stored
        found: u64,
    },

    /// Operation store error
    #[error("Operation store error: {0}")]
    StoreError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Result alias used throughout the core
pub type CoreResult<T> = Result<T, CoreError>;

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}

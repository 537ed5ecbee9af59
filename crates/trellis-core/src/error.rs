use thiserror::Error;

/// Definition-time graph violations. The first violation found is reported.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StructuralError {
    #[error("Workflow must have at least one START node")]
    MissingStart,

    #[error("Workflow must have at least one END node")]
    MissingEnd,

    #[error("Edge {edge}: source node {node} not found")]
    DanglingSource { edge: String, node: String },

    #[error("Edge {edge}: target node {node} not found")]
    DanglingTarget { edge: String, node: String },

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Duplicate edge id: {0}")]
    DuplicateEdge(String),
}

/// Failure of a single capability invocation.
///
/// These never abort a run on their own; the scheduler records them in the
/// execution's error list and keeps routing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Capability not found: {0}")]
    NotFound(String),

    #[error("Permission denied for {capability}: missing {missing:?}")]
    PermissionDenied {
        capability: String,
        missing: Vec<String>,
    },

    #[error("Invalid parameters for {capability}: {message}")]
    InvalidParameters { capability: String, message: String },

    #[error("Capability execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Capability timeout after {timeout_secs}s: {capability}")]
    Timeout {
        capability: String,
        timeout_secs: u64,
    },
}

#[derive(Debug, Error)]
pub enum TrellisError {
    // Definition errors
    #[error("Invalid graph: {0}")]
    Structural(#[from] StructuralError),

    #[error("Graph has no entry point: {0}")]
    NoEntryPoint(String),

    // Lookup errors
    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    // Runtime errors
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("Condition error: {0}")]
    Condition(String),

    #[error("Scheduler fault: {0}")]
    SchedulerFault(String),

    #[error("Execution cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrellisError>;

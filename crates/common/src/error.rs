use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, PlatformError>;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Graph validation error: {0}")]
    Validation(#[from] GraphValidationError),

    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlatformError {
    /// Whether this error reflects a cooperative cancellation rather than a
    /// failure. Cancelled runs terminate as CANCELLED, not ERROR.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PlatformError::Execution(ExecutionError::Cancelled))
    }
}

/// Context attached to every graph validation failure: which nodes are
/// involved, the dependency chain that led there, the execution path under
/// validation, and a human-readable way out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationDetail {
    pub affected_nodes: Vec<Uuid>,
    pub dependency_chain: Vec<Uuid>,
    pub execution_path: Vec<Uuid>,
    pub suggested_resolution: String,
}

impl ValidationDetail {
    pub fn new(affected_nodes: Vec<Uuid>, suggested_resolution: impl Into<String>) -> Self {
        Self {
            affected_nodes,
            dependency_chain: Vec::new(),
            execution_path: Vec::new(),
            suggested_resolution: suggested_resolution.into(),
        }
    }

    pub fn with_chain(mut self, chain: Vec<Uuid>) -> Self {
        self.dependency_chain = chain;
        self
    }

    pub fn with_path(mut self, path: Vec<Uuid>) -> Self {
        self.execution_path = path;
        self
    }
}

/// Fatal graph-shape errors. Never retried.
#[derive(Debug, Clone, Error)]
pub enum GraphValidationError {
    #[error("workflow contains a cycle involving nodes {:?}", .0.affected_nodes)]
    CircularDependency(ValidationDetail),

    #[error("connection references nodes outside the graph: {:?}", .0.affected_nodes)]
    MissingDependency(ValidationDetail),

    #[error("invalid flow state: {}", .0.suggested_resolution)]
    InvalidFlowState(ValidationDetail),
}

impl GraphValidationError {
    pub fn detail(&self) -> &ValidationDetail {
        match self {
            GraphValidationError::CircularDependency(d)
            | GraphValidationError::MissingDependency(d)
            | GraphValidationError::InvalidFlowState(d) => d,
        }
    }
}

/// Reasons the trigger manager refuses or defers an execution.
#[derive(Debug, Clone, Error)]
pub enum AdmissionError {
    #[error("maximum concurrent triggers reached ({0})")]
    GlobalLimit(usize),

    #[error("maximum concurrent executions reached for workflow {0}")]
    WorkflowLimit(Uuid),

    #[error("maximum concurrent executions reached for user {0}")]
    UserLimit(Uuid),

    #[error("isolated execution conflicts with a running execution over shared nodes")]
    ResourceConflict,

    #[error("trigger queue is full ({0} entries)")]
    QueueFull(usize),

    #[error("queued trigger expired after {0} ms")]
    QueueExpired(u64),
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("workflow {0} is not active")]
    WorkflowInactive(Uuid),

    #[error("node not found: {0}")]
    NodeNotFound(Uuid),

    #[error("node {node_id} failed: {message}")]
    NodeFailed { node_id: Uuid, message: String },

    #[error("node {node_id} did not reach a terminal state within {waited_ms} ms: TIMEOUT")]
    NodeWaitTimeout { node_id: Uuid, waited_ms: u64 },

    #[error("execution timed out after {0} ms: TIMEOUT")]
    Timeout(u64),

    #[error("Execution was cancelled")]
    Cancelled,

    #[error("loop node {0} produced neither loop nor done items (loop stuck)")]
    LoopStuck(Uuid),

    #[error("loop node {0} exceeded max iterations")]
    LoopIterationsExceeded(Uuid),

    #[error("execution was interrupted and recovered")]
    Recovered,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

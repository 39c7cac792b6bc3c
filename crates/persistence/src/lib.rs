pub mod memory;
pub mod postgres;
pub mod recovery;

pub use memory::{InMemoryStore, InMemoryWorkflowRepository};
pub use postgres::{PostgresStore, PostgresWorkflowRepository};
pub use recovery::mark_interrupted_executions;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::error::StorageError;
use common::types::{
    ExecutionRecord, ExecutionStatus, FlowNodeState, JsonValue, NodeExecutionRecord,
    NodeRunStatus, Workflow,
};
use uuid::Uuid;

/// Field-wise update for one node execution row. `None` leaves the column
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct NodeExecutionPatch {
    pub status: Option<NodeRunStatus>,
    pub input_data: Option<JsonValue>,
    pub output_data: Option<JsonValue>,
    pub error: Option<JsonValue>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeExecutionPatch {
    pub fn status(status: NodeRunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Persistence capability the engine consumes.
///
/// Terminal statuses are monotonic at this boundary: updates against a
/// terminal execution or node row are silently refused (`Ok(false)`), so an
/// ERROR never becomes SUCCESS and a second cancel is a no-op.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), StorageError>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>, StorageError>;

    /// Returns whether the row actually transitioned.
    async fn update_execution_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error: Option<JsonValue>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError>;

    async fn delete_execution(&self, id: Uuid) -> Result<(), StorageError>;

    async fn create_node_execution(&self, record: &NodeExecutionRecord)
        -> Result<(), StorageError>;

    async fn get_node_execution(
        &self,
        id: Uuid,
    ) -> Result<Option<NodeExecutionRecord>, StorageError>;

    async fn get_node_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<NodeExecutionRecord>, StorageError>;

    /// Returns whether the row actually changed.
    async fn update_node_execution(
        &self,
        id: Uuid,
        patch: NodeExecutionPatch,
    ) -> Result<bool, StorageError>;

    /// Upsert one row per (execution, node), keyed `"<execution_id>_<node_id>"`.
    async fn save_flow_execution_state(
        &self,
        execution_id: Uuid,
        states: &[FlowNodeState],
    ) -> Result<(), StorageError>;

    async fn load_flow_execution_state(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<FlowNodeState>, StorageError>;

    /// All RUNNING executions with no finish timestamp.
    async fn get_active_executions(&self) -> Result<Vec<ExecutionRecord>, StorageError>;

    /// Promote RUNNING executions older than `max_age_ms` to ERROR with a
    /// TIMEOUT_ERROR payload, and drop flow-state rows older than seven days.
    /// Returns the number of executions transitioned.
    async fn cleanup_stale_executions(&self, max_age_ms: u64) -> Result<u64, StorageError>;
}

/// Read access to workflow definitions.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StorageError>;
}

pub(crate) fn timeout_error_payload(max_age_ms: u64) -> JsonValue {
    serde_json::json!({
        "type": "TIMEOUT_ERROR",
        "message": format!("execution exceeded the stale threshold of {} ms", max_age_ms),
        "timestamp": Utc::now().to_rfc3339(),
    })
}

pub(crate) const FLOW_STATE_RETENTION_DAYS: i64 = 7;

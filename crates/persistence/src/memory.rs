use crate::{
    timeout_error_payload, ExecutionStore, NodeExecutionPatch, WorkflowRepository,
    FLOW_STATE_RETENTION_DAYS,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::error::StorageError;
use common::types::{
    flow_state_key, ExecutionRecord, ExecutionStatus, FlowNodeState, JsonValue,
    NodeExecutionRecord, NodeRunStatus, Workflow,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-process store used in tests and single-node deployments.
#[derive(Default)]
pub struct InMemoryStore {
    executions: Arc<RwLock<HashMap<Uuid, ExecutionRecord>>>,
    node_executions: Arc<RwLock<HashMap<Uuid, NodeExecutionRecord>>>,
    flow_states: Arc<RwLock<HashMap<String, (Uuid, FlowNodeState)>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), StorageError> {
        self.executions
            .write()
            .await
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>, StorageError> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn update_execution_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error: Option<JsonValue>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError> {
        let mut executions = self.executions.write().await;
        let record = match executions.get_mut(&id) {
            Some(record) => record,
            None => return Ok(false),
        };
        if record.status.is_terminal() {
            return Ok(false);
        }
        record.status = status;
        if let Some(error) = error {
            record.error = Some(error);
        }
        if let Some(finished_at) = finished_at {
            record.finished_at = Some(finished_at);
        }
        Ok(true)
    }

    async fn delete_execution(&self, id: Uuid) -> Result<(), StorageError> {
        self.executions.write().await.remove(&id);
        self.node_executions
            .write()
            .await
            .retain(|_, record| record.execution_id != id);
        self.flow_states
            .write()
            .await
            .retain(|_, (execution_id, _)| *execution_id != id);
        Ok(())
    }

    async fn create_node_execution(
        &self,
        record: &NodeExecutionRecord,
    ) -> Result<(), StorageError> {
        self.node_executions
            .write()
            .await
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn get_node_execution(
        &self,
        id: Uuid,
    ) -> Result<Option<NodeExecutionRecord>, StorageError> {
        Ok(self.node_executions.read().await.get(&id).cloned())
    }

    async fn get_node_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<NodeExecutionRecord>, StorageError> {
        Ok(self
            .node_executions
            .read()
            .await
            .values()
            .filter(|record| record.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn update_node_execution(
        &self,
        id: Uuid,
        patch: NodeExecutionPatch,
    ) -> Result<bool, StorageError> {
        let mut records = self.node_executions.write().await;
        let record = match records.get_mut(&id) {
            Some(record) => record,
            None => return Ok(false),
        };
        if record.status.is_terminal() {
            return Ok(false);
        }
        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(input_data) = patch.input_data {
            record.input_data = Some(input_data);
        }
        if let Some(output_data) = patch.output_data {
            record.output_data = Some(output_data);
        }
        if let Some(error) = patch.error {
            record.error = Some(error);
        }
        if let Some(started_at) = patch.started_at {
            record.started_at = Some(started_at);
        }
        if let Some(finished_at) = patch.finished_at {
            record.finished_at = Some(finished_at);
        }
        Ok(true)
    }

    async fn save_flow_execution_state(
        &self,
        execution_id: Uuid,
        states: &[FlowNodeState],
    ) -> Result<(), StorageError> {
        let mut flow_states = self.flow_states.write().await;
        for state in states {
            let key = flow_state_key(execution_id, state.node_id);
            flow_states.insert(key, (execution_id, state.clone()));
        }
        Ok(())
    }

    async fn load_flow_execution_state(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<FlowNodeState>, StorageError> {
        Ok(self
            .flow_states
            .read()
            .await
            .values()
            .filter(|(id, _)| *id == execution_id)
            .map(|(_, state)| state.clone())
            .collect())
    }

    async fn get_active_executions(&self) -> Result<Vec<ExecutionRecord>, StorageError> {
        Ok(self
            .executions
            .read()
            .await
            .values()
            .filter(|record| {
                record.status == ExecutionStatus::Running && record.finished_at.is_none()
            })
            .cloned()
            .collect())
    }

    async fn cleanup_stale_executions(&self, max_age_ms: u64) -> Result<u64, StorageError> {
        let cutoff = Utc::now() - Duration::milliseconds(max_age_ms as i64);
        let mut transitioned = 0;

        {
            let mut executions = self.executions.write().await;
            for record in executions.values_mut() {
                if record.status == ExecutionStatus::Running && record.started_at < cutoff {
                    record.status = ExecutionStatus::Error;
                    record.error = Some(timeout_error_payload(max_age_ms));
                    record.finished_at = Some(Utc::now());
                    transitioned += 1;
                }
            }
        }

        let state_cutoff = Utc::now() - Duration::days(FLOW_STATE_RETENTION_DAYS);
        self.flow_states
            .write()
            .await
            .retain(|_, (_, state)| state.updated_at >= state_cutoff);

        Ok(transitioned)
    }
}

/// Workflow definitions held in memory, keyed by id.
#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    workflows: Arc<RwLock<HashMap<Uuid, Workflow>>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, workflow: Workflow) {
        self.workflows.write().await.insert(workflow.id, workflow);
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StorageError> {
        Ok(self.workflows.read().await.get(&id).cloned())
    }
}

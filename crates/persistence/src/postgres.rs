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
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn execution_from_row(row: &PgRow) -> Result<ExecutionRecord, StorageError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(ExecutionRecord {
        id: row.try_get("id").map_err(db_err)?,
        workflow_id: row.try_get("workflow_id").map_err(db_err)?,
        status: ExecutionStatus::parse(&status)
            .ok_or_else(|| StorageError::Serialization(format!("unknown status '{}'", status)))?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        finished_at: row.try_get("finished_at").map_err(db_err)?,
        trigger_data: row.try_get("trigger_data").map_err(db_err)?,
        error: row.try_get("error").map_err(db_err)?,
        progress: row.try_get("progress").map_err(db_err)?,
        workflow_snapshot: row.try_get("workflow_snapshot").map_err(db_err)?,
    })
}

fn node_execution_from_row(row: &PgRow) -> Result<NodeExecutionRecord, StorageError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(NodeExecutionRecord {
        id: row.try_get("id").map_err(db_err)?,
        execution_id: row.try_get("execution_id").map_err(db_err)?,
        node_id: row.try_get("node_id").map_err(db_err)?,
        status: NodeRunStatus::parse(&status)
            .ok_or_else(|| StorageError::Serialization(format!("unknown status '{}'", status)))?,
        input_data: row.try_get("input_data").map_err(db_err)?,
        output_data: row.try_get("output_data").map_err(db_err)?,
        error: row.try_get("error").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        finished_at: row.try_get("finished_at").map_err(db_err)?,
    })
}

/// Relational store over Postgres. The engine does not require transactions
/// across rows; every statement stands alone.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionStore for PostgresStore {
    async fn create_execution(&self, record: &ExecutionRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO executions (
                id, workflow_id, status, started_at, finished_at,
                trigger_data, error, progress, workflow_snapshot
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(record.workflow_id)
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(&record.trigger_data)
        .bind(&record.error)
        .bind(&record.progress)
        .bind(&record.workflow_snapshot)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn update_execution_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error: Option<JsonValue>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError> {
        // Terminal rows are immutable; the status filter enforces it.
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = $2,
                error = COALESCE($3, error),
                finished_at = COALESCE($4, finished_at)
            WHERE id = $1 AND status IN ('RUNNING', 'PAUSED')
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .bind(finished_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_execution(&self, id: Uuid) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM node_executions WHERE execution_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM flow_execution_state WHERE execution_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM executions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn create_node_execution(
        &self,
        record: &NodeExecutionRecord,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO node_executions (
                id, execution_id, node_id, status, input_data,
                output_data, error, started_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(record.execution_id)
        .bind(record.node_id)
        .bind(record.status.as_str())
        .bind(&record.input_data)
        .bind(&record.output_data)
        .bind(&record.error)
        .bind(record.started_at)
        .bind(record.finished_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_node_execution(
        &self,
        id: Uuid,
    ) -> Result<Option<NodeExecutionRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM node_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(node_execution_from_row).transpose()
    }

    async fn get_node_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<NodeExecutionRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM node_executions WHERE execution_id = $1 ORDER BY started_at NULLS LAST",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(node_execution_from_row).collect()
    }

    async fn update_node_execution(
        &self,
        id: Uuid,
        patch: NodeExecutionPatch,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE node_executions
            SET status = COALESCE($2, status),
                input_data = COALESCE($3, input_data),
                output_data = COALESCE($4, output_data),
                error = COALESCE($5, error),
                started_at = COALESCE($6, started_at),
                finished_at = COALESCE($7, finished_at)
            WHERE id = $1
              AND status NOT IN ('SUCCESS', 'ERROR', 'CANCELLED', 'SKIPPED')
            "#,
        )
        .bind(id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.input_data)
        .bind(patch.output_data)
        .bind(patch.error)
        .bind(patch.started_at)
        .bind(patch.finished_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_flow_execution_state(
        &self,
        execution_id: Uuid,
        states: &[FlowNodeState],
    ) -> Result<(), StorageError> {
        for state in states {
            sqlx::query(
                r#"
                INSERT INTO flow_execution_state (id, execution_id, node_id, status, output_data, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO UPDATE
                SET status = EXCLUDED.status,
                    output_data = EXCLUDED.output_data,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(flow_state_key(execution_id, state.node_id))
            .bind(execution_id)
            .bind(state.node_id)
            .bind(state.status.as_str())
            .bind(&state.output_data)
            .bind(state.updated_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn load_flow_execution_state(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<FlowNodeState>, StorageError> {
        let rows = sqlx::query(
            "SELECT node_id, status, output_data, updated_at FROM flow_execution_state WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status").map_err(db_err)?;
                Ok(FlowNodeState {
                    node_id: row.try_get("node_id").map_err(db_err)?,
                    status: NodeRunStatus::parse(&status).ok_or_else(|| {
                        StorageError::Serialization(format!("unknown status '{}'", status))
                    })?,
                    output_data: row.try_get("output_data").map_err(db_err)?,
                    updated_at: row.try_get("updated_at").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn get_active_executions(&self) -> Result<Vec<ExecutionRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM executions WHERE status = 'RUNNING' AND finished_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn cleanup_stale_executions(&self, max_age_ms: u64) -> Result<u64, StorageError> {
        let cutoff = Utc::now() - Duration::milliseconds(max_age_ms as i64);
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'ERROR', error = $1, finished_at = NOW()
            WHERE status = 'RUNNING' AND started_at < $2
            "#,
        )
        .bind(timeout_error_payload(max_age_ms))
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let state_cutoff = Utc::now() - Duration::days(FLOW_STATE_RETENTION_DAYS);
        sqlx::query("DELETE FROM flow_execution_state WHERE updated_at < $1")
            .bind(state_cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected())
    }
}

/// Workflow definitions stored as one JSONB document per row.
pub struct PostgresWorkflowRepository {
    pool: PgPool,
}

impl PostgresWorkflowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowRepository for PostgresWorkflowRepository {
    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StorageError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => {
                let definition: JsonValue = row.try_get("definition").map_err(db_err)?;
                let workflow = serde_json::from_value(definition)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(workflow))
            }
            None => Ok(None),
        }
    }
}

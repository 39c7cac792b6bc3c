use crate::ExecutionStore;
use chrono::Utc;
use common::error::StorageError;
use common::types::ExecutionStatus;
use tracing::{info, warn};

/// Startup recovery sweep.
///
/// Executions found RUNNING at engine start were interrupted by a restart.
/// There is no automatic resume; each is marked ERROR with a RECOVERY_ERROR
/// payload so operators and callers see a terminal record. Running the sweep
/// twice is harmless: the second pass finds nothing active.
pub async fn mark_interrupted_executions(
    store: &dyn ExecutionStore,
) -> Result<u64, StorageError> {
    let active = store.get_active_executions().await?;
    let mut recovered = 0;

    for record in active {
        let payload = serde_json::json!({
            "type": "RECOVERY_ERROR",
            "message": "Execution was interrupted and recovered",
            "timestamp": Utc::now().to_rfc3339(),
        });
        match store
            .update_execution_status(
                record.id,
                ExecutionStatus::Error,
                Some(payload),
                Some(Utc::now()),
            )
            .await
        {
            Ok(true) => {
                recovered += 1;
                info!(execution_id = %record.id, "marked interrupted execution as recovered");
            }
            Ok(false) => {}
            Err(e) => {
                warn!(execution_id = %record.id, error = %e, "failed to recover execution");
            }
        }
    }

    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use common::types::ExecutionRecord;
    use uuid::Uuid;

    #[tokio::test]
    async fn recovery_marks_running_executions_as_error() {
        let store = InMemoryStore::new();
        let record =
            ExecutionRecord::new(Uuid::new_v4(), Uuid::new_v4(), serde_json::json!({}));
        store.create_execution(&record).await.unwrap();

        let recovered = mark_interrupted_executions(&store).await.unwrap();
        assert_eq!(recovered, 1);

        let stored = store.get_execution(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Error);
        assert_eq!(stored.error.as_ref().unwrap()["type"], "RECOVERY_ERROR");
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn recovery_sweep_is_idempotent() {
        let store = InMemoryStore::new();
        let record =
            ExecutionRecord::new(Uuid::new_v4(), Uuid::new_v4(), serde_json::json!({}));
        store.create_execution(&record).await.unwrap();

        let first = mark_interrupted_executions(&store).await.unwrap();
        let after_first = store.get_execution(record.id).await.unwrap().unwrap();

        let second = mark_interrupted_executions(&store).await.unwrap();
        let after_second = store.get_execution(record.id).await.unwrap().unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
        assert_eq!(after_first.status, after_second.status);
        assert_eq!(after_first.error, after_second.error);
    }
}

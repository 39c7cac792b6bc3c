use crate::types::JsonValue;
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Durable result store keyed by execution id.
///
/// Bridges asynchronous execution to synchronous trigger responses: the
/// engine publishes the terminal result here, and waiters poll it, surviving
/// a handoff across processes.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn set(&self, execution_id: Uuid, result: JsonValue, ttl_ms: u64);

    async fn get(&self, execution_id: Uuid) -> Option<JsonValue>;

    /// Poll until a result appears or the timeout elapses.
    async fn wait_for_result(&self, execution_id: Uuid, timeout_ms: u64) -> Option<JsonValue> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if let Some(result) = self.get(execution_id).await {
                return Some(result);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Discards results. For deployments that never answer triggers synchronously.
pub struct NoopResultCache;

#[async_trait]
impl ResultCache for NoopResultCache {
    async fn set(&self, _execution_id: Uuid, _result: JsonValue, _ttl_ms: u64) {}

    async fn get(&self, _execution_id: Uuid) -> Option<JsonValue> {
        None
    }
}

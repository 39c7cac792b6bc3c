use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::results::ResultCache;
use common::types::JsonValue;
use moka::future::Cache;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct CachedResult {
    result: JsonValue,
    cached_at: DateTime<Utc>,
    ttl_ms: u64,
}

impl CachedResult {
    fn is_expired(&self) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.cached_at);
        elapsed.num_milliseconds().max(0) as u64 > self.ttl_ms
    }
}

/// In-process result cache. Suitable when trigger callers and the engine
/// share one process; per-entry TTL on top of a cache-wide ceiling.
pub struct MokaResultCache {
    cache: Cache<Uuid, CachedResult>,
}

impl MokaResultCache {
    pub fn new(max_capacity: u64, max_ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(max_ttl)
            .build();
        Self { cache }
    }
}

#[async_trait]
impl ResultCache for MokaResultCache {
    async fn set(&self, execution_id: Uuid, result: JsonValue, ttl_ms: u64) {
        let cached = CachedResult {
            result,
            cached_at: Utc::now(),
            ttl_ms,
        };
        self.cache.insert(execution_id, cached).await;
    }

    async fn get(&self, execution_id: Uuid) -> Option<JsonValue> {
        let cached = self.cache.get(&execution_id).await?;
        if cached.is_expired() {
            self.cache.invalidate(&execution_id).await;
            return None;
        }
        Some(cached.result)
    }
}

/// Redis-backed result cache: survives process restarts and serves waiters
/// in other processes.
pub struct RedisResultCache {
    conn: redis::aio::ConnectionManager,
}

impl RedisResultCache {
    pub async fn connect(url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    fn key(execution_id: Uuid) -> String {
        format!("execution:result:{}", execution_id)
    }
}

#[async_trait]
impl ResultCache for RedisResultCache {
    async fn set(&self, execution_id: Uuid, result: JsonValue, ttl_ms: u64) {
        let payload = match serde_json::to_string(&result) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%execution_id, error = %e, "failed to serialize result");
                return;
            }
        };
        let seconds = (ttl_ms / 1000).max(1);
        let mut conn = self.conn.clone();
        let outcome: redis::RedisResult<()> =
            conn.set_ex(Self::key(execution_id), payload, seconds).await;
        if let Err(e) = outcome {
            warn!(%execution_id, error = %e, "failed to cache result in redis");
        }
    }

    async fn get(&self, execution_id: Uuid) -> Option<JsonValue> {
        let mut conn = self.conn.clone();
        let payload: redis::RedisResult<Option<String>> =
            conn.get(Self::key(execution_id)).await;
        match payload {
            Ok(Some(payload)) => serde_json::from_str(&payload).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(%execution_id, error = %e, "failed to read result from redis");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn moka_cache_round_trips() {
        let cache = MokaResultCache::new(100, Duration::from_secs(60));
        let execution_id = Uuid::new_v4();

        assert!(cache.get(execution_id).await.is_none());
        cache
            .set(execution_id, serde_json::json!({"status": "SUCCESS"}), 60_000)
            .await;

        let result = cache.get(execution_id).await.unwrap();
        assert_eq!(result["status"], "SUCCESS");
    }

    #[tokio::test]
    async fn moka_cache_honors_per_entry_ttl() {
        let cache = MokaResultCache::new(100, Duration::from_secs(60));
        let execution_id = Uuid::new_v4();

        cache
            .set(execution_id, serde_json::json!({"status": "SUCCESS"}), 0)
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.get(execution_id).await.is_none());
    }

    #[tokio::test]
    async fn wait_for_result_sees_late_publication() {
        let cache = std::sync::Arc::new(MokaResultCache::new(100, Duration::from_secs(60)));
        let execution_id = Uuid::new_v4();

        let writer = cache.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer
                .set(execution_id, serde_json::json!({"ok": true}), 60_000)
                .await;
        });

        let result = cache.wait_for_result(execution_id, 5_000).await;
        assert_eq!(result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn wait_for_result_times_out_without_publication() {
        let cache = MokaResultCache::new(100, Duration::from_secs(60));
        let result = cache.wait_for_result(Uuid::new_v4(), 150).await;
        assert!(result.is_none());
    }
}

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Node retry policy. A failure is retried only while attempts remain and the
/// error message contains one of the retryable markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_retry_delay_ms: u64,
    pub retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_retry_delay_ms: 30_000,
            retryable_errors: vec![
                "TIMEOUT".to_string(),
                "NETWORK_ERROR".to_string(),
                "RATE_LIMIT".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default workflow job timeout when the trigger does not override it.
    pub workflow_timeout_ms: u64,
    /// Worker concurrency on the workflow queue.
    pub workflow_concurrency: usize,
    /// Worker concurrency on the node queue.
    pub node_concurrency: usize,
    /// Hard cap on waiting for one node's terminal record.
    pub node_wait_timeout_ms: u64,
    /// Poll interval while waiting for a node's terminal record.
    pub node_poll_interval_ms: u64,
    pub max_loop_iterations: u32,
    /// TTL for terminal results published to the result cache.
    pub result_ttl_ms: u64,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workflow_timeout_ms: 300_000,
            workflow_concurrency: 10,
            node_concurrency: 10,
            node_wait_timeout_ms: 300_000,
            node_poll_interval_ms: 100,
            max_loop_iterations: 100_000,
            result_ttl_ms: 300_000,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictAction {
    Queue,
    Reject,
    Merge,
    Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictStrategy {
    pub action: ConflictAction,
    pub max_queue_size: usize,
    pub queue_timeout_ms: u64,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        Self {
            action: ConflictAction::Queue,
            max_queue_size: 100,
            queue_timeout_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub max_concurrent_triggers: usize,
    pub max_concurrent_per_workflow: usize,
    pub max_concurrent_per_user: usize,
    pub conflict: ConflictStrategy,
    /// Default wait for synchronous trigger responses.
    pub result_wait_timeout_ms: u64,
    /// Completed entries older than this are pruned by the cleanup sweep.
    pub completed_max_age_ms: u64,
    pub cleanup_interval_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_triggers: 50,
            max_concurrent_per_workflow: 10,
            max_concurrent_per_user: 20,
            conflict: ConflictStrategy::default(),
            result_wait_timeout_ms: 30_000,
            completed_max_age_ms: 3_600_000,
            cleanup_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    pub max_events_per_execution: usize,
    pub max_buffered_executions: usize,
    pub retention_ms: u64,
    pub sweep_interval_ms: u64,
    /// Capacity of each subscriber's delivery channel.
    pub subscriber_channel_size: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            max_events_per_execution: 20,
            max_buffered_executions: 100,
            retention_ms: 60_000,
            sweep_interval_ms: 5_000,
            subscriber_channel_size: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub triggers: TriggerConfig,
    pub fabric: FabricConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgresql://localhost/workflow_platform".to_string()),
                max_connections: 10,
                min_connections: 2,
            },
            redis: RedisConfig {
                url: std::env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
                pool_size: 10,
            },
            server: ServerConfig {
                host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(8080),
            },
            engine: EngineConfig::default(),
            triggers: TriggerConfig::default(),
            fabric: FabricConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_defaults_match_policy() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.retry_delay_ms, 1000);
        assert_eq!(retry.max_retry_delay_ms, 30_000);
        assert!(retry.retryable_errors.iter().any(|e| e == "TIMEOUT"));
    }

    #[test]
    fn conflict_strategy_defaults() {
        let strategy = ConflictStrategy::default();
        assert_eq!(strategy.action, ConflictAction::Queue);
        assert_eq!(strategy.max_queue_size, 100);
        assert_eq!(strategy.queue_timeout_ms, 300_000);
    }

    #[test]
    fn fabric_buffer_bounds() {
        let fabric = FabricConfig::default();
        assert_eq!(fabric.max_events_per_execution, 20);
        assert_eq!(fabric.max_buffered_executions, 100);
    }
}

pub mod memory;

pub use memory::InMemoryQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::JsonValue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Per-job options supplied at enqueue time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JobOptions {
    pub timeout_ms: u64,
    /// Delivery attempts, including the first. At-least-once: a failed or
    /// timed-out job is re-delivered while attempts remain.
    pub attempts: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            attempts: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub payload: JsonValue,
    pub options: JobOptions,
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Failed,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue '{0}' already has a processor attached")]
    AlreadyProcessing(String),

    #[error("handler error: {0}")]
    Handler(String),
}

/// Work performed for each delivered job. Returning `Err` counts as a failed
/// attempt and triggers re-delivery while attempts remain.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> anyhow::Result<()>;
}

/// Durable-queue capability the engine consumes.
///
/// The contract is at-least-once delivery with per-job timeout and bounded
/// worker concurrency per queue name. [`InMemoryQueue`] implements it in
/// process; a Redis-backed implementation slots in behind the same trait.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a payload; returns the job id.
    async fn add(&self, name: &str, payload: JsonValue, options: JobOptions) -> Uuid;

    /// Attach a processor with the given worker concurrency. At most one
    /// processor per queue name.
    async fn process(
        &self,
        name: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError>;

    /// Best-effort removal: waiting jobs are dropped, active jobs are marked
    /// so their result is discarded. Returns whether the job was found.
    async fn remove(&self, job_id: Uuid) -> bool;

    /// Snapshot of jobs in the given states.
    async fn get_jobs(&self, name: &str, states: &[JobState]) -> Vec<Job>;
}

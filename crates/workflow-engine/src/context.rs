use chrono::{DateTime, Utc};
use common::types::{JsonValue, NodeOutput};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Per-run mutable state, owned by the engine for the lifetime of one
/// execution. Node outputs are written once by the node that produced them
/// and read-only afterwards.
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub trigger_data: JsonValue,
    pub node_id_to_name: HashMap<Uuid, String>,
    pub started_at: DateTime<Utc>,
    node_outputs: RwLock<HashMap<Uuid, NodeOutput>>,
    cancelled: AtomicBool,
    paused: AtomicBool,
}

impl ExecutionContext {
    pub fn new(
        execution_id: Uuid,
        workflow_id: Uuid,
        user_id: Uuid,
        trigger_data: JsonValue,
        node_id_to_name: HashMap<Uuid, String>,
    ) -> Self {
        Self {
            execution_id,
            workflow_id,
            user_id,
            trigger_data,
            node_id_to_name,
            started_at: Utc::now(),
            node_outputs: RwLock::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    /// The only cancellation signal. Observed at the top of the scheduling
    /// loop, between loop iterations and at the start of each node job.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub async fn insert_output(&self, node_id: Uuid, output: NodeOutput) {
        self.node_outputs.write().await.insert(node_id, output);
    }

    pub async fn output(&self, node_id: Uuid) -> Option<NodeOutput> {
        self.node_outputs.read().await.get(&node_id).cloned()
    }

    pub async fn has_output(&self, node_id: Uuid) -> bool {
        self.node_outputs.read().await.contains_key(&node_id)
    }

    pub async fn outputs_snapshot(&self) -> HashMap<Uuid, NodeOutput> {
        self.node_outputs.read().await.clone()
    }
}

/// Live executions by id. Contexts are registered when an execution starts
/// and removed when it terminates.
#[derive(Default)]
pub struct ContextRegistry {
    inner: RwLock<HashMap<Uuid, Arc<ExecutionContext>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, context: Arc<ExecutionContext>) {
        self.inner
            .write()
            .await
            .insert(context.execution_id, context);
    }

    pub async fn get(&self, execution_id: Uuid) -> Option<Arc<ExecutionContext>> {
        self.inner.read().await.get(&execution_id).cloned()
    }

    pub async fn remove(&self, execution_id: Uuid) -> Option<Arc<ExecutionContext>> {
        self.inner.write().await.remove(&execution_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

use crate::resources::ResourceManager;
use chrono::{DateTime, Utc};
use common::config::{ConflictAction, TriggerConfig};
use common::error::{AdmissionError, PlatformError};
use common::events::{EventKind, EventPublisher, ExecutionEvent};
use common::results::ResultCache;
use common::types::{JsonValue, TriggerExecutionContext, TriggerType};
use persistence::WorkflowRepository;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use workflow_engine::{DependencyResolver, ExecutionEngine, StartOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub trigger_id: String,
    pub trigger_type: TriggerType,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub trigger_node_id: Uuid,
    pub trigger_data: Option<JsonValue>,
    pub options: Option<TriggerOptions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerOptions {
    /// Lower value wins; ties keep insertion order.
    pub priority: Option<u8>,
    #[serde(default)]
    pub isolated_execution: bool,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerStatus {
    Started,
    Queued,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub success: bool,
    pub execution_id: Option<Uuid>,
    pub status: TriggerStatus,
    pub reason: Option<String>,
}

impl TriggerResponse {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            execution_id: None,
            status: TriggerStatus::Rejected,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitResponse {
    pub success: bool,
    pub execution_id: Option<Uuid>,
    pub result: Option<JsonValue>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerStats {
    pub active: usize,
    pub queued: usize,
    pub completed: usize,
    pub by_type: HashMap<String, usize>,
    pub by_workflow: HashMap<Uuid, usize>,
}

struct CompletedInfo {
    #[allow(dead_code)]
    context: TriggerExecutionContext,
    finished_at: DateTime<Utc>,
}

struct ManagerState {
    active: HashMap<Uuid, TriggerExecutionContext>,
    queued: Vec<TriggerExecutionContext>,
    completed: HashMap<Uuid, CompletedInfo>,
    resources: ResourceManager,
}

/// Admission and fairness layer in front of the execution engine.
///
/// All tables live under one coordinator lock, so admission decisions never
/// race. Completion is observed from the engine's event stream via the
/// channel handed to [`TriggerManager::start`].
pub struct TriggerManager {
    engine: Arc<ExecutionEngine>,
    workflows: Arc<dyn WorkflowRepository>,
    results: Arc<dyn ResultCache>,
    events: Arc<dyn EventPublisher>,
    config: TriggerConfig,
    state: Mutex<ManagerState>,
}

impl TriggerManager {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        workflows: Arc<dyn WorkflowRepository>,
        results: Arc<dyn ResultCache>,
        events: Arc<dyn EventPublisher>,
        config: TriggerConfig,
    ) -> common::Result<Arc<Self>> {
        if config.conflict.action == ConflictAction::Merge {
            return Err(PlatformError::Internal(
                "the merge conflict strategy is not supported".to_string(),
            ));
        }
        Ok(Arc::new(Self {
            engine,
            workflows,
            results,
            events,
            config,
            state: Mutex::new(ManagerState {
                active: HashMap::new(),
                queued: Vec::new(),
                completed: HashMap::new(),
                resources: ResourceManager::new(),
            }),
        }))
    }

    /// Attach the completion listener and the periodic cleanup sweep.
    /// `completions` carries the engine's event stream (a fanout branch).
    pub fn start(self: Arc<Self>, mut completions: mpsc::UnboundedReceiver<ExecutionEvent>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = completions.recv().await {
                if event.kind.is_terminal() {
                    manager.finish(event.execution_id).await;
                }
            }
        });

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(self.config.cleanup_interval_ms));
            loop {
                interval.tick().await;
                self.cleanup().await;
            }
        });
    }

    /// Admit, queue or reject a trigger. Admitted triggers start immediately;
    /// queued ones are promoted as capacity frees up.
    pub async fn execute(&self, request: TriggerRequest) -> TriggerResponse {
        let workflow = match self.workflows.get_workflow(request.workflow_id).await {
            Ok(Some(workflow)) => workflow,
            Ok(None) => {
                return TriggerResponse::rejected(format!(
                    "workflow not found: {}",
                    request.workflow_id
                ))
            }
            Err(e) => return TriggerResponse::rejected(e.to_string()),
        };

        // Affected set: the trigger node plus everything downstream of it.
        let resolver = DependencyResolver::for_workflow(&workflow);
        let mut affected: HashSet<Uuid> = resolver.transitive_downstream(request.trigger_node_id);
        affected.insert(request.trigger_node_id);

        let options = request.options.clone().unwrap_or_default();
        let context = TriggerExecutionContext {
            execution_id: Uuid::new_v4(),
            trigger_id: request.trigger_id.clone(),
            trigger_type: request.trigger_type,
            workflow_id: request.workflow_id,
            user_id: request.user_id,
            trigger_node_id: request.trigger_node_id,
            trigger_data: request.trigger_data.clone().unwrap_or_else(|| serde_json::json!({})),
            priority: options.priority.unwrap_or(5),
            affected_nodes: affected,
            isolated_execution: options.isolated_execution,
            start_time: Utc::now(),
            cancelled: false,
        };

        {
            let mut state = self.state.lock().await;
            if let Err(reason) = self.check_admission(&state, &context) {
                return match self.config.conflict.action {
                    ConflictAction::Queue | ConflictAction::Priority => {
                        if state.queued.len() >= self.config.conflict.max_queue_size {
                            return TriggerResponse::rejected(
                                AdmissionError::QueueFull(state.queued.len()).to_string(),
                            );
                        }
                        let execution_id = context.execution_id;
                        insert_by_priority(&mut state.queued, context);
                        debug!(%execution_id, "trigger queued: {reason}");
                        TriggerResponse {
                            success: true,
                            execution_id: Some(execution_id),
                            status: TriggerStatus::Queued,
                            reason: Some(reason.to_string()),
                        }
                    }
                    ConflictAction::Reject | ConflictAction::Merge => {
                        TriggerResponse::rejected(reason.to_string())
                    }
                };
            }
            state.active.insert(context.execution_id, context.clone());
            state
                .resources
                .acquire(context.execution_id, context.affected_nodes.clone());
        }

        self.launch(context, options.timeout_ms).await
    }

    /// Synchronous trigger path: start (or queue) and await the cached
    /// result, bridging across processes through the result cache.
    pub async fn execute_and_wait(
        &self,
        request: TriggerRequest,
        timeout_ms: Option<u64>,
    ) -> WaitResponse {
        let timeout_ms = timeout_ms
            .or(request.options.as_ref().and_then(|o| o.timeout_ms))
            .unwrap_or(self.config.result_wait_timeout_ms);
        let response = self.execute(request).await;

        let execution_id = match (response.status, response.execution_id) {
            (TriggerStatus::Rejected, _) | (_, None) => {
                return WaitResponse {
                    success: false,
                    execution_id: response.execution_id,
                    result: None,
                    reason: response.reason,
                }
            }
            (_, Some(execution_id)) => execution_id,
        };

        match self.results.wait_for_result(execution_id, timeout_ms).await {
            Some(result) => WaitResponse {
                success: true,
                execution_id: Some(execution_id),
                result: Some(result),
                reason: None,
            },
            None => WaitResponse {
                success: false,
                execution_id: Some(execution_id),
                result: None,
                reason: Some(format!(
                    "timed out after {} ms waiting for execution result",
                    timeout_ms
                )),
            },
        }
    }

    /// Cancel a queued or running execution.
    pub async fn cancel(&self, execution_id: Uuid) -> bool {
        {
            let mut state = self.state.lock().await;
            if let Some(pos) = state
                .queued
                .iter()
                .position(|c| c.execution_id == execution_id)
            {
                let mut context = state.queued.remove(pos);
                context.cancelled = true;
                state.completed.insert(
                    execution_id,
                    CompletedInfo {
                        context,
                        finished_at: Utc::now(),
                    },
                );
                info!(%execution_id, "queued trigger cancelled");
                return true;
            }
        }

        let cancelled = self.engine.cancel(execution_id).await.unwrap_or(false);
        self.finish(execution_id).await;
        cancelled
    }

    pub async fn stats(&self) -> TriggerStats {
        let state = self.state.lock().await;
        let mut stats = TriggerStats {
            active: state.active.len(),
            queued: state.queued.len(),
            completed: state.completed.len(),
            ..TriggerStats::default()
        };
        for context in state.active.values().chain(state.queued.iter()) {
            *stats
                .by_type
                .entry(context.trigger_type.as_str().to_string())
                .or_insert(0) += 1;
            *stats.by_workflow.entry(context.workflow_id).or_insert(0) += 1;
        }
        stats
    }

    // ------------------------------------------------------------------

    fn check_admission(
        &self,
        state: &ManagerState,
        context: &TriggerExecutionContext,
    ) -> Result<(), AdmissionError> {
        if state.active.len() >= self.config.max_concurrent_triggers {
            return Err(AdmissionError::GlobalLimit(
                self.config.max_concurrent_triggers,
            ));
        }
        let per_workflow = state
            .active
            .values()
            .filter(|c| c.workflow_id == context.workflow_id)
            .count();
        if per_workflow >= self.config.max_concurrent_per_workflow {
            return Err(AdmissionError::WorkflowLimit(context.workflow_id));
        }
        let per_user = state
            .active
            .values()
            .filter(|c| c.user_id == context.user_id)
            .count();
        if per_user >= self.config.max_concurrent_per_user {
            return Err(AdmissionError::UserLimit(context.user_id));
        }
        if context.isolated_execution && state.resources.conflicts(&context.affected_nodes) {
            return Err(AdmissionError::ResourceConflict);
        }
        Ok(())
    }

    async fn launch(
        &self,
        context: TriggerExecutionContext,
        timeout_ms: Option<u64>,
    ) -> TriggerResponse {
        let manual = context.trigger_type == TriggerType::Manual;
        let options = StartOptions {
            manual,
            timeout_ms,
            execution_id: Some(context.execution_id),
        };
        match self
            .engine
            .start_workflow(
                context.workflow_id,
                context.user_id,
                Some(context.trigger_data.clone()),
                options,
                Some(context.trigger_node_id),
                None,
            )
            .await
        {
            Ok(execution_id) => TriggerResponse {
                success: true,
                execution_id: Some(execution_id),
                status: TriggerStatus::Started,
                reason: None,
            },
            Err(e) => {
                // Roll the admission back so the slot is not leaked.
                let mut state = self.state.lock().await;
                state.active.remove(&context.execution_id);
                state.resources.release(context.execution_id);
                warn!(execution_id = %context.execution_id, error = %e, "trigger failed to start");
                TriggerResponse::rejected(e.to_string())
            }
        }
    }

    /// Move an active execution to completed, release its locks and promote
    /// whatever queued triggers now pass admission. Idempotent.
    async fn finish(&self, execution_id: Uuid) {
        let to_start = {
            let mut state = self.state.lock().await;
            if let Some(context) = state.active.remove(&execution_id) {
                state.resources.release(execution_id);
                state.completed.insert(
                    execution_id,
                    CompletedInfo {
                        context,
                        finished_at: Utc::now(),
                    },
                );
            }
            self.drain_locked(&mut state)
        };
        for context in to_start {
            let response = self.launch(context, None).await;
            if response.status != TriggerStatus::Started {
                warn!(reason = ?response.reason, "promoted trigger failed to start");
            }
        }
    }

    fn drain_locked(&self, state: &mut ManagerState) -> Vec<TriggerExecutionContext> {
        let mut started = Vec::new();
        let mut index = 0;
        while index < state.queued.len() {
            if self.check_admission(state, &state.queued[index]).is_ok() {
                let context = state.queued.remove(index);
                state.active.insert(context.execution_id, context.clone());
                state
                    .resources
                    .acquire(context.execution_id, context.affected_nodes.clone());
                started.push(context);
            } else {
                index += 1;
            }
        }
        started
    }

    /// Periodic sweep: prune old completed entries, expire stale queued
    /// triggers (releasing their locks, emitting `trigger-expired`), then
    /// promote from the queue.
    async fn cleanup(&self) {
        let now = Utc::now();
        let max_age = self.config.completed_max_age_ms as i64;
        let queue_timeout = self.config.conflict.queue_timeout_ms as i64;

        let (expired, to_start) = {
            let mut state = self.state.lock().await;
            state.completed.retain(|_, info| {
                now.signed_duration_since(info.finished_at).num_milliseconds() <= max_age
            });

            let mut expired = Vec::new();
            state.queued.retain(|context| {
                let age = now
                    .signed_duration_since(context.start_time)
                    .num_milliseconds();
                if age > queue_timeout {
                    expired.push(context.clone());
                    false
                } else {
                    true
                }
            });
            for context in &expired {
                state.resources.release(context.execution_id);
                state.completed.insert(
                    context.execution_id,
                    CompletedInfo {
                        context: context.clone(),
                        finished_at: now,
                    },
                );
            }

            (expired, self.drain_locked(&mut state))
        };

        for context in &expired {
            warn!(
                execution_id = %context.execution_id,
                trigger_id = %context.trigger_id,
                "queued trigger expired"
            );
            self.events
                .publish(
                    ExecutionEvent::new(context.execution_id, EventKind::TriggerExpired)
                        .with_workflow(context.workflow_id)
                        .with_data(serde_json::json!({
                            "trigger_id": context.trigger_id,
                            "queued_for_ms": self.config.conflict.queue_timeout_ms,
                        })),
                )
                .await;
        }
        for context in to_start {
            let response = self.launch(context, None).await;
            if response.status != TriggerStatus::Started {
                warn!(reason = ?response.reason, "promoted trigger failed to start");
            }
        }
    }
}

/// Stable priority insert: lower value first, ties keep arrival order.
fn insert_by_priority(queued: &mut Vec<TriggerExecutionContext>, context: TriggerExecutionContext) {
    let position = queued
        .iter()
        .position(|existing| existing.priority > context.priority)
        .unwrap_or(queued.len());
    queued.insert(position, context);
}

use crate::context::{ContextRegistry, ExecutionContext};
use crate::graph::ExecutionGraph;
use crate::node::{NodeDispatchOptions, NodeExecutionRequest, NodeExecutor, NodeHandlerError};
use crate::retry::RetryPolicy;
use crate::wiring;
use async_trait::async_trait;
use chrono::Utc;
use common::config::EngineConfig;
use common::error::{ExecutionError, PlatformError};
use common::events::{EventKind, EventPublisher, ExecutionEvent};
use common::results::ResultCache;
use common::types::{
    ExecutionRecord, ExecutionStatus, FlowNodeState, JsonValue, Node, NodeExecutionRecord,
    NodeInput, NodeOutput, NodeRunStatus, TriggerType, Workflow, WorkflowSettings,
};
use futures::future::BoxFuture;
use persistence::{
    mark_interrupted_executions, ExecutionStore, NodeExecutionPatch, WorkflowRepository,
};
use queue::{Job, JobHandler, JobOptions, JobQueue, JobState};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const WORKFLOW_QUEUE: &str = "workflow-execution";
pub const NODE_QUEUE: &str = "node-execution";

const LOOP_NODE_TYPE: &str = "loop";
const LOOP_BRANCH: &str = "loop";
const DONE_BRANCH: &str = "done";

/// Payload of one workflow-level job. One job drives one whole execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub trigger_data: JsonValue,
    pub trigger_node_id: Option<Uuid>,
    pub timeout_ms: u64,
    pub retry_count: u32,
}

/// Payload of one node-level job: a single node invocation with its wired
/// input. Self-contained so node workers never reload the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeJob {
    pub node_execution_id: Uuid,
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub node: Node,
    pub input: NodeInput,
    pub settings: WorkflowSettings,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Manual invocations may run inactive workflows.
    pub manual: bool,
    pub timeout_ms: Option<u64>,
    /// Pre-allocated execution id (the trigger manager assigns one at
    /// admission); generated when absent.
    pub execution_id: Option<Uuid>,
}

/// The execution engine: turns a workflow plus trigger data into an ordered,
/// persisted, event-emitting run.
///
/// One scheduling loop runs per active execution (a workflow-queue job);
/// node invocations go through the node queue and are awaited by polling the
/// store for the terminal node-execution row.
pub struct ExecutionEngine {
    store: Arc<dyn ExecutionStore>,
    workflows: Arc<dyn WorkflowRepository>,
    queue: Arc<dyn JobQueue>,
    nodes: Arc<dyn NodeExecutor>,
    events: Arc<dyn EventPublisher>,
    results: Arc<dyn ResultCache>,
    contexts: ContextRegistry,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        workflows: Arc<dyn WorkflowRepository>,
        queue: Arc<dyn JobQueue>,
        nodes: Arc<dyn NodeExecutor>,
        events: Arc<dyn EventPublisher>,
        results: Arc<dyn ResultCache>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            workflows,
            queue,
            nodes,
            events,
            results,
            contexts: ContextRegistry::new(),
            config,
        }
    }

    /// Run the recovery sweep and attach the queue workers. Call once at
    /// process start, on a cloned handle: `engine.clone().start().await`.
    pub async fn start(self: Arc<Self>) -> common::Result<()> {
        let recovered = mark_interrupted_executions(self.store.as_ref()).await?;
        if recovered > 0 {
            info!(recovered, "marked interrupted executions as recovered");
        }

        self.queue
            .process(
                WORKFLOW_QUEUE,
                self.config.workflow_concurrency,
                Arc::new(WorkflowJobHandler {
                    engine: self.clone(),
                }),
            )
            .await
            .map_err(|e| PlatformError::Queue(e.to_string()))?;
        self.queue
            .process(
                NODE_QUEUE,
                self.config.node_concurrency,
                Arc::new(NodeJobHandler {
                    engine: self.clone(),
                }),
            )
            .await
            .map_err(|e| PlatformError::Queue(e.to_string()))?;
        Ok(())
    }

    /// Create the execution record and enqueue the workflow job. Returns the
    /// execution id immediately; the run proceeds on the workflow queue.
    pub async fn start_workflow(
        &self,
        workflow_id: Uuid,
        user_id: Uuid,
        trigger_data: Option<JsonValue>,
        options: StartOptions,
        trigger_node_id: Option<Uuid>,
        workflow_snapshot: Option<JsonValue>,
    ) -> common::Result<Uuid> {
        let workflow = self
            .workflows
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| PlatformError::from(ExecutionError::WorkflowNotFound(workflow_id)))?;

        if !workflow.active && !options.manual {
            return Err(ExecutionError::WorkflowInactive(workflow_id).into());
        }

        let execution_id = options.execution_id.unwrap_or_else(Uuid::new_v4);
        let trigger_data = trigger_data.unwrap_or_else(|| serde_json::json!({}));

        let mut record = ExecutionRecord::new(execution_id, workflow_id, trigger_data.clone());
        record.workflow_snapshot = workflow_snapshot;
        self.store.create_execution(&record).await?;

        let node_id_to_name: HashMap<Uuid, String> = workflow
            .nodes
            .iter()
            .map(|n| (n.id, n.name.clone()))
            .collect();
        let context = Arc::new(ExecutionContext::new(
            execution_id,
            workflow_id,
            user_id,
            trigger_data.clone(),
            node_id_to_name,
        ));
        self.contexts.register(context).await;

        let timeout_ms = options
            .timeout_ms
            .or(workflow.settings.execution_timeout_ms)
            .unwrap_or(self.config.workflow_timeout_ms);
        let job = WorkflowJob {
            execution_id,
            workflow_id,
            user_id,
            trigger_data,
            trigger_node_id,
            timeout_ms,
            retry_count: 0,
        };
        let payload = serde_json::to_value(&job)
            .map_err(|e| PlatformError::Internal(format!("workflow job payload: {e}")))?;
        self.queue
            .add(
                WORKFLOW_QUEUE,
                payload,
                JobOptions {
                    // Workflow-level retries are a separate policy; the queue
                    // delivers exactly once. The handler enforces the actual
                    // timeout, the queue-side cap is a backstop.
                    timeout_ms: timeout_ms + 5_000,
                    attempts: 1,
                },
            )
            .await;

        info!(%execution_id, %workflow_id, "execution started");
        Ok(execution_id)
    }

    /// Cooperative cancellation: flips the context flag, removes this
    /// execution's node jobs best-effort and writes the terminal record.
    /// Cancelling an unknown or already-terminal execution is a no-op that
    /// still reports success.
    pub async fn cancel(&self, execution_id: Uuid) -> common::Result<bool> {
        let mut known = false;
        if let Some(context) = self.contexts.get(execution_id).await {
            context.cancel();
            known = true;
        }

        let target = execution_id.to_string();
        for job in self
            .queue
            .get_jobs(NODE_QUEUE, &[JobState::Waiting, JobState::Active])
            .await
        {
            if job.payload.get("execution_id").and_then(JsonValue::as_str)
                == Some(target.as_str())
            {
                self.queue.remove(job.id).await;
            }
        }

        let workflow_id = self
            .store
            .get_execution(execution_id)
            .await?
            .map(|r| r.workflow_id);
        let changed = self
            .store
            .update_execution_status(
                execution_id,
                ExecutionStatus::Cancelled,
                None,
                Some(Utc::now()),
            )
            .await?;
        if changed {
            let mut event = ExecutionEvent::new(execution_id, EventKind::Cancelled)
                .with_status(ExecutionStatus::Cancelled.as_str());
            if let Some(workflow_id) = workflow_id {
                event = event.with_workflow(workflow_id);
            }
            self.events.publish(event).await;
            self.publish_result(execution_id, ExecutionStatus::Cancelled, None, None)
                .await;
            info!(%execution_id, "execution cancelled");
        }
        Ok(known || changed)
    }

    /// Pause the run at the next cooperative checkpoint.
    pub async fn pause(&self, execution_id: Uuid) -> common::Result<bool> {
        if let Some(context) = self.contexts.get(execution_id).await {
            context.pause();
        }
        self.store
            .update_execution_status(execution_id, ExecutionStatus::Paused, None, None)
            .await
            .map_err(Into::into)
    }

    pub async fn resume(&self, execution_id: Uuid) -> common::Result<bool> {
        if let Some(context) = self.contexts.get(execution_id).await {
            context.resume();
        }
        self.store
            .update_execution_status(execution_id, ExecutionStatus::Running, None, None)
            .await
            .map_err(Into::into)
    }

    pub async fn is_running(&self, execution_id: Uuid) -> bool {
        self.contexts.get(execution_id).await.is_some()
    }

    // ------------------------------------------------------------------
    // Workflow job path
    // ------------------------------------------------------------------

    async fn run_execution(self: Arc<Self>, job: WorkflowJob) {
        let execution_id = job.execution_id;
        let context = match self.contexts.get(execution_id).await {
            Some(context) => context,
            None => {
                // The process that owned this context is gone; the record is
                // terminal-ized the same way the startup sweep would.
                warn!(%execution_id, "workflow job without a live context");
                let payload = serde_json::json!({
                    "type": "RECOVERY_ERROR",
                    "message": ExecutionError::Recovered.to_string(),
                    "timestamp": Utc::now().to_rfc3339(),
                });
                let _ = self
                    .store
                    .update_execution_status(
                        execution_id,
                        ExecutionStatus::Error,
                        Some(payload),
                        Some(Utc::now()),
                    )
                    .await;
                return;
            }
        };

        let workflow = match self.load_workflow_for_run(&job).await {
            Ok(workflow) => workflow,
            Err(e) => {
                self.finish_failed(&context, None, &e).await;
                self.contexts.remove(execution_id).await;
                return;
            }
        };

        let timeout = Duration::from_millis(job.timeout_ms);
        let outcome =
            tokio::time::timeout(timeout, self.execute_graph(&context, &workflow, &job)).await;

        match outcome {
            Err(_) => {
                let error = serde_json::json!({
                    "type": "TIMEOUT",
                    "message": ExecutionError::Timeout(job.timeout_ms).to_string(),
                    "timestamp": Utc::now().to_rfc3339(),
                });
                let changed = self
                    .store
                    .update_execution_status(
                        execution_id,
                        ExecutionStatus::Timeout,
                        Some(error.clone()),
                        Some(Utc::now()),
                    )
                    .await
                    .unwrap_or(false);
                if changed {
                    self.events
                        .publish(
                            ExecutionEvent::new(execution_id, EventKind::Failed)
                                .with_workflow(workflow.id)
                                .with_status(ExecutionStatus::Timeout.as_str())
                                .with_error(error.clone()),
                        )
                        .await;
                }
                self.publish_result(execution_id, ExecutionStatus::Timeout, Some(error), None)
                    .await;
            }
            Ok(Ok(())) => {
                let changed = self
                    .store
                    .update_execution_status(
                        execution_id,
                        ExecutionStatus::Success,
                        None,
                        Some(Utc::now()),
                    )
                    .await
                    .unwrap_or(false);
                if changed {
                    self.events
                        .publish(
                            ExecutionEvent::new(execution_id, EventKind::Completed)
                                .with_workflow(workflow.id)
                                .with_status(ExecutionStatus::Success.as_str()),
                        )
                        .await;
                }
                let output = self.collect_leaf_outputs(&context, &workflow).await;
                self.publish_result(execution_id, ExecutionStatus::Success, None, Some(output))
                    .await;
                info!(%execution_id, "execution completed");
            }
            Ok(Err(e)) if e.is_cancellation() => {
                // Either this transition or the one in cancel() wins; the
                // winner emits the single terminal event.
                let changed = self
                    .store
                    .update_execution_status(
                        execution_id,
                        ExecutionStatus::Cancelled,
                        None,
                        Some(Utc::now()),
                    )
                    .await
                    .unwrap_or(false);
                if changed {
                    self.events
                        .publish(
                            ExecutionEvent::new(execution_id, EventKind::Cancelled)
                                .with_workflow(workflow.id)
                                .with_status(ExecutionStatus::Cancelled.as_str()),
                        )
                        .await;
                    self.publish_result(execution_id, ExecutionStatus::Cancelled, None, None)
                        .await;
                }
            }
            Ok(Err(e)) => {
                let payload = self.finish_failed(&context, Some(&workflow), &e).await;
                Self::fire_error_workflow(self.clone(), &workflow, execution_id, payload);
            }
        }

        self.contexts.remove(execution_id).await;
    }

    /// Write the terminal ERROR record, emit `failed` if this call won the
    /// transition, and publish the result. Returns the error payload.
    async fn finish_failed(
        &self,
        context: &Arc<ExecutionContext>,
        workflow: Option<&Workflow>,
        error: &PlatformError,
    ) -> JsonValue {
        let execution_id = context.execution_id;
        let payload = serde_json::json!({
            "message": error.to_string(),
            "stack": JsonValue::Null,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let changed = self
            .store
            .update_execution_status(
                execution_id,
                ExecutionStatus::Error,
                Some(payload.clone()),
                Some(Utc::now()),
            )
            .await
            .unwrap_or(false);
        if changed {
            let mut event = ExecutionEvent::new(execution_id, EventKind::Failed)
                .with_status(ExecutionStatus::Error.as_str())
                .with_error(payload.clone());
            if let Some(workflow) = workflow {
                event = event.with_workflow(workflow.id);
            }
            self.events.publish(event).await;
        }
        self.publish_result(execution_id, ExecutionStatus::Error, Some(payload.clone()), None)
            .await;
        warn!(%execution_id, error = %error, "execution failed");
        payload
    }

    /// Fire-and-forget invocation of the configured error workflow.
    fn fire_error_workflow(
        engine: Arc<ExecutionEngine>,
        workflow: &Workflow,
        failed_execution_id: Uuid,
        error: JsonValue,
    ) {
        let Some(error_workflow_id) = workflow.settings.error_workflow_id else {
            return;
        };
        if error_workflow_id == workflow.id {
            warn!(workflow_id = %workflow.id, "workflow references itself as error workflow");
            return;
        }

        let user_id = workflow.user_id;
        let workflow_id = workflow.id;
        tokio::spawn(async move {
            let payload = serde_json::json!({
                "failed_execution_id": failed_execution_id,
                "workflow_id": workflow_id,
                "error": error,
            });
            let options = StartOptions {
                manual: true,
                ..StartOptions::default()
            };
            if let Err(e) = engine
                .start_workflow(error_workflow_id, user_id, Some(payload), options, None, None)
                .await
            {
                warn!(
                    %error_workflow_id,
                    error = %e,
                    "failed to start error workflow"
                );
            }
        });
    }

    async fn load_workflow_for_run(&self, job: &WorkflowJob) -> Result<Workflow, PlatformError> {
        if let Some(record) = self.store.get_execution(job.execution_id).await? {
            if let Some(snapshot) = record.workflow_snapshot {
                return serde_json::from_value(snapshot)
                    .map_err(|e| PlatformError::Internal(format!("workflow snapshot: {e}")));
            }
        }
        self.workflows
            .get_workflow(job.workflow_id)
            .await?
            .ok_or_else(|| ExecutionError::WorkflowNotFound(job.workflow_id).into())
    }

    async fn execute_graph(
        &self,
        context: &Arc<ExecutionContext>,
        workflow: &Workflow,
        job: &WorkflowJob,
    ) -> Result<(), PlatformError> {
        let graph = ExecutionGraph::build(&workflow.nodes, &workflow.connections)?;

        let trigger_type = self.derive_trigger_type(workflow, job.trigger_node_id);
        self.events
            .publish(
                ExecutionEvent::new(context.execution_id, EventKind::Started)
                    .with_workflow(workflow.id)
                    .with_status(ExecutionStatus::Running.as_str())
                    .with_data(serde_json::json!({ "trigger_type": trigger_type.as_str() })),
            )
            .await;

        self.run_schedule(context, &graph, workflow).await
    }

    fn derive_trigger_type(&self, workflow: &Workflow, trigger_node_id: Option<Uuid>) -> TriggerType {
        if let Some(node_id) = trigger_node_id {
            if let Some(node) = workflow.node(node_id) {
                if let Some(trigger_type) = self
                    .nodes
                    .get_node_definition(&node.node_type)
                    .and_then(|def| def.trigger_type)
                {
                    return trigger_type;
                }
            }
            if let Some(trigger) = workflow.triggers.iter().find(|t| t.node_id == node_id) {
                return trigger.trigger_type;
            }
        }
        TriggerType::Manual
    }

    // ------------------------------------------------------------------
    // Scheduling loop
    // ------------------------------------------------------------------

    async fn run_schedule(
        &self,
        context: &Arc<ExecutionContext>,
        graph: &ExecutionGraph,
        workflow: &Workflow,
    ) -> Result<(), PlatformError> {
        let total = graph.execution_order.len();
        let mut completed = 0usize;
        // Nodes already driven by a loop protocol; the outer pass skips them.
        let mut handled: HashSet<Uuid> = HashSet::new();

        for &node_id in &graph.execution_order {
            if handled.contains(&node_id) {
                continue;
            }
            let executed = self
                .run_single_node(context, graph, workflow, node_id, &mut handled)
                .await?;
            if executed {
                completed += 1;
                self.events
                    .publish(
                        ExecutionEvent::new(context.execution_id, EventKind::ExecutionProgress)
                            .with_workflow(workflow.id)
                            .with_progress(completed, total),
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// One step of the scheduling loop: cancellation and pause checkpoints,
    /// the disabled and branch-aware should-execute checks, then either the
    /// loop protocol or a plain dispatch. Returns whether the node ran.
    fn run_single_node<'a>(
        &'a self,
        context: &'a Arc<ExecutionContext>,
        graph: &'a ExecutionGraph,
        workflow: &'a Workflow,
        node_id: Uuid,
        handled: &'a mut HashSet<Uuid>,
    ) -> BoxFuture<'a, Result<bool, PlatformError>> {
        Box::pin(async move {
            while context.is_paused() && !context.is_cancelled() {
                sleep(Duration::from_millis(self.config.node_poll_interval_ms)).await;
            }
            if context.is_cancelled() {
                return Err(ExecutionError::Cancelled.into());
            }

            let node = match graph.node(node_id) {
                Some(node) => node.clone(),
                None => return Ok(false),
            };
            if node.disabled {
                debug!(%node_id, node = %node.name, "skipping disabled node");
                return Ok(false);
            }
            if !self.should_execute(context, graph, node_id).await {
                // Skipped, not failed: no record, no output.
                self.events
                    .publish(
                        ExecutionEvent::new(context.execution_id, EventKind::NodeStatusUpdate)
                            .with_workflow(workflow.id)
                            .with_node(node_id)
                            .with_status(NodeRunStatus::Skipped.as_str()),
                    )
                    .await;
                debug!(%node_id, node = %node.name, "no satisfied incoming edge, skipping");
                return Ok(false);
            }

            if node.node_type == LOOP_NODE_TYPE {
                self.run_loop(context, graph, workflow, &node, handled).await?;
            } else {
                let input =
                    wiring::assemble_input(&node, graph, context, self.nodes.as_ref()).await;
                self.dispatch_and_wait(context, workflow, &node, input).await?;
            }

            if workflow.settings.save_execution_progress {
                self.save_progress(context, node_id).await;
            }
            Ok(true)
        })
    }

    /// Branch-aware execution test: a node with incoming edges runs iff at
    /// least one edge carries data through its named port. Absent producers
    /// (skipped nodes) count exactly like an empty branch.
    async fn should_execute(
        &self,
        context: &ExecutionContext,
        graph: &ExecutionGraph,
        node_id: Uuid,
    ) -> bool {
        let incoming = graph.incoming(node_id);
        if incoming.is_empty() {
            return true;
        }
        for edge in incoming {
            if let Some(output) = context.output(edge.source_node_id).await {
                if output.satisfies(&edge.source_output) {
                    return true;
                }
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Loop protocol
    // ------------------------------------------------------------------

    async fn run_loop(
        &self,
        context: &Arc<ExecutionContext>,
        graph: &ExecutionGraph,
        workflow: &Workflow,
        node: &Node,
        handled: &mut HashSet<Uuid>,
    ) -> Result<(), PlatformError> {
        let mut iteration: u32 = 0;
        loop {
            if context.is_cancelled() {
                return Err(ExecutionError::Cancelled.into());
            }
            if iteration >= self.config.max_loop_iterations {
                return Err(ExecutionError::LoopIterationsExceeded(node.id).into());
            }
            iteration += 1;

            // Re-wire each iteration so updated upstream outputs flow in.
            let input = wiring::assemble_input(node, graph, context, self.nodes.as_ref()).await;
            let output = self.dispatch_and_wait(context, workflow, node, input).await?;

            let (loop_count, done_count) = match &output {
                NodeOutput::Branches(branches) => (
                    branches.get(LOOP_BRANCH).map_or(0, Vec::len),
                    branches.get(DONE_BRANCH).map_or(0, Vec::len),
                ),
                NodeOutput::Main(_) => (0, 0),
            };

            if loop_count == 0 && done_count == 0 {
                return Err(ExecutionError::LoopStuck(node.id).into());
            }

            if loop_count > 0 {
                for body_id in self.loop_body(graph, node.id) {
                    handled.insert(body_id);
                    self.run_single_node(context, graph, workflow, body_id, handled)
                        .await?;
                }
            }

            if done_count > 0 {
                let mut seen = HashSet::new();
                let targets: Vec<Uuid> = graph
                    .outgoing(node.id)
                    .into_iter()
                    .filter(|c| c.source_output == DONE_BRANCH)
                    .map(|c| c.target_node_id)
                    .filter(|t| seen.insert(*t))
                    .collect();
                for target in targets {
                    handled.insert(target);
                    self.run_single_node(context, graph, workflow, target, handled)
                        .await?;
                }
                debug!(node = %node.name, iterations = iteration, "loop finished");
                return Ok(());
            }
        }
    }

    /// Body subgraph discovery: BFS from the `loop`-branch targets, never
    /// entering the loop node and not traversing past a node that feeds back
    /// into it. Result is ordered by the graph's execution order.
    fn loop_body(&self, graph: &ExecutionGraph, loop_id: Uuid) -> Vec<Uuid> {
        let mut visited = HashSet::new();
        let mut queue: VecDeque<Uuid> = graph
            .outgoing(loop_id)
            .into_iter()
            .filter(|c| c.source_output == LOOP_BRANCH)
            .map(|c| c.target_node_id)
            .collect();

        while let Some(node_id) = queue.pop_front() {
            if node_id == loop_id || !visited.insert(node_id) {
                continue;
            }
            let outgoing = graph.outgoing(node_id);
            if outgoing.iter().any(|c| c.target_node_id == loop_id) {
                continue;
            }
            for connection in outgoing {
                queue.push_back(connection.target_node_id);
            }
        }

        let index: HashMap<Uuid, usize> = graph
            .execution_order
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .collect();
        let mut body: Vec<Uuid> = visited.into_iter().collect();
        body.sort_by_key(|id| index.get(id).copied().unwrap_or(usize::MAX));
        body
    }

    // ------------------------------------------------------------------
    // Node dispatch
    // ------------------------------------------------------------------

    /// Create the node-execution row, enqueue the node job and poll the row
    /// until it is terminal. Each call produces a fresh row, so repeated
    /// loop dispatches are individually recorded.
    async fn dispatch_and_wait(
        &self,
        context: &Arc<ExecutionContext>,
        workflow: &Workflow,
        node: &Node,
        input: NodeInput,
    ) -> Result<NodeOutput, PlatformError> {
        if context.is_cancelled() {
            return Err(ExecutionError::Cancelled.into());
        }

        let input_json = serde_json::to_value(&input)
            .map_err(|e| PlatformError::Internal(format!("node input payload: {e}")))?;
        let record =
            NodeExecutionRecord::queued(context.execution_id, node.id, Some(input_json));
        self.store.create_node_execution(&record).await?;

        let job = NodeJob {
            node_execution_id: record.id,
            execution_id: context.execution_id,
            workflow_id: context.workflow_id,
            user_id: context.user_id,
            node: node.clone(),
            input,
            settings: workflow.settings.clone(),
            retry_count: 0,
        };
        let payload = serde_json::to_value(&job)
            .map_err(|e| PlatformError::Internal(format!("node job payload: {e}")))?;
        self.queue
            .add(
                NODE_QUEUE,
                payload,
                JobOptions {
                    timeout_ms: self.config.node_wait_timeout_ms + 5_000,
                    attempts: 1,
                },
            )
            .await;

        let poll = Duration::from_millis(self.config.node_poll_interval_ms);
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.node_wait_timeout_ms);
        loop {
            if context.is_cancelled() {
                return Err(ExecutionError::Cancelled.into());
            }

            if let Some(current) = self.store.get_node_execution(record.id).await? {
                if current.status.is_terminal() {
                    return match current.status {
                        NodeRunStatus::Success => {
                            if let Some(output) = context.output(node.id).await {
                                Ok(output)
                            } else {
                                let output = current
                                    .output_data
                                    .and_then(|v| serde_json::from_value(v).ok())
                                    .unwrap_or_else(NodeOutput::empty);
                                context.insert_output(node.id, output.clone()).await;
                                Ok(output)
                            }
                        }
                        NodeRunStatus::Cancelled => Err(ExecutionError::Cancelled.into()),
                        _ => {
                            let message = current
                                .error
                                .as_ref()
                                .and_then(|e| e.get("message"))
                                .and_then(JsonValue::as_str)
                                .unwrap_or("node failed")
                                .to_string();
                            Err(ExecutionError::NodeFailed {
                                node_id: node.id,
                                message,
                            }
                            .into())
                        }
                    };
                }
            }

            if tokio::time::Instant::now() >= deadline {
                let error = serde_json::json!({
                    "type": "TIMEOUT",
                    "message": format!(
                        "node did not reach a terminal state within {} ms",
                        self.config.node_wait_timeout_ms
                    ),
                });
                let mut patch = NodeExecutionPatch::status(NodeRunStatus::Error);
                patch.error = Some(error.clone());
                patch.finished_at = Some(Utc::now());
                let _ = self.store.update_node_execution(record.id, patch).await;
                self.events
                    .publish(
                        ExecutionEvent::new(context.execution_id, EventKind::NodeFailed)
                            .with_workflow(context.workflow_id)
                            .with_node(node.id)
                            .with_status(NodeRunStatus::Error.as_str())
                            .with_error(error),
                    )
                    .await;
                return Err(ExecutionError::NodeWaitTimeout {
                    node_id: node.id,
                    waited_ms: self.config.node_wait_timeout_ms,
                }
                .into());
            }

            sleep(poll).await;
        }
    }

    // ------------------------------------------------------------------
    // Node job path (runs on the node queue)
    // ------------------------------------------------------------------

    async fn run_node_job(self: Arc<Self>, job: NodeJob) {
        let node_id = job.node.id;
        let execution_id = job.execution_id;

        let context = match self.contexts.get(execution_id).await {
            Some(context) => context,
            None => {
                let mut patch = NodeExecutionPatch::status(NodeRunStatus::Cancelled);
                patch.finished_at = Some(Utc::now());
                let _ = self
                    .store
                    .update_node_execution(job.node_execution_id, patch)
                    .await;
                return;
            }
        };
        if context.is_cancelled() {
            let mut patch = NodeExecutionPatch::status(NodeRunStatus::Cancelled);
            patch.finished_at = Some(Utc::now());
            let _ = self
                .store
                .update_node_execution(job.node_execution_id, patch)
                .await;
            return;
        }

        let mut patch = NodeExecutionPatch::status(NodeRunStatus::Running);
        patch.started_at = Some(Utc::now());
        let _ = self
            .store
            .update_node_execution(job.node_execution_id, patch)
            .await;
        self.events
            .publish(
                ExecutionEvent::new(execution_id, EventKind::NodeStarted)
                    .with_workflow(job.workflow_id)
                    .with_node(node_id)
                    .with_status(NodeRunStatus::Running.as_str()),
            )
            .await;

        let policy = RetryPolicy::new(self.config.retry.clone());
        let mut retry_count = job.retry_count;
        loop {
            let request = NodeExecutionRequest {
                node_type: job.node.node_type.clone(),
                parameters: job.node.parameters.clone(),
                input: job.input.clone(),
                credentials: None,
                execution_id,
                user_id: job.user_id,
                options: NodeDispatchOptions {
                    timeout_ms: self.config.node_wait_timeout_ms,
                    memory_limit: None,
                    max_output_size: None,
                    node_id,
                },
                workflow_id: job.workflow_id,
                settings: Some(job.settings.clone()),
                node_outputs: context.outputs_snapshot().await,
                node_id_to_name: context.node_id_to_name.clone(),
            };

            let result = self.nodes.execute_node(request).await;

            if result.success {
                if context.is_cancelled() {
                    // The run was cancelled while the call was in flight;
                    // its output is discarded.
                    let mut patch = NodeExecutionPatch::status(NodeRunStatus::Cancelled);
                    patch.finished_at = Some(Utc::now());
                    let _ = self
                        .store
                        .update_node_execution(job.node_execution_id, patch)
                        .await;
                    return;
                }

                let output = result.data.unwrap_or_else(NodeOutput::empty);
                context.insert_output(node_id, output.clone()).await;

                // Event before the terminal row write: the scheduling loop
                // unblocks on the row and must observe node events first.
                self.events
                    .publish(
                        ExecutionEvent::new(execution_id, EventKind::NodeCompleted)
                            .with_workflow(job.workflow_id)
                            .with_node(node_id)
                            .with_status(NodeRunStatus::Success.as_str()),
                    )
                    .await;

                let mut patch = NodeExecutionPatch::status(NodeRunStatus::Success);
                patch.output_data = serde_json::to_value(&output).ok();
                patch.finished_at = Some(Utc::now());
                let _ = self
                    .store
                    .update_node_execution(job.node_execution_id, patch)
                    .await;
                return;
            }

            let error = result
                .error
                .unwrap_or_else(|| NodeHandlerError::message("unknown node error"));

            if policy.is_retryable(&error.message, retry_count) {
                let delay = policy.delay(retry_count);
                retry_count += 1;
                warn!(
                    %node_id,
                    attempt = retry_count,
                    max_retries = policy.max_retries(),
                    delay_ms = delay.as_millis() as u64,
                    error = %error.message,
                    "node failed with retryable error"
                );
                self.events
                    .publish(
                        ExecutionEvent::new(execution_id, EventKind::NodeStatusUpdate)
                            .with_workflow(job.workflow_id)
                            .with_node(node_id)
                            .with_status("retrying")
                            .with_data(serde_json::json!({
                                "attempt": retry_count,
                                "delay_ms": delay.as_millis() as u64,
                            })),
                    )
                    .await;
                sleep(delay).await;
                if context.is_cancelled() {
                    let mut patch = NodeExecutionPatch::status(NodeRunStatus::Cancelled);
                    patch.finished_at = Some(Utc::now());
                    let _ = self
                        .store
                        .update_node_execution(job.node_execution_id, patch)
                        .await;
                    return;
                }
                continue;
            }

            let payload = serde_json::json!({
                "message": error.message,
                "code": error.code,
                "stack": error.stack,
                "timestamp": Utc::now().to_rfc3339(),
            });
            self.events
                .publish(
                    ExecutionEvent::new(execution_id, EventKind::NodeFailed)
                        .with_workflow(job.workflow_id)
                        .with_node(node_id)
                        .with_status(NodeRunStatus::Error.as_str())
                        .with_error(payload.clone()),
                )
                .await;
            let mut patch = NodeExecutionPatch::status(NodeRunStatus::Error);
            patch.error = Some(payload);
            patch.finished_at = Some(Utc::now());
            let _ = self
                .store
                .update_node_execution(job.node_execution_id, patch)
                .await;
            return;
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn save_progress(&self, context: &ExecutionContext, node_id: Uuid) {
        let output = context.output(node_id).await;
        let state = FlowNodeState {
            node_id,
            status: NodeRunStatus::Success,
            output_data: output.and_then(|o| serde_json::to_value(o).ok()),
            updated_at: Utc::now(),
        };
        if let Err(e) = self
            .store
            .save_flow_execution_state(context.execution_id, &[state])
            .await
        {
            warn!(execution_id = %context.execution_id, error = %e, "failed to save flow state");
        }
    }

    /// Terminal outputs of the run: outputs of nodes with no dependents,
    /// keyed by node name.
    async fn collect_leaf_outputs(
        &self,
        context: &ExecutionContext,
        workflow: &Workflow,
    ) -> JsonValue {
        let has_dependents: HashSet<Uuid> = workflow
            .connections
            .iter()
            .map(|c| c.source_node_id)
            .collect();
        let mut outputs = serde_json::Map::new();
        for node in &workflow.nodes {
            if has_dependents.contains(&node.id) {
                continue;
            }
            if let Some(output) = context.output(node.id).await {
                if let Ok(value) = serde_json::to_value(&output) {
                    outputs.insert(node.name.clone(), value);
                }
            }
        }
        JsonValue::Object(outputs)
    }

    async fn publish_result(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        error: Option<JsonValue>,
        output: Option<JsonValue>,
    ) {
        let result = serde_json::json!({
            "execution_id": execution_id,
            "status": status.as_str(),
            "error": error,
            "output": output,
        });
        self.results
            .set(execution_id, result, self.config.result_ttl_ms)
            .await;
    }
}

struct WorkflowJobHandler {
    engine: Arc<ExecutionEngine>,
}

#[async_trait]
impl JobHandler for WorkflowJobHandler {
    async fn handle(&self, job: Job) -> anyhow::Result<()> {
        let parsed: WorkflowJob = serde_json::from_value(job.payload)?;
        self.engine.clone().run_execution(parsed).await;
        Ok(())
    }
}

struct NodeJobHandler {
    engine: Arc<ExecutionEngine>,
}

#[async_trait]
impl JobHandler for NodeJobHandler {
    async fn handle(&self, job: Job) -> anyhow::Result<()> {
        let parsed: NodeJob = serde_json::from_value(job.payload)?;
        self.engine.clone().run_node_job(parsed).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::results::NoopResultCache;
    use common::types::{Item, Position, TriggerDefinition};
    use persistence::{InMemoryStore, InMemoryWorkflowRepository};
    use queue::InMemoryQueue;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    // ---------------- test doubles ----------------

    #[derive(Default)]
    struct MockExecutor {
        scripts: Mutex<HashMap<Uuid, VecDeque<crate::node::NodeHandlerResult>>>,
        gates: Mutex<HashMap<Uuid, Arc<Notify>>>,
        call_times: Mutex<HashMap<Uuid, Vec<tokio::time::Instant>>>,
    }

    impl MockExecutor {
        fn script(&self, node_id: Uuid, results: Vec<crate::node::NodeHandlerResult>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(node_id, results.into_iter().collect());
        }

        fn gate(&self, node_id: Uuid) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            self.gates.lock().unwrap().insert(node_id, gate.clone());
            gate
        }

        fn calls(&self, node_id: Uuid) -> Vec<tokio::time::Instant> {
            self.call_times
                .lock()
                .unwrap()
                .get(&node_id)
                .cloned()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl NodeExecutor for MockExecutor {
        async fn execute_node(
            &self,
            request: NodeExecutionRequest,
        ) -> crate::node::NodeHandlerResult {
            let node_id = request.options.node_id;
            let gate = self.gates.lock().unwrap().get(&node_id).cloned();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            self.call_times
                .lock()
                .unwrap()
                .entry(node_id)
                .or_default()
                .push(tokio::time::Instant::now());

            let scripted = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&node_id)
                .and_then(|queue| queue.pop_front());
            scripted.unwrap_or_else(|| {
                let item = request
                    .input
                    .main()
                    .first()
                    .and_then(|items| items.first())
                    .cloned()
                    .unwrap_or_default();
                crate::node::NodeHandlerResult::ok(NodeOutput::Main(vec![item]))
            })
        }

        fn get_node_definition(&self, node_type: &str) -> Option<crate::node::NodeDefinition> {
            if node_type == "trigger" {
                Some(crate::node::NodeDefinition {
                    trigger_type: Some(TriggerType::Manual),
                    properties: Vec::new(),
                })
            } else {
                None
            }
        }
    }

    #[derive(Default)]
    struct CollectingPublisher {
        events: Mutex<Vec<ExecutionEvent>>,
    }

    impl CollectingPublisher {
        fn kinds(&self, execution_id: Uuid) -> Vec<EventKind> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.execution_id == execution_id)
                .map(|e| e.kind)
                .collect()
        }
    }

    #[async_trait]
    impl EventPublisher for CollectingPublisher {
        async fn publish(&self, event: ExecutionEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    // ---------------- harness ----------------

    struct Harness {
        engine: Arc<ExecutionEngine>,
        store: Arc<InMemoryStore>,
        repo: Arc<InMemoryWorkflowRepository>,
        exec: Arc<MockExecutor>,
        events: Arc<CollectingPublisher>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        let exec = Arc::new(MockExecutor::default());
        let events = Arc::new(CollectingPublisher::default());
        let engine = Arc::new(ExecutionEngine::new(
            store.clone(),
            repo.clone(),
            Arc::new(InMemoryQueue::new()),
            exec.clone(),
            events.clone(),
            Arc::new(NoopResultCache),
            EngineConfig::default(),
        ));
        engine.clone().start().await.unwrap();
        Harness {
            engine,
            store,
            repo,
            exec,
            events,
        }
    }

    fn make_node(node_type: &str, name: &str) -> Node {
        Node {
            id: Uuid::new_v4(),
            node_type: node_type.to_string(),
            name: name.to_string(),
            parameters: HashMap::new(),
            disabled: false,
            position: Position::default(),
        }
    }

    fn connect(source: &Node, output: &str, target: &Node) -> common::types::Connection {
        common::types::Connection {
            id: Uuid::new_v4(),
            source_node_id: source.id,
            source_output: output.to_string(),
            target_node_id: target.id,
            target_input: "main".to_string(),
        }
    }

    fn make_workflow(nodes: Vec<Node>, connections: Vec<common::types::Connection>) -> Workflow {
        let trigger_node = nodes.first().map(|n| n.id).unwrap_or_else(Uuid::new_v4);
        Workflow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            workspace_id: None,
            name: "test workflow".to_string(),
            nodes,
            connections,
            triggers: vec![TriggerDefinition {
                id: "t1".to_string(),
                trigger_type: TriggerType::Manual,
                node_id: trigger_node,
                enabled: true,
            }],
            settings: WorkflowSettings::default(),
            active: true,
        }
    }

    async fn wait_terminal(store: &InMemoryStore, execution_id: Uuid) -> ExecutionRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(600);
        loop {
            if let Some(record) = store.get_execution(execution_id).await.unwrap() {
                if record.status.is_terminal() {
                    return record;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "execution never terminated"
            );
            sleep(Duration::from_millis(10)).await;
        }
    }

    fn records_for(
        records: &[NodeExecutionRecord],
        node_id: Uuid,
    ) -> Vec<&NodeExecutionRecord> {
        records.iter().filter(|r| r.node_id == node_id).collect()
    }

    /// The record flips before the terminal event is published; wait for the
    /// event too before asserting on the stream.
    async fn wait_terminal_event(events: &CollectingPublisher, execution_id: Uuid) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(600);
        loop {
            if events
                .kinds(execution_id)
                .iter()
                .any(EventKind::is_terminal)
            {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no terminal event arrived"
            );
            sleep(Duration::from_millis(10)).await;
        }
    }

    // ---------------- scenarios ----------------

    #[tokio::test(start_paused = true)]
    async fn linear_workflow_runs_to_success() {
        let h = harness().await;
        let a = make_node("trigger", "a");
        let b = make_node("task", "b");
        let c = make_node("task", "c");
        let workflow = make_workflow(
            vec![a.clone(), b.clone(), c.clone()],
            vec![connect(&a, "main", &b), connect(&b, "main", &c)],
        );
        h.repo.insert(workflow.clone()).await;

        let execution_id = h
            .engine
            .start_workflow(
                workflow.id,
                workflow.user_id,
                Some(serde_json::json!({"x": 1})),
                StartOptions::default(),
                Some(a.id),
                None,
            )
            .await
            .unwrap();

        let record = wait_terminal(&h.store, execution_id).await;
        assert_eq!(record.status, ExecutionStatus::Success);

        let node_records = h.store.get_node_executions(execution_id).await.unwrap();
        assert_eq!(node_records.len(), 3);
        for node in [&a, &b, &c] {
            let rows = records_for(&node_records, node.id);
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].status, NodeRunStatus::Success);
            assert!(rows[0].output_data.is_some());
        }

        wait_terminal_event(&h.events, execution_id).await;
        let kinds = h.events.kinds(execution_id);
        assert_eq!(kinds.first(), Some(&EventKind::Started));
        assert_eq!(kinds.last(), Some(&EventKind::Completed));
        let terminal = kinds.iter().filter(|k| k.is_terminal()).count();
        assert_eq!(terminal, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cyclic_workflow_fails_without_node_records() {
        let h = harness().await;
        let a = make_node("task", "a");
        let b = make_node("task", "b");
        let workflow = make_workflow(
            vec![a.clone(), b.clone()],
            vec![connect(&a, "main", &b), connect(&b, "main", &a)],
        );
        h.repo.insert(workflow.clone()).await;

        let execution_id = h
            .engine
            .start_workflow(
                workflow.id,
                workflow.user_id,
                None,
                StartOptions::default(),
                None,
                None,
            )
            .await
            .unwrap();

        let record = wait_terminal(&h.store, execution_id).await;
        assert_eq!(record.status, ExecutionStatus::Error);
        let message = record.error.unwrap()["message"].as_str().unwrap().to_string();
        assert!(message.contains("cycle"), "error was: {message}");

        assert!(h
            .store
            .get_node_executions(execution_id)
            .await
            .unwrap()
            .is_empty());

        wait_terminal_event(&h.events, execution_id).await;
        let kinds = h.events.kinds(execution_id);
        assert_eq!(kinds, vec![EventKind::Failed]);
    }

    #[tokio::test(start_paused = true)]
    async fn unsatisfied_branch_skips_consumer() {
        let h = harness().await;
        let x = make_node("branch", "x");
        let y = make_node("task", "y");
        let z = make_node("task", "z");
        let workflow = make_workflow(
            vec![x.clone(), y.clone(), z.clone()],
            vec![connect(&x, "false", &y), connect(&x, "true", &z)],
        );
        h.repo.insert(workflow.clone()).await;

        let mut branches = HashMap::new();
        branches.insert("true".to_string(), vec![Item::empty()]);
        branches.insert("false".to_string(), Vec::new());
        h.exec.script(
            x.id,
            vec![crate::node::NodeHandlerResult::ok(NodeOutput::Branches(
                branches,
            ))],
        );

        let execution_id = h
            .engine
            .start_workflow(
                workflow.id,
                workflow.user_id,
                None,
                StartOptions::default(),
                Some(x.id),
                None,
            )
            .await
            .unwrap();

        let record = wait_terminal(&h.store, execution_id).await;
        assert_eq!(record.status, ExecutionStatus::Success);

        let node_records = h.store.get_node_executions(execution_id).await.unwrap();
        // Skip purity: no row at all for the skipped node.
        assert!(records_for(&node_records, y.id).is_empty());
        assert_eq!(records_for(&node_records, x.id).len(), 1);
        assert_eq!(records_for(&node_records, z.id).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_back_off_then_succeed() {
        let h = harness().await;
        let z = make_node("task", "z");
        let workflow = make_workflow(vec![z.clone()], vec![]);
        h.repo.insert(workflow.clone()).await;

        h.exec.script(
            z.id,
            vec![
                crate::node::NodeHandlerResult::err(NodeHandlerError::message(
                    "TIMEOUT connecting",
                )),
                crate::node::NodeHandlerResult::err(NodeHandlerError::message(
                    "TIMEOUT connecting",
                )),
                crate::node::NodeHandlerResult::ok(NodeOutput::Main(vec![Item::empty()])),
            ],
        );

        let execution_id = h
            .engine
            .start_workflow(
                workflow.id,
                workflow.user_id,
                None,
                StartOptions::default(),
                None,
                None,
            )
            .await
            .unwrap();

        let record = wait_terminal(&h.store, execution_id).await;
        assert_eq!(record.status, ExecutionStatus::Success);

        let calls = h.exec.calls(z.id);
        assert_eq!(calls.len(), 3);
        // 1000 ms + 2000 ms of back-off between first and third attempt.
        assert!(calls[2] - calls[0] >= Duration::from_millis(3000));

        let rows = h.store.get_node_executions(execution_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, NodeRunStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_fails_the_execution() {
        let h = harness().await;
        let z = make_node("task", "z");
        let workflow = make_workflow(vec![z.clone()], vec![]);
        h.repo.insert(workflow.clone()).await;

        h.exec.script(
            z.id,
            vec![crate::node::NodeHandlerResult::err(
                NodeHandlerError::message("invalid configuration"),
            )],
        );

        let execution_id = h
            .engine
            .start_workflow(
                workflow.id,
                workflow.user_id,
                None,
                StartOptions::default(),
                None,
                None,
            )
            .await
            .unwrap();

        let record = wait_terminal(&h.store, execution_id).await;
        assert_eq!(record.status, ExecutionStatus::Error);
        assert_eq!(h.exec.calls(z.id).len(), 1);

        wait_terminal_event(&h.events, execution_id).await;
        let kinds = h.events.kinds(execution_id);
        assert!(kinds.contains(&EventKind::NodeFailed));
        assert_eq!(kinds.last(), Some(&EventKind::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_protocol_runs_body_then_done() {
        let h = harness().await;
        let l = make_node("loop", "l");
        let b = make_node("task", "b");
        let d = make_node("task", "d");
        let workflow = make_workflow(
            vec![l.clone(), b.clone(), d.clone()],
            vec![connect(&l, "loop", &b), connect(&l, "done", &d)],
        );
        h.repo.insert(workflow.clone()).await;

        let loop_round = |items: Vec<Item>, done: Vec<Item>| {
            let mut branches = HashMap::new();
            branches.insert("loop".to_string(), items);
            branches.insert("done".to_string(), done);
            crate::node::NodeHandlerResult::ok(NodeOutput::Branches(branches))
        };
        h.exec.script(
            l.id,
            vec![
                loop_round(vec![Item::from_json(serde_json::json!({"i": 0}))], vec![]),
                loop_round(vec![Item::from_json(serde_json::json!({"i": 1}))], vec![]),
                loop_round(vec![Item::from_json(serde_json::json!({"i": 2}))], vec![]),
                loop_round(vec![], vec![Item::from_json(serde_json::json!({"ok": true}))]),
            ],
        );

        let execution_id = h
            .engine
            .start_workflow(
                workflow.id,
                workflow.user_id,
                None,
                StartOptions::default(),
                None,
                None,
            )
            .await
            .unwrap();

        let record = wait_terminal(&h.store, execution_id).await;
        assert_eq!(record.status, ExecutionStatus::Success);

        let rows = h.store.get_node_executions(execution_id).await.unwrap();
        // Four loop dispatches, three body runs, one done run.
        assert_eq!(records_for(&rows, l.id).len(), 4);
        assert_eq!(records_for(&rows, b.id).len(), 3);
        assert_eq!(records_for(&rows, d.id).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_loop_fails() {
        let h = harness().await;
        let l = make_node("loop", "l");
        let workflow = make_workflow(vec![l.clone()], vec![]);
        h.repo.insert(workflow.clone()).await;

        let mut branches = HashMap::new();
        branches.insert("loop".to_string(), Vec::new());
        branches.insert("done".to_string(), Vec::new());
        h.exec.script(
            l.id,
            vec![crate::node::NodeHandlerResult::ok(NodeOutput::Branches(
                branches,
            ))],
        );

        let execution_id = h
            .engine
            .start_workflow(
                workflow.id,
                workflow.user_id,
                None,
                StartOptions::default(),
                None,
                None,
            )
            .await
            .unwrap();

        let record = wait_terminal(&h.store, execution_id).await;
        assert_eq!(record.status, ExecutionStatus::Error);
        let message = record.error.unwrap()["message"].as_str().unwrap().to_string();
        assert!(message.contains("loop stuck"), "error was: {message}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_run_stops_downstream_nodes() {
        let h = harness().await;
        let a = make_node("trigger", "a");
        let b = make_node("task", "b");
        let c = make_node("task", "c");
        let workflow = make_workflow(
            vec![a.clone(), b.clone(), c.clone()],
            vec![connect(&a, "main", &b), connect(&b, "main", &c)],
        );
        h.repo.insert(workflow.clone()).await;
        let gate = h.exec.gate(b.id);

        let execution_id = h
            .engine
            .start_workflow(
                workflow.id,
                workflow.user_id,
                None,
                StartOptions::default(),
                Some(a.id),
                None,
            )
            .await
            .unwrap();

        // Wait until b is in flight, then cancel while it is blocked.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(600);
        loop {
            let rows = h.store.get_node_executions(execution_id).await.unwrap();
            if records_for(&rows, b.id)
                .iter()
                .any(|r| r.status == NodeRunStatus::Running)
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "b never started");
            sleep(Duration::from_millis(10)).await;
        }

        assert!(h.engine.cancel(execution_id).await.unwrap());
        gate.notify_one();

        let record = wait_terminal(&h.store, execution_id).await;
        assert_eq!(record.status, ExecutionStatus::Cancelled);

        // The in-flight node settles shortly after the gate opens.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(600);
        let b_status = loop {
            let rows = h.store.get_node_executions(execution_id).await.unwrap();
            if let Some(row) = records_for(&rows, b.id).first() {
                if row.status.is_terminal() {
                    break row.status;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "b never settled");
            sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(b_status, NodeRunStatus::Cancelled);

        let rows = h.store.get_node_executions(execution_id).await.unwrap();
        assert!(records_for(&rows, c.id).is_empty());

        wait_terminal_event(&h.events, execution_id).await;
        let kinds = h.events.kinds(execution_id);
        assert_eq!(kinds.iter().filter(|k| k.is_terminal()).count(), 1);
        assert_eq!(kinds.last(), Some(&EventKind::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_terminal_execution_is_a_no_op() {
        let h = harness().await;
        let a = make_node("trigger", "a");
        let workflow = make_workflow(vec![a.clone()], vec![]);
        h.repo.insert(workflow.clone()).await;

        let execution_id = h
            .engine
            .start_workflow(
                workflow.id,
                workflow.user_id,
                None,
                StartOptions::default(),
                Some(a.id),
                None,
            )
            .await
            .unwrap();
        let record = wait_terminal(&h.store, execution_id).await;
        assert_eq!(record.status, ExecutionStatus::Success);
        wait_terminal_event(&h.events, execution_id).await;

        let events_before = h.events.kinds(execution_id).len();
        assert!(h.engine.cancel(execution_id).await.is_ok());

        let after = h.store.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(after.status, ExecutionStatus::Success);
        assert_eq!(h.events.kinds(execution_id).len(), events_before);
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_workflow_rejects_non_manual_start() {
        let h = harness().await;
        let a = make_node("trigger", "a");
        let mut workflow = make_workflow(vec![a.clone()], vec![]);
        workflow.active = false;
        h.repo.insert(workflow.clone()).await;

        let result = h
            .engine
            .start_workflow(
                workflow.id,
                workflow.user_id,
                None,
                StartOptions::default(),
                None,
                None,
            )
            .await;
        assert!(matches!(
            result,
            Err(PlatformError::Execution(ExecutionError::WorkflowInactive(_)))
        ));

        // A manual start bypasses the active flag.
        let execution_id = h
            .engine
            .start_workflow(
                workflow.id,
                workflow.user_id,
                None,
                StartOptions {
                    manual: true,
                    ..StartOptions::default()
                },
                None,
                None,
            )
            .await
            .unwrap();
        let record = wait_terminal(&h.store, execution_id).await;
        assert_eq!(record.status, ExecutionStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn workflow_timeout_marks_the_run_timed_out() {
        let h = harness().await;
        let a = make_node("task", "a");
        let workflow = make_workflow(vec![a.clone()], vec![]);
        h.repo.insert(workflow.clone()).await;
        // Never released: the run can only end via its timeout.
        let _gate = h.exec.gate(a.id);

        let execution_id = h
            .engine
            .start_workflow(
                workflow.id,
                workflow.user_id,
                None,
                StartOptions {
                    timeout_ms: Some(2_000),
                    ..StartOptions::default()
                },
                None,
                None,
            )
            .await
            .unwrap();

        let record = wait_terminal(&h.store, execution_id).await;
        assert_eq!(record.status, ExecutionStatus::Timeout);
        assert_eq!(record.error.unwrap()["type"], "TIMEOUT");

        wait_terminal_event(&h.events, execution_id).await;
        let kinds = h.events.kinds(execution_id);
        assert_eq!(kinds.last(), Some(&EventKind::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_fires_the_configured_error_workflow() {
        let h = harness().await;
        let handler = make_node("trigger", "on-error");
        let error_workflow = make_workflow(vec![handler.clone()], vec![]);
        h.repo.insert(error_workflow.clone()).await;

        let z = make_node("task", "z");
        let mut workflow = make_workflow(vec![z.clone()], vec![]);
        workflow.settings.error_workflow_id = Some(error_workflow.id);
        h.repo.insert(workflow.clone()).await;
        h.exec.script(
            z.id,
            vec![crate::node::NodeHandlerResult::err(
                NodeHandlerError::message("boom"),
            )],
        );

        let execution_id = h
            .engine
            .start_workflow(
                workflow.id,
                workflow.user_id,
                None,
                StartOptions::default(),
                None,
                None,
            )
            .await
            .unwrap();
        let record = wait_terminal(&h.store, execution_id).await;
        assert_eq!(record.status, ExecutionStatus::Error);

        // The error workflow runs as its own execution.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(600);
        loop {
            let fired = h
                .events
                .events
                .lock()
                .unwrap()
                .iter()
                .any(|e| {
                    e.workflow_id == Some(error_workflow.id) && e.kind == EventKind::Completed
                });
            if fired {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "error workflow never ran"
            );
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pause_holds_the_next_node_until_resume() {
        let h = harness().await;
        let a = make_node("trigger", "a");
        let b = make_node("task", "b");
        let workflow = make_workflow(
            vec![a.clone(), b.clone()],
            vec![connect(&a, "main", &b)],
        );
        h.repo.insert(workflow.clone()).await;
        let gate = h.exec.gate(a.id);

        let execution_id = h
            .engine
            .start_workflow(
                workflow.id,
                workflow.user_id,
                None,
                StartOptions::default(),
                Some(a.id),
                None,
            )
            .await
            .unwrap();

        // Pause while the first node is in flight, then let it finish.
        assert!(h.engine.pause(execution_id).await.unwrap());
        let record = h.store.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Paused);
        gate.notify_one();

        // The scheduling loop parks before b; no b row appears.
        sleep(Duration::from_millis(500)).await;
        let rows = h.store.get_node_executions(execution_id).await.unwrap();
        assert!(records_for(&rows, b.id).is_empty());

        assert!(h.engine.resume(execution_id).await.unwrap());
        let record = wait_terminal(&h.store, execution_id).await;
        assert_eq!(record.status, ExecutionStatus::Success);
        let rows = h.store.get_node_executions(execution_id).await.unwrap();
        assert_eq!(records_for(&rows, b.id).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn save_execution_progress_persists_flow_state() {
        let h = harness().await;
        let a = make_node("trigger", "a");
        let b = make_node("task", "b");
        let mut workflow = make_workflow(
            vec![a.clone(), b.clone()],
            vec![connect(&a, "main", &b)],
        );
        workflow.settings.save_execution_progress = true;
        h.repo.insert(workflow.clone()).await;

        let execution_id = h
            .engine
            .start_workflow(
                workflow.id,
                workflow.user_id,
                None,
                StartOptions::default(),
                Some(a.id),
                None,
            )
            .await
            .unwrap();
        wait_terminal(&h.store, execution_id).await;

        let states = h
            .store
            .load_flow_execution_state(execution_id)
            .await
            .unwrap();
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|s| s.status == NodeRunStatus::Success));
    }
}

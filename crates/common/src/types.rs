use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

// Basic types
pub type JsonValue = serde_json::Value;

// Workflow types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub workspace_id: Option<Uuid>,
    pub name: String,
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
    pub triggers: Vec<TriggerDefinition>,
    pub settings: WorkflowSettings,
    pub active: bool,
}

impl Workflow {
    pub fn node(&self, id: Uuid) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_ids(&self) -> Vec<Uuid> {
        self.nodes.iter().map(|n| n.id).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub node_type: String,
    pub name: String,
    pub parameters: HashMap<String, JsonValue>,
    pub disabled: bool,
    pub position: Position,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A directed edge between two named ports.
///
/// `source_output` is a port name, not an index: `"main"` for standard nodes,
/// a branch name (`"true"`, `"false"`) for branching nodes, `"loop"`/`"done"`
/// for loop nodes. `target_input` is `"main"` for data, or a service socket
/// name (`"model"`, `"memory"`, `"tools"`) that binds a node reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub source_node_id: Uuid,
    pub source_output: String,
    pub target_node_id: Uuid,
    pub target_input: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub id: String,
    pub trigger_type: TriggerType,
    pub node_id: Uuid,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    pub execution_timeout_ms: Option<u64>,
    pub save_execution_progress: bool,
    pub error_workflow_id: Option<Uuid>,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            execution_timeout_ms: None,
            save_execution_progress: false,
            error_workflow_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerType {
    Webhook,
    Schedule,
    Manual,
    WorkflowCalled,
    Polling,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Webhook => "webhook",
            TriggerType::Schedule => "schedule",
            TriggerType::Manual => "manual",
            TriggerType::WorkflowCalled => "workflow-called",
            TriggerType::Polling => "polling",
        }
    }
}

// Item / output types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryPayload {
    pub mime_type: String,
    /// Base64-encoded payload.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub json: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<HashMap<String, BinaryPayload>>,
}

impl Item {
    pub fn from_json(json: JsonValue) -> Self {
        Self { json, binary: None }
    }

    pub fn empty() -> Self {
        Self::from_json(serde_json::json!({}))
    }
}

impl Default for Item {
    fn default() -> Self {
        Self::empty()
    }
}

/// Output of one node invocation.
///
/// Standard nodes emit a single `main` item list; branching and loop nodes
/// emit named branches. Consumers read through [`NodeOutput::items_for`] so
/// the branch name on the consuming edge always selects the right data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeOutput {
    #[serde(rename = "main")]
    Main(Vec<Item>),
    #[serde(rename = "branches")]
    Branches(HashMap<String, Vec<Item>>),
}

impl NodeOutput {
    pub fn empty() -> Self {
        NodeOutput::Main(Vec::new())
    }

    /// Items visible through an edge with the given `source_output` port.
    ///
    /// Branch outputs route strictly by branch name; a `main` output ignores
    /// the port name.
    pub fn items_for(&self, source_output: &str) -> &[Item] {
        match self {
            NodeOutput::Main(items) => items,
            NodeOutput::Branches(branches) => branches
                .get(source_output)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
        }
    }

    /// Whether an edge reading through the given port carries any data.
    pub fn satisfies(&self, source_output: &str) -> bool {
        !self.items_for(source_output).is_empty()
    }
}

/// A reference to another node's configuration, delivered on a service input
/// socket instead of item data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRef {
    pub id: Uuid,
    pub node_type: String,
    pub node_id: Uuid,
    pub parameters: HashMap<String, JsonValue>,
    pub credentials: HashMap<String, String>,
}

/// One named input socket of a node, after wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InputSlot {
    /// Data socket: one item list per incoming edge.
    #[serde(rename = "items")]
    Items(Vec<Vec<Item>>),
    /// Service socket: one node reference per incoming edge.
    #[serde(rename = "services")]
    Services(Vec<NodeRef>),
}

/// Assembled input for one node invocation, keyed by input socket name.
/// A `main` slot is always present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInput {
    pub slots: HashMap<String, InputSlot>,
}

impl NodeInput {
    pub const MAIN: &'static str = "main";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, socket: impl Into<String>, slot: InputSlot) {
        self.slots.insert(socket.into(), slot);
    }

    pub fn main(&self) -> &[Vec<Item>] {
        match self.slots.get(Self::MAIN) {
            Some(InputSlot::Items(items)) => items,
            _ => &[],
        }
    }

    /// Guarantee the `main` slot exists, defaulting to a single empty item.
    pub fn ensure_main(&mut self) {
        self.slots
            .entry(Self::MAIN.to_string())
            .or_insert_with(|| InputSlot::Items(vec![vec![Item::empty()]]));
    }
}

// Execution records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Success,
    Error,
    Cancelled,
    Paused,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success
                | ExecutionStatus::Error
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Error => "ERROR",
            ExecutionStatus::Cancelled => "CANCELLED",
            ExecutionStatus::Paused => "PAUSED",
            ExecutionStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RUNNING" => Some(ExecutionStatus::Running),
            "SUCCESS" => Some(ExecutionStatus::Success),
            "ERROR" => Some(ExecutionStatus::Error),
            "CANCELLED" => Some(ExecutionStatus::Cancelled),
            "PAUSED" => Some(ExecutionStatus::Paused),
            "TIMEOUT" => Some(ExecutionStatus::Timeout),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub trigger_data: JsonValue,
    pub error: Option<JsonValue>,
    pub progress: Option<JsonValue>,
    pub workflow_snapshot: Option<JsonValue>,
}

impl ExecutionRecord {
    pub fn new(id: Uuid, workflow_id: Uuid, trigger_data: JsonValue) -> Self {
        Self {
            id,
            workflow_id,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            trigger_data,
            error: None,
            progress: None,
            workflow_snapshot: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRunStatus {
    Waiting,
    Queued,
    Running,
    Success,
    Error,
    Cancelled,
    Skipped,
}

impl NodeRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeRunStatus::Success
                | NodeRunStatus::Error
                | NodeRunStatus::Cancelled
                | NodeRunStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRunStatus::Waiting => "WAITING",
            NodeRunStatus::Queued => "QUEUED",
            NodeRunStatus::Running => "RUNNING",
            NodeRunStatus::Success => "SUCCESS",
            NodeRunStatus::Error => "ERROR",
            NodeRunStatus::Cancelled => "CANCELLED",
            NodeRunStatus::Skipped => "SKIPPED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "WAITING" => Some(NodeRunStatus::Waiting),
            "QUEUED" => Some(NodeRunStatus::Queued),
            "RUNNING" => Some(NodeRunStatus::Running),
            "SUCCESS" => Some(NodeRunStatus::Success),
            "ERROR" => Some(NodeRunStatus::Error),
            "CANCELLED" => Some(NodeRunStatus::Cancelled),
            "SKIPPED" => Some(NodeRunStatus::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: Uuid,
    pub status: NodeRunStatus,
    pub input_data: Option<JsonValue>,
    pub output_data: Option<JsonValue>,
    pub error: Option<JsonValue>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeExecutionRecord {
    pub fn queued(execution_id: Uuid, node_id: Uuid, input_data: Option<JsonValue>) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            node_id,
            status: NodeRunStatus::Queued,
            input_data,
            output_data: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Per-node progress snapshot persisted when `save_execution_progress` is on.
/// Rows are keyed by the composite `"<execution_id>_<node_id>"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNodeState {
    pub node_id: Uuid,
    pub status: NodeRunStatus,
    pub output_data: Option<JsonValue>,
    pub updated_at: DateTime<Utc>,
}

pub fn flow_state_key(execution_id: Uuid, node_id: Uuid) -> String {
    format!("{}_{}", execution_id, node_id)
}

// Trigger admission types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerExecutionContext {
    pub execution_id: Uuid,
    pub trigger_id: String,
    pub trigger_type: TriggerType,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub trigger_node_id: Uuid,
    pub trigger_data: JsonValue,
    /// Lower value wins; equal priorities keep insertion order.
    pub priority: u8,
    pub affected_nodes: HashSet<Uuid>,
    pub isolated_execution: bool,
    pub start_time: DateTime<Utc>,
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_output_routes_by_port_name() {
        let mut branches = HashMap::new();
        branches.insert("true".to_string(), vec![Item::from_json(serde_json::json!({"x": 1}))]);
        branches.insert("false".to_string(), vec![]);
        let output = NodeOutput::Branches(branches);

        assert!(output.satisfies("true"));
        assert!(!output.satisfies("false"));
        assert!(!output.satisfies("missing"));
        assert_eq!(output.items_for("true").len(), 1);
    }

    #[test]
    fn main_output_ignores_port_name() {
        let output = NodeOutput::Main(vec![Item::empty()]);
        assert!(output.satisfies("main"));
        assert!(output.satisfies("anything"));
    }

    #[test]
    fn node_input_main_fallback() {
        let mut input = NodeInput::new();
        assert!(input.main().is_empty());

        input.ensure_main();
        assert_eq!(input.main().len(), 1);
        assert_eq!(input.main()[0].len(), 1);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
        assert!(!NodeRunStatus::Queued.is_terminal());
        assert!(NodeRunStatus::Skipped.is_terminal());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Error,
            ExecutionStatus::Cancelled,
            ExecutionStatus::Paused,
            ExecutionStatus::Timeout,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn flow_state_composite_key() {
        let execution_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();
        let key = flow_state_key(execution_id, node_id);
        assert_eq!(key, format!("{}_{}", execution_id, node_id));
    }
}

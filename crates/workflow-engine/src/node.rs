use async_trait::async_trait;
use common::types::{
    JsonValue, NodeInput, NodeOutput, TriggerType, WorkflowSettings,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One entry of a node type's property schema. Properties with
/// `kind == "credential"` drive credential synthesis during input wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeProperty {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub allowed_types: Vec<String>,
}

impl NodeProperty {
    pub const CREDENTIAL_KIND: &'static str = "credential";

    pub fn is_credential(&self) -> bool {
        self.kind == Self::CREDENTIAL_KIND
    }
}

/// Static description of a node type, as registered with the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Set when the node type is a trigger; its value names the trigger kind.
    pub trigger_type: Option<TriggerType>,
    #[serde(default)]
    pub properties: Vec<NodeProperty>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDispatchOptions {
    pub timeout_ms: u64,
    pub memory_limit: Option<u64>,
    pub max_output_size: Option<u64>,
    pub node_id: Uuid,
}

/// Everything a node implementation receives for one invocation. The engine
/// passes parameters through untouched; it never interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRequest {
    pub node_type: String,
    pub parameters: HashMap<String, JsonValue>,
    pub input: NodeInput,
    pub credentials: Option<HashMap<String, String>>,
    pub execution_id: Uuid,
    pub user_id: Uuid,
    pub options: NodeDispatchOptions,
    pub workflow_id: Uuid,
    pub settings: Option<WorkflowSettings>,
    pub node_outputs: HashMap<Uuid, NodeOutput>,
    pub node_id_to_name: HashMap<Uuid, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHandlerError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl NodeHandlerError {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            stack: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHandlerResult {
    pub success: bool,
    pub data: Option<NodeOutput>,
    pub error: Option<NodeHandlerError>,
}

impl NodeHandlerResult {
    pub fn ok(data: NodeOutput) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: NodeHandlerError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Capability boundary to node implementations. Nodes are opaque to the
/// engine: it dispatches through this trait and stores whatever comes back.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute_node(&self, request: NodeExecutionRequest) -> NodeHandlerResult;

    fn get_node_definition(&self, node_type: &str) -> Option<NodeDefinition>;
}

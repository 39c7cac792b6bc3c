use async_trait::async_trait;
use common::types::{Item, NodeOutput, TriggerType};
use workflow_engine::{NodeDefinition, NodeExecutionRequest, NodeExecutor, NodeHandlerResult};

/// Default node executor for the standalone binary: flattens the `main`
/// input back out unchanged and registers the builtin trigger node types.
/// Node packs implement [`NodeExecutor`] themselves and replace this at
/// composition time.
pub struct PassthroughExecutor;

#[async_trait]
impl NodeExecutor for PassthroughExecutor {
    async fn execute_node(&self, request: NodeExecutionRequest) -> NodeHandlerResult {
        let mut items: Vec<Item> = request
            .input
            .main()
            .iter()
            .flat_map(|per_edge| per_edge.iter().cloned())
            .collect();
        if items.is_empty() {
            items.push(Item::empty());
        }
        NodeHandlerResult::ok(NodeOutput::Main(items))
    }

    fn get_node_definition(&self, node_type: &str) -> Option<NodeDefinition> {
        let trigger_type = match node_type {
            "manual-trigger" => TriggerType::Manual,
            "webhook-trigger" => TriggerType::Webhook,
            "schedule-trigger" => TriggerType::Schedule,
            "workflow-trigger" => TriggerType::WorkflowCalled,
            _ => return None,
        };
        Some(NodeDefinition {
            trigger_type: Some(trigger_type),
            properties: Vec::new(),
        })
    }
}

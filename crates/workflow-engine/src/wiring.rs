use crate::context::ExecutionContext;
use crate::graph::ExecutionGraph;
use crate::node::NodeExecutor;
use common::types::{Connection, InputSlot, Item, JsonValue, Node, NodeInput, NodeRef};
use std::collections::HashMap;

/// Input sockets that carry item data rather than node references.
const DATA_SOCKETS: [&str; 2] = ["main", "done"];

/// Prefix marking parameter values that reference stored credentials.
const CREDENTIAL_REF_PREFIX: &str = "cred_";

/// Assemble the input for one node invocation from upstream outputs and the
/// incoming connections' port names.
///
/// Trigger roots (no incoming edges) receive synthesized trigger input;
/// other nodes receive per-edge item arrays on data sockets and node
/// references on service sockets. The `main` slot always exists.
pub async fn assemble_input(
    node: &Node,
    graph: &ExecutionGraph,
    ctx: &ExecutionContext,
    executor: &dyn NodeExecutor,
) -> NodeInput {
    let incoming = graph.incoming(node.id);
    let mut input = NodeInput::new();

    if incoming.is_empty() {
        input.insert(
            NodeInput::MAIN,
            InputSlot::Items(vec![trigger_items(node, ctx, executor)]),
        );
        input.ensure_main();
        return input;
    }

    // Group incoming edges by their target socket, preserving edge order.
    let mut sockets: Vec<(String, Vec<&Connection>)> = Vec::new();
    for edge in incoming {
        match sockets.iter_mut().find(|(name, _)| *name == edge.target_input) {
            Some((_, edges)) => edges.push(edge),
            None => sockets.push((edge.target_input.clone(), vec![edge])),
        }
    }

    for (socket, edges) in sockets {
        if !DATA_SOCKETS.contains(&socket.as_str()) {
            let refs = edges
                .iter()
                .filter_map(|edge| {
                    graph
                        .node(edge.source_node_id)
                        .map(|source| node_reference(source, executor))
                })
                .collect();
            input.insert(socket, InputSlot::Services(refs));
            continue;
        }

        // Data socket: one item array per edge, read through the branch
        // named on the edge. An empty read becomes a single empty item.
        let mut per_edge = Vec::with_capacity(edges.len());
        for edge in edges {
            let items = match ctx.output(edge.source_node_id).await {
                Some(output) => output.items_for(&edge.source_output).to_vec(),
                None => Vec::new(),
            };
            if items.is_empty() {
                per_edge.push(vec![Item::empty()]);
            } else {
                per_edge.push(items);
            }
        }
        input.insert(socket, InputSlot::Items(per_edge));
    }

    input.ensure_main();
    input
}

/// Trigger-root input synthesis. Node types registered with a trigger kind
/// get their payload wrapped as an item; anything else is handed the raw
/// trigger payload, coerced into item shape.
fn trigger_items(node: &Node, ctx: &ExecutionContext, executor: &dyn NodeExecutor) -> Vec<Item> {
    let mut payload = ctx.trigger_data.clone();
    if payload.is_null() {
        payload = serde_json::json!({});
    }

    let declares_trigger = executor
        .get_node_definition(&node.node_type)
        .and_then(|def| def.trigger_type)
        .is_some();

    if declares_trigger {
        vec![Item::from_json(payload)]
    } else {
        let item = serde_json::from_value::<Item>(payload.clone())
            .unwrap_or_else(|_| Item::from_json(payload));
        vec![item]
    }
}

/// Build the node reference delivered on a service socket, synthesizing a
/// credentials map from the source node's parameters.
fn node_reference(source: &Node, executor: &dyn NodeExecutor) -> NodeRef {
    let definition = executor.get_node_definition(&source.node_type);
    let mut credentials = HashMap::new();
    let mut mapped = Vec::new();

    if let Some(definition) = &definition {
        for property in definition.properties.iter().filter(|p| p.is_credential()) {
            if let Some(JsonValue::String(value)) = source.parameters.get(&property.name) {
                if let Some(credential_type) = property.allowed_types.first() {
                    credentials.insert(credential_type.clone(), value.clone());
                    mapped.push(property.name.as_str());
                }
            }
        }
    }

    // Credential-shaped values the schema did not map keep their parameter
    // name as the credential key.
    for (name, value) in &source.parameters {
        if mapped.contains(&name.as_str()) {
            continue;
        }
        if let JsonValue::String(value) = value {
            if value.starts_with(CREDENTIAL_REF_PREFIX) {
                credentials.insert(name.clone(), value.clone());
            }
        }
    }

    NodeRef {
        id: source.id,
        node_type: source.node_type.clone(),
        node_id: source.id,
        parameters: source.parameters.clone(),
        credentials,
    }
}

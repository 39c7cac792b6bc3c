use crate::resolver::{circular_dependency, kahn_order};
use common::error::GraphValidationError;
use common::types::{Connection, Node};
use std::collections::{HashMap, HashSet};
use tracing::warn;
use uuid::Uuid;

/// Materialized execution view of one workflow: adjacency, in-degrees and the
/// topological order. Built once per run and immutable afterwards.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    nodes: HashMap<Uuid, Node>,
    connections: Vec<Connection>,
    pub adjacency: HashMap<Uuid, Vec<Uuid>>,
    pub in_degree: HashMap<Uuid, usize>,
    pub execution_order: Vec<Uuid>,
}

impl ExecutionGraph {
    /// Build the graph. Connections whose endpoints are not part of the node
    /// set are dropped with a warning; a graph that cannot be linearized
    /// fails with `CircularDependency`. This is the authoritative cycle
    /// check on the execution path.
    pub fn build(nodes: &[Node], connections: &[Connection]) -> Result<Self, GraphValidationError> {
        let node_ids: Vec<Uuid> = nodes.iter().map(|n| n.id).collect();
        let node_set: HashSet<Uuid> = node_ids.iter().copied().collect();

        let mut kept = Vec::with_capacity(connections.len());
        for connection in connections {
            if !node_set.contains(&connection.source_node_id)
                || !node_set.contains(&connection.target_node_id)
            {
                warn!(
                    connection_id = %connection.id,
                    source = %connection.source_node_id,
                    target = %connection.target_node_id,
                    "dropping connection with unknown endpoint"
                );
                continue;
            }
            kept.push(connection.clone());
        }

        let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        let mut in_degree: HashMap<Uuid, usize> = HashMap::new();
        for &id in &node_ids {
            adjacency.entry(id).or_default();
            in_degree.entry(id).or_insert(0);
        }
        for connection in &kept {
            adjacency
                .entry(connection.source_node_id)
                .or_default()
                .push(connection.target_node_id);
            *in_degree.entry(connection.target_node_id).or_insert(0) += 1;
        }

        let execution_order = kahn_order(&node_ids, &kept);
        if execution_order.len() != node_ids.len() {
            let ordered: HashSet<Uuid> = execution_order.iter().copied().collect();
            let affected: Vec<Uuid> = node_ids
                .iter()
                .copied()
                .filter(|id| !ordered.contains(id))
                .collect();
            return Err(circular_dependency(affected.clone(), affected, &[]));
        }

        Ok(Self {
            nodes: nodes.iter().map(|n| (n.id, n.clone())).collect(),
            connections: kept,
            adjacency,
            in_degree,
            execution_order,
        })
    }

    pub fn node(&self, id: Uuid) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Connections targeting `node_id`, in declaration order.
    pub fn incoming(&self, node_id: Uuid) -> Vec<&Connection> {
        self.connections
            .iter()
            .filter(|c| c.target_node_id == node_id)
            .collect()
    }

    /// Connections sourced at `node_id`, in declaration order.
    pub fn outgoing(&self, node_id: Uuid) -> Vec<&Connection> {
        self.connections
            .iter()
            .filter(|c| c.source_node_id == node_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::Position;
    use std::collections::HashMap as Map;

    fn node(id: Uuid, name: &str) -> Node {
        Node {
            id,
            node_type: "task".to_string(),
            name: name.to_string(),
            parameters: Map::new(),
            disabled: false,
            position: Position::default(),
        }
    }

    fn edge(source: Uuid, target: Uuid) -> Connection {
        Connection {
            id: Uuid::new_v4(),
            source_node_id: source,
            source_output: "main".to_string(),
            target_node_id: target,
            target_input: "main".to_string(),
        }
    }

    #[test]
    fn builds_order_and_degrees() {
        let a = node(Uuid::new_v4(), "a");
        let b = node(Uuid::new_v4(), "b");
        let c = node(Uuid::new_v4(), "c");
        let graph = ExecutionGraph::build(
            &[a.clone(), b.clone(), c.clone()],
            &[edge(a.id, b.id), edge(b.id, c.id)],
        )
        .unwrap();

        assert_eq!(graph.execution_order, vec![a.id, b.id, c.id]);
        assert_eq!(graph.in_degree[&a.id], 0);
        assert_eq!(graph.in_degree[&c.id], 1);
        assert_eq!(graph.adjacency[&a.id], vec![b.id]);
        assert_eq!(graph.incoming(c.id).len(), 1);
        assert_eq!(graph.outgoing(a.id).len(), 1);
    }

    #[test]
    fn ignores_connections_with_unknown_endpoints() {
        let a = node(Uuid::new_v4(), "a");
        let b = node(Uuid::new_v4(), "b");
        let ghost = Uuid::new_v4();
        let graph = ExecutionGraph::build(
            &[a.clone(), b.clone()],
            &[edge(a.id, b.id), edge(a.id, ghost), edge(ghost, b.id)],
        )
        .unwrap();

        assert_eq!(graph.outgoing(a.id).len(), 1);
        assert_eq!(graph.incoming(b.id).len(), 1);
        assert_eq!(graph.execution_order.len(), 2);
    }

    #[test]
    fn cycle_fails_the_build() {
        let a = node(Uuid::new_v4(), "a");
        let b = node(Uuid::new_v4(), "b");
        let result = ExecutionGraph::build(
            &[a.clone(), b.clone()],
            &[edge(a.id, b.id), edge(b.id, a.id)],
        );
        assert!(matches!(
            result,
            Err(GraphValidationError::CircularDependency(_))
        ));
    }
}

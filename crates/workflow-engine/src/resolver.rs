use common::error::{GraphValidationError, ValidationDetail};
use common::types::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// One cycle found by [`DependencyResolver::detect_cycles`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    /// The nodes forming the cycle, in traversal order.
    pub nodes: Vec<Uuid>,
    /// The full DFS path at the moment the back edge was found.
    pub path: Vec<Uuid>,
    pub severity: CycleSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleSeverity {
    Error,
}

/// Kahn's algorithm over the edges whose endpoints are both present.
///
/// This is the single canonical ordering used by both the resolver and the
/// execution graph builder. Returns fewer ids than `node_ids` when the graph
/// contains a cycle; callers turn that into a `CircularDependency`.
pub(crate) fn kahn_order(node_ids: &[Uuid], connections: &[Connection]) -> Vec<Uuid> {
    let node_set: HashSet<Uuid> = node_ids.iter().copied().collect();
    let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    let mut in_degree: HashMap<Uuid, usize> = HashMap::new();

    for &id in node_ids {
        adjacency.entry(id).or_default();
        in_degree.entry(id).or_insert(0);
    }

    for edge in connections {
        if !node_set.contains(&edge.source_node_id) || !node_set.contains(&edge.target_node_id) {
            continue;
        }
        adjacency
            .entry(edge.source_node_id)
            .or_default()
            .push(edge.target_node_id);
        *in_degree.entry(edge.target_node_id).or_insert(0) += 1;
    }

    // Seed in declaration order so the linearization is deterministic.
    let mut queue: VecDeque<Uuid> = node_ids
        .iter()
        .copied()
        .filter(|id| in_degree.get(id).copied() == Some(0))
        .collect();

    let mut sorted = Vec::with_capacity(node_ids.len());
    while let Some(node_id) = queue.pop_front() {
        sorted.push(node_id);
        if let Some(neighbors) = adjacency.get(&node_id) {
            for &neighbor in neighbors {
                if let Some(degree) = in_degree.get_mut(&neighbor) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(neighbor);
                    }
                }
            }
        }
    }

    sorted
}

pub(crate) fn circular_dependency(
    affected: Vec<Uuid>,
    chain: Vec<Uuid>,
    path: &[Uuid],
) -> GraphValidationError {
    GraphValidationError::CircularDependency(
        ValidationDetail::new(
            affected,
            "break the cycle by removing or redirecting one of its connections",
        )
        .with_chain(chain)
        .with_path(path.to_vec()),
    )
}

/// Stateless graph analysis over `(node_ids, connections)`.
///
/// All operations rebuild their adjacency views per call; nothing here is
/// cached across workflow edits.
pub struct DependencyResolver {
    node_ids: Vec<Uuid>,
    connections: Vec<Connection>,
}

impl DependencyResolver {
    pub fn new(node_ids: Vec<Uuid>, connections: Vec<Connection>) -> Self {
        Self {
            node_ids,
            connections,
        }
    }

    pub fn for_workflow(workflow: &common::types::Workflow) -> Self {
        Self::new(workflow.node_ids(), workflow.connections.clone())
    }

    /// Unique direct dependencies (sources of edges targeting `node_id`).
    pub fn dependencies(&self, node_id: Uuid) -> Vec<Uuid> {
        let mut seen = HashSet::new();
        self.connections
            .iter()
            .filter(|c| c.target_node_id == node_id)
            .map(|c| c.source_node_id)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Unique direct dependents (targets of edges sourced at `node_id`).
    pub fn downstream(&self, node_id: Uuid) -> Vec<Uuid> {
        let mut seen = HashSet::new();
        self.connections
            .iter()
            .filter(|c| c.source_node_id == node_id)
            .map(|c| c.target_node_id)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Everything reachable downstream of `node_id`, excluding the node
    /// itself. Terminates on cycles without revisiting.
    pub fn transitive_downstream(&self, node_id: Uuid) -> HashSet<Uuid> {
        self.traverse(node_id, |c| (c.source_node_id, c.target_node_id))
    }

    /// Everything `node_id` transitively depends on, excluding the node
    /// itself.
    pub fn transitive_dependencies(&self, node_id: Uuid) -> HashSet<Uuid> {
        self.traverse(node_id, |c| (c.target_node_id, c.source_node_id))
    }

    fn traverse(&self, start: Uuid, direction: impl Fn(&Connection) -> (Uuid, Uuid)) -> HashSet<Uuid> {
        let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for connection in &self.connections {
            let (from, to) = direction(connection);
            adjacency.entry(from).or_default().push(to);
        }

        let mut visited = HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if let Some(neighbors) = adjacency.get(&node) {
                for &neighbor in neighbors {
                    if neighbor != start && visited.insert(neighbor) {
                        stack.push(neighbor);
                    }
                }
            }
        }
        visited
    }

    /// DFS cycle detection over all weakly-connected components.
    ///
    /// Neighbor lists are sorted, so the result is independent of the order
    /// in which connections were supplied.
    pub fn detect_cycles(&self) -> Vec<CycleRecord> {
        let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for connection in &self.connections {
            adjacency
                .entry(connection.source_node_id)
                .or_default()
                .push(connection.target_node_id);
        }
        for neighbors in adjacency.values_mut() {
            neighbors.sort();
            neighbors.dedup();
        }

        let mut visited = HashSet::new();
        let mut records = Vec::new();
        for &start in &self.node_ids {
            if !visited.contains(&start) {
                let mut on_stack = HashSet::new();
                let mut path = Vec::new();
                Self::cycle_dfs(
                    start,
                    &adjacency,
                    &mut visited,
                    &mut on_stack,
                    &mut path,
                    &mut records,
                );
            }
        }
        records
    }

    fn cycle_dfs(
        node: Uuid,
        adjacency: &HashMap<Uuid, Vec<Uuid>>,
        visited: &mut HashSet<Uuid>,
        on_stack: &mut HashSet<Uuid>,
        path: &mut Vec<Uuid>,
        records: &mut Vec<CycleRecord>,
    ) {
        visited.insert(node);
        on_stack.insert(node);
        path.push(node);

        if let Some(neighbors) = adjacency.get(&node) {
            for &neighbor in neighbors {
                if on_stack.contains(&neighbor) {
                    // Back edge: the cycle is the path suffix from the
                    // re-entered node onward.
                    let start = path.iter().position(|&n| n == neighbor).unwrap_or(0);
                    records.push(CycleRecord {
                        nodes: path[start..].to_vec(),
                        path: path.clone(),
                        severity: CycleSeverity::Error,
                    });
                } else if !visited.contains(&neighbor) {
                    Self::cycle_dfs(neighbor, adjacency, visited, on_stack, path, records);
                }
            }
        }

        on_stack.remove(&node);
        path.pop();
    }

    /// Kahn linearization of the whole graph. Fails with
    /// `CircularDependency` when not every node can be ordered.
    pub fn topological_order(&self) -> Result<Vec<Uuid>, GraphValidationError> {
        let sorted = kahn_order(&self.node_ids, &self.connections);
        if sorted.len() != self.node_ids.len() {
            let ordered: HashSet<Uuid> = sorted.iter().copied().collect();
            let affected: Vec<Uuid> = self
                .node_ids
                .iter()
                .copied()
                .filter(|id| !ordered.contains(id))
                .collect();
            return Err(circular_dependency(affected.clone(), affected, &[]));
        }
        Ok(sorted)
    }

    /// Groups of nodes at equal dependency depth. Each group only depends on
    /// earlier groups, so successive groups may be dispatched in parallel.
    pub fn parallel_execution_groups(&self) -> Result<Vec<Vec<Uuid>>, GraphValidationError> {
        let node_set: HashSet<Uuid> = self.node_ids.iter().copied().collect();
        let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        let mut in_degree: HashMap<Uuid, usize> = HashMap::new();
        for &id in &self.node_ids {
            adjacency.entry(id).or_default();
            in_degree.entry(id).or_insert(0);
        }
        for edge in &self.connections {
            if !node_set.contains(&edge.source_node_id) || !node_set.contains(&edge.target_node_id)
            {
                continue;
            }
            adjacency
                .entry(edge.source_node_id)
                .or_default()
                .push(edge.target_node_id);
            *in_degree.entry(edge.target_node_id).or_insert(0) += 1;
        }

        let mut remaining: HashSet<Uuid> = node_set.clone();
        let mut groups = Vec::new();
        loop {
            let frontier: Vec<Uuid> = self
                .node_ids
                .iter()
                .copied()
                .filter(|id| remaining.contains(id) && in_degree.get(id).copied() == Some(0))
                .collect();
            if frontier.is_empty() {
                break;
            }
            for id in &frontier {
                remaining.remove(id);
                if let Some(neighbors) = adjacency.get(id) {
                    for neighbor in neighbors {
                        if let Some(degree) = in_degree.get_mut(neighbor) {
                            *degree = degree.saturating_sub(1);
                        }
                    }
                }
            }
            groups.push(frontier);
        }

        if !remaining.is_empty() {
            let affected: Vec<Uuid> = self
                .node_ids
                .iter()
                .copied()
                .filter(|id| remaining.contains(id))
                .collect();
            return Err(circular_dependency(affected.clone(), affected, &[]));
        }
        Ok(groups)
    }

    /// Composite pre-execution check.
    ///
    /// Order is part of the contract: empty graph, then self-edges, then
    /// cycles, then dangling connection endpoints.
    pub fn validate_execution_safety(
        &self,
        execution_path: &[Uuid],
    ) -> Result<(), GraphValidationError> {
        if self.node_ids.is_empty() {
            return Err(GraphValidationError::InvalidFlowState(
                ValidationDetail::new(
                    Vec::new(),
                    "the graph has no nodes; add at least one node before executing",
                )
                .with_path(execution_path.to_vec()),
            ));
        }

        for edge in &self.connections {
            if edge.source_node_id == edge.target_node_id {
                return Err(circular_dependency(
                    vec![edge.source_node_id],
                    vec![edge.source_node_id, edge.source_node_id],
                    execution_path,
                ));
            }
        }

        let cycles = self.detect_cycles();
        if let Some(cycle) = cycles.first() {
            return Err(circular_dependency(
                cycle.nodes.clone(),
                cycle.path.clone(),
                execution_path,
            ));
        }

        let node_set: HashSet<Uuid> = self.node_ids.iter().copied().collect();
        let mut missing = Vec::new();
        for edge in &self.connections {
            if !node_set.contains(&edge.source_node_id) {
                missing.push(edge.source_node_id);
            }
            if !node_set.contains(&edge.target_node_id) {
                missing.push(edge.target_node_id);
            }
        }
        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(GraphValidationError::MissingDependency(
                ValidationDetail::new(
                    missing.clone(),
                    "every connection endpoint must reference a node in the graph",
                )
                .with_chain(missing)
                .with_path(execution_path.to_vec()),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
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

    fn resolver(nodes: &[Uuid], edges: Vec<Connection>) -> DependencyResolver {
        DependencyResolver::new(nodes.to_vec(), edges)
    }

    #[test]
    fn direct_dependencies_and_dependents_are_unique() {
        let (a, b, c) = (id(1), id(2), id(3));
        // Two parallel edges a -> c plus b -> c.
        let r = resolver(&[a, b, c], vec![edge(a, c), edge(a, c), edge(b, c)]);

        assert_eq!(r.dependencies(c), vec![a, b]);
        assert_eq!(r.downstream(a), vec![c]);
        assert!(r.dependencies(a).is_empty());
    }

    #[test]
    fn transitive_traversal_excludes_start_and_survives_cycles() {
        let (a, b, c) = (id(1), id(2), id(3));
        let r = resolver(&[a, b, c], vec![edge(a, b), edge(b, c), edge(c, a)]);

        let downstream = r.transitive_downstream(a);
        assert_eq!(downstream, [b, c].into_iter().collect());

        let dependencies = r.transitive_dependencies(a);
        assert_eq!(dependencies, [b, c].into_iter().collect());
    }

    #[test]
    fn detects_cycle_in_each_component() {
        let (a, b, c, d, e) = (id(1), id(2), id(3), id(4), id(5));
        // Component 1: a -> b -> a. Component 2: c -> d -> e -> c.
        let r = resolver(
            &[a, b, c, d, e],
            vec![edge(a, b), edge(b, a), edge(c, d), edge(d, e), edge(e, c)],
        );

        let cycles = r.detect_cycles();
        assert_eq!(cycles.len(), 2);

        let sets: BTreeSet<BTreeSet<Uuid>> = cycles
            .iter()
            .map(|c| c.nodes.iter().copied().collect())
            .collect();
        assert!(sets.contains(&[a, b].into_iter().collect()));
        assert!(sets.contains(&[c, d, e].into_iter().collect()));
    }

    #[test]
    fn acyclic_graph_has_no_cycles() {
        let (a, b, c, d) = (id(1), id(2), id(3), id(4));
        let r = resolver(&[a, b, c, d], vec![edge(a, b), edge(a, c), edge(b, d), edge(c, d)]);
        assert!(r.detect_cycles().is_empty());
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let (a, b, c, d) = (id(1), id(2), id(3), id(4));
        let r = resolver(&[d, c, b, a], vec![edge(a, b), edge(b, c), edge(c, d)]);

        let order = r.topological_order().unwrap();
        assert_eq!(order, vec![a, b, c, d]);
    }

    #[test]
    fn topological_order_fails_on_cycle() {
        let (a, b) = (id(1), id(2));
        let r = resolver(&[a, b], vec![edge(a, b), edge(b, a)]);

        let err = r.topological_order().unwrap_err();
        match err {
            GraphValidationError::CircularDependency(detail) => {
                let affected: BTreeSet<Uuid> = detail.affected_nodes.into_iter().collect();
                assert_eq!(affected, [a, b].into_iter().collect());
            }
            other => panic!("expected CircularDependency, got {other:?}"),
        }
    }

    #[test]
    fn parallel_groups_follow_frontier_depth() {
        let (a, b, c, d) = (id(1), id(2), id(3), id(4));
        // Diamond: a -> {b, c} -> d.
        let r = resolver(&[a, b, c, d], vec![edge(a, b), edge(a, c), edge(b, d), edge(c, d)]);

        let groups = r.parallel_execution_groups().unwrap();
        assert_eq!(groups, vec![vec![a], vec![b, c], vec![d]]);
    }

    #[test]
    fn validate_rejects_empty_graph_first() {
        let r = resolver(&[], vec![]);
        assert!(matches!(
            r.validate_execution_safety(&[]),
            Err(GraphValidationError::InvalidFlowState(_))
        ));
    }

    #[test]
    fn validate_rejects_self_edge_as_circular() {
        let a = id(1);
        let r = resolver(&[a], vec![edge(a, a)]);
        match r.validate_execution_safety(&[a]) {
            Err(GraphValidationError::CircularDependency(detail)) => {
                assert_eq!(detail.affected_nodes, vec![a]);
                assert_eq!(detail.execution_path, vec![a]);
            }
            other => panic!("expected CircularDependency, got {other:?}"),
        }
    }

    #[test]
    fn validate_checks_cycles_before_missing_dependencies() {
        let (a, b, ghost) = (id(1), id(2), id(99));
        // Both defects present; the cycle must win.
        let r = resolver(&[a, b], vec![edge(a, b), edge(b, a), edge(a, ghost)]);
        assert!(matches!(
            r.validate_execution_safety(&[]),
            Err(GraphValidationError::CircularDependency(_))
        ));
    }

    #[test]
    fn validate_reports_dangling_endpoints() {
        let (a, ghost) = (id(1), id(99));
        let r = resolver(&[a], vec![edge(a, ghost)]);
        match r.validate_execution_safety(&[]) {
            Err(GraphValidationError::MissingDependency(detail)) => {
                assert_eq!(detail.affected_nodes, vec![ghost]);
            }
            other => panic!("expected MissingDependency, got {other:?}"),
        }
    }

    #[test]
    fn validate_accepts_well_formed_graph() {
        let (a, b) = (id(1), id(2));
        let r = resolver(&[a, b], vec![edge(a, b)]);
        assert!(r.validate_execution_safety(&[a, b]).is_ok());
    }

    fn fixed_edges() -> Vec<Connection> {
        let (a, b, c, d, e, f) = (id(1), id(2), id(3), id(4), id(5), id(6));
        vec![
            edge(a, b),
            edge(b, c),
            edge(c, a),
            edge(c, d),
            edge(d, e),
            edge(e, f),
            edge(f, d),
        ]
    }

    fn cycle_node_sets(edges: Vec<Connection>) -> BTreeSet<BTreeSet<Uuid>> {
        let nodes: Vec<Uuid> = (1..=6).map(id).collect();
        DependencyResolver::new(nodes, edges)
            .detect_cycles()
            .iter()
            .map(|c| c.nodes.iter().copied().collect())
            .collect()
    }

    proptest! {
        #[test]
        fn cycle_detection_is_permutation_invariant(
            shuffled in Just(fixed_edges()).prop_shuffle()
        ) {
            let baseline = cycle_node_sets(fixed_edges());
            let found = cycle_node_sets(shuffled);
            prop_assert_eq!(found, baseline);
        }
    }
}

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Per-execution locks over affected node sets.
///
/// Every admitted execution registers its node set; isolated executions are
/// refused admission while any registered set intersects theirs. Mutations
/// happen under the trigger manager's coordinator lock.
#[derive(Debug, Default)]
pub struct ResourceManager {
    held: HashMap<Uuid, HashSet<Uuid>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any held lock set intersects `nodes`.
    pub fn conflicts(&self, nodes: &HashSet<Uuid>) -> bool {
        self.held
            .values()
            .any(|held| !held.is_disjoint(nodes))
    }

    pub fn acquire(&mut self, execution_id: Uuid, nodes: HashSet<Uuid>) {
        self.held.insert(execution_id, nodes);
    }

    pub fn release(&mut self, execution_id: Uuid) -> bool {
        self.held.remove(&execution_id).is_some()
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

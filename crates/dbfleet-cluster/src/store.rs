//! Thread-safe in-memory map of placements and node capacities.

use crate::placement::{NodeCapacity, Placement};
use parking_lot::RwLock;
use std::collections::HashMap;

/// The authoritative local view of `Database -> Placement` and
/// `Node -> Capacity`.
///
/// `get`/`list` return owned clones so a caller can never mutate the
/// store's internal state through a borrowed reference; updates always
/// go back through `upsert`/`set_node`.
#[derive(Default)]
pub struct MetadataStore {
    placements: RwLock<HashMap<String, Placement>>,
    nodes: RwLock<HashMap<String, NodeCapacity>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Placement> {
        self.placements.read().get(name).cloned()
    }

    /// Unconditional replacement. Callers are responsible for consulting
    /// `consensus::resolve_conflict` first when the update may race with
    /// a concurrent remote view.
    pub fn upsert(&self, placement: Placement) {
        self.placements
            .write()
            .insert(placement.name.clone(), placement);
    }

    pub fn delete(&self, name: &str) -> Option<Placement> {
        self.placements.write().remove(name)
    }

    pub fn list(&self) -> Vec<Placement> {
        self.placements.read().values().cloned().collect()
    }

    pub fn get_node(&self, node_id: &str) -> Option<NodeCapacity> {
        self.nodes.read().get(node_id).cloned()
    }

    pub fn set_node(&self, capacity: NodeCapacity) {
        self.nodes.write().insert(capacity.node_id.clone(), capacity);
    }

    pub fn all_nodes(&self) -> Vec<NodeCapacity> {
        self.nodes.read().values().cloned().collect()
    }

    /// Nodes that are healthy and have spare capacity.
    pub fn healthy_nodes(&self) -> Vec<NodeCapacity> {
        self.nodes
            .read()
            .values()
            .filter(|c| c.has_capacity())
            .cloned()
            .collect()
    }
}

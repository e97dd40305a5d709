//! In-memory mirror of node state.
//!
//! Updated only from lifecycle notifications and from the scheduler's own
//! committed reservations. `deep_copy` hands the scheduling pass a private
//! view so a concurrent notification cannot change nodes under it.

use hangar_core::{Node, Resource, ResourceId};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct NodeCache {
    nodes: RwLock<HashMap<ResourceId, Node>>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node.
    pub fn add_node(&self, node: Node) {
        self.nodes.write().insert(node.id, node);
    }

    /// Replace a known node. Unknown nodes are ignored, since the cache is
    /// not the authority on which nodes exist. Returns whether it applied.
    pub fn put_node(&self, node: Node) -> bool {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(&node.id) {
            Some(existing) => {
                *existing = node;
                true
            }
            None => false,
        }
    }

    /// Copy committed allocations onto a known node, leaving every other
    /// field as the latest notification left it.
    pub fn apply_reservation(&self, id: ResourceId, cpu: &Resource, ram: &Resource) -> bool {
        match self.nodes.write().get_mut(&id) {
            Some(node) => {
                node.cpu.allocated = cpu.allocated;
                node.ram.allocated = ram.allocated;
                true
            }
            None => false,
        }
    }

    pub fn del_node(&self, id: ResourceId) -> Option<Node> {
        self.nodes.write().remove(&id)
    }

    pub fn get_node(&self, id: ResourceId) -> Option<Node> {
        self.nodes.read().get(&id).cloned()
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.nodes.read().contains_key(&id)
    }

    /// All nodes, ordered by id.
    pub fn get_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.read().values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// An independent copy, taken under the read lock.
    pub fn deep_copy(&self) -> NodeCache {
        NodeCache {
            nodes: RwLock::new(self.nodes.read().clone()),
        }
    }
}

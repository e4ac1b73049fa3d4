use std::collections::BTreeMap;

use crate::cluster::{Node, NodeId, NodeUpdate};

/// Membership map owned by the cluster view loop.
///
/// Both mutation paths return the effective delta, ordered removals first
/// then additions, each lexicographically by node id.
#[derive(Debug, Default)]
pub struct ClusterState {
    nodes: BTreeMap<NodeId, Node>,
}

impl ClusterState {
    pub fn new(initial: Vec<Node>) -> Self {
        Self {
            nodes: initial.into_iter().map(|n| (n.id.clone(), n)).collect(),
        }
    }

    /// Replace the membership with a full snapshot and return the diff.
    pub fn set_and_diff(&mut self, nodes: Vec<Node>) -> Vec<NodeUpdate> {
        let next: BTreeMap<NodeId, Node> =
            nodes.into_iter().map(|n| (n.id.clone(), n)).collect();

        let mut updates: Vec<NodeUpdate> = self
            .nodes
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .map(NodeUpdate::Removed)
            .collect();
        updates.extend(
            next.values()
                .filter(|n| !self.nodes.contains_key(&n.id))
                .cloned()
                .map(NodeUpdate::Added),
        );

        self.nodes = next;
        updates
    }

    /// Apply incremental updates, dropping the ones that change nothing
    /// (Added for a present node, Removed for an absent one).
    pub fn apply_updates(&mut self, updates: Vec<NodeUpdate>) -> Vec<NodeUpdate> {
        let mut removed = Vec::new();
        let mut added = Vec::new();
        for update in updates {
            match update {
                NodeUpdate::Added(node) => {
                    if !self.nodes.contains_key(&node.id) {
                        self.nodes.insert(node.id.clone(), node.clone());
                        added.push(node);
                    }
                }
                NodeUpdate::Removed(id) => {
                    if self.nodes.remove(&id).is_some() {
                        removed.push(id);
                    }
                }
            }
        }
        removed.sort();
        added.sort_by(|a, b| a.id.cmp(&b.id));

        let mut updates: Vec<NodeUpdate> =
            removed.into_iter().map(NodeUpdate::Removed).collect();
        updates.extend(added.into_iter().map(NodeUpdate::Added));
        updates
    }

    /// Current members in lexicographic id order.
    pub fn members(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

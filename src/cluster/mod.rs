pub mod state;
pub mod view;

pub use state::ClusterState;
pub use view::{ClusterIngest, ClusterView, Subscription};

use serde::{Deserialize, Serialize};

/// Cluster-level identity of a worker. Ordering is lexicographic so
/// iteration is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A member of the worker fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Address or metadata the worker connector uses to reach the runner.
    pub addr: String,
}

impl Node {
    pub fn new(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(id),
            addr: addr.into(),
        }
    }
}

/// A single membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeUpdate {
    Added(Node),
    Removed(NodeId),
}

impl NodeUpdate {
    pub fn node_id(&self) -> &NodeId {
        match self {
            NodeUpdate::Added(node) => &node.id,
            NodeUpdate::Removed(id) => id,
        }
    }
}

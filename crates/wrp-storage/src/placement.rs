//! Node placement for newly created pools.
//!
//! Policies are pure functions of the supplied cluster state (plus, for
//! round-robin, how many placements were made before), so the same state
//! always yields the same node.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Storage node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Load of one node as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLoad {
    /// Node identifier
    pub node: NodeId,
    /// Pools currently placed on the node
    pub pools: usize,
    /// Stored bytes across those pools
    pub stored_bytes: u64,
}

/// Chooses the node for a new pool.
pub trait PlacementPolicy: Send + Sync {
    /// Policy name for logs.
    fn name(&self) -> &'static str;

    /// Picks a node among `nodes`, or None if the list is empty.
    fn place(&self, nodes: &[NodeLoad]) -> Option<NodeId>;
}

/// Cycles through nodes in id order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl PlacementPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn place(&self, nodes: &[NodeLoad]) -> Option<NodeId> {
        if nodes.is_empty() {
            return None;
        }
        let mut ids: Vec<NodeId> = nodes.iter().map(|n| n.node).collect();
        ids.sort();
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % ids.len();
        Some(ids[i])
    }
}

/// Node with the fewest stored bytes, then fewest pools, then lowest id.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoaded;

impl PlacementPolicy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least_loaded"
    }

    fn place(&self, nodes: &[NodeLoad]) -> Option<NodeId> {
        nodes
            .iter()
            .min_by_key(|n| (n.stored_bytes, n.pools, n.node))
            .map(|n| n.node)
    }
}

/// Always the local node when it is a member, else least loaded.
#[derive(Debug, Clone, Copy)]
pub struct LocalFirst {
    /// The node this process runs on
    pub local: NodeId,
}

impl PlacementPolicy for LocalFirst {
    fn name(&self) -> &'static str {
        "local_first"
    }

    fn place(&self, nodes: &[NodeLoad]) -> Option<NodeId> {
        if nodes.iter().any(|n| n.node == self.local) {
            Some(self.local)
        } else {
            LeastLoaded.place(nodes)
        }
    }
}

/// Configured placement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlacementKind {
    /// [`RoundRobin`]
    RoundRobin,
    /// [`LeastLoaded`]
    #[default]
    LeastLoaded,
    /// [`LocalFirst`]
    LocalFirst,
}

impl PlacementKind {
    /// Instantiates the policy.
    pub fn build(self, local: NodeId) -> Box<dyn PlacementPolicy> {
        match self {
            PlacementKind::RoundRobin => Box::new(RoundRobin::default()),
            PlacementKind::LeastLoaded => Box::new(LeastLoaded),
            PlacementKind::LocalFirst => Box::new(LocalFirst { local }),
        }
    }
}

//! Serialized cluster state

use chrono::{DateTime, Utc};
use crane_core::{Cargo, Lease, MiniCluster, Node};
use serde::{Deserialize, Serialize};

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to rebuild the control plane after a restart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub version: u32,
    pub taken_at: DateTime<Utc>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub leases: Vec<Lease>,
    #[serde(default)]
    pub mini_clusters: Vec<MiniCluster>,
    #[serde(default)]
    pub cargoes: Vec<Cargo>,
}

impl ClusterSnapshot {
    pub fn new(
        nodes: Vec<Node>,
        leases: Vec<Lease>,
        mini_clusters: Vec<MiniCluster>,
        cargoes: Vec<Cargo>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            taken_at: Utc::now(),
            nodes,
            leases,
            mini_clusters,
            cargoes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.leases.is_empty()
            && self.mini_clusters.is_empty()
            && self.cargoes.is_empty()
    }
}

impl Default for ClusterSnapshot {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new(), Vec::new(), Vec::new())
    }
}

//! Node identity, health and registration types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::{LeaseId, ResourceVector};

/// Node identifier. Ordered, so placement ties break deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Node health as reported by the health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    /// Node responds and accepts new leases
    Healthy,
    /// Node missed recent probes; no new leases are placed on it
    Suspect,
    /// Node is gone; its leases are reclaimed after a grace period
    Unreachable,
}

impl fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeHealth::Healthy => write!(f, "Healthy"),
            NodeHealth::Suspect => write!(f, "Suspect"),
            NodeHealth::Unreachable => write!(f, "Unreachable"),
        }
    }
}

/// Registration request for a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node identifier
    pub id: NodeId,
    /// Total capacity
    pub capacity: ResourceVector,
    /// GPU model installed on the node
    #[serde(default)]
    pub gpu_type: Option<String>,
    /// Base URL of the node agent, probed for health
    #[serde(default)]
    pub address: Option<String>,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, capacity: ResourceVector) -> Self {
        Self {
            id: id.into(),
            capacity,
            gpu_type: None,
            address: None,
        }
    }

    pub fn with_gpu_type(mut self, gpu_type: impl Into<String>) -> Self {
        self.gpu_type = Some(gpu_type.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

/// A registered compute node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub capacity: ResourceVector,
    pub gpu_type: Option<String>,
    pub address: Option<String>,
    pub health: NodeHealth,
    /// Leases currently holding capacity on this node
    pub active_leases: BTreeSet<LeaseId>,
    pub registered_at: DateTime<Utc>,
    /// When `health` last changed
    pub health_changed_at: DateTime<Utc>,
}

impl Node {
    pub fn new(spec: NodeSpec) -> Self {
        let now = Utc::now();
        Self {
            id: spec.id,
            capacity: spec.capacity,
            gpu_type: spec.gpu_type,
            address: spec.address,
            health: NodeHealth::Healthy,
            active_leases: BTreeSet::new(),
            registered_at: now,
            health_changed_at: now,
        }
    }

    /// New leases are only placed on healthy nodes
    pub fn is_schedulable(&self) -> bool {
        self.health == NodeHealth::Healthy
    }

    /// A claim without a GPU type matches any node
    pub fn supports_gpu_type(&self, wanted: Option<&str>) -> bool {
        match wanted {
            None => true,
            Some(t) => self.gpu_type.as_deref() == Some(t),
        }
    }
}

/// Inventory view of a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    pub node: Node,
    /// Sum of capacity held by pending and active leases
    pub committed: ResourceVector,
    /// `capacity - committed`
    pub available: ResourceVector,
}

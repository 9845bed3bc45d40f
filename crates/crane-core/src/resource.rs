//! Resource vectors, claims and placement constraints

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::Add;

use crate::{CraneError, CraneResult, NodeId};

/// Capacity along every schedulable dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ResourceVector {
    /// Number of GPUs
    #[serde(default)]
    pub gpu: u32,
    /// CPU cores
    #[serde(default)]
    pub cpu: u32,
    /// Memory in bytes
    #[serde(default)]
    pub memory: u64,
}

impl ResourceVector {
    /// The empty vector
    pub const ZERO: ResourceVector = ResourceVector {
        gpu: 0,
        cpu: 0,
        memory: 0,
    };

    pub fn new(gpu: u32, cpu: u32, memory: u64) -> Self {
        Self { gpu, cpu, memory }
    }

    /// A vector holding only GPUs
    pub fn gpus(gpu: u32) -> Self {
        Self {
            gpu,
            ..Self::ZERO
        }
    }

    pub fn is_empty(&self) -> bool {
        self.gpu == 0 && self.cpu == 0 && self.memory == 0
    }

    /// True when every dimension of `self` is at most the same dimension of `other`
    pub fn fits_within(&self, other: &ResourceVector) -> bool {
        self.gpu <= other.gpu && self.cpu <= other.cpu && self.memory <= other.memory
    }

    pub fn checked_add(&self, other: &ResourceVector) -> Option<ResourceVector> {
        Some(ResourceVector {
            gpu: self.gpu.checked_add(other.gpu)?,
            cpu: self.cpu.checked_add(other.cpu)?,
            memory: self.memory.checked_add(other.memory)?,
        })
    }

    pub fn checked_sub(&self, other: &ResourceVector) -> Option<ResourceVector> {
        Some(ResourceVector {
            gpu: self.gpu.checked_sub(other.gpu)?,
            cpu: self.cpu.checked_sub(other.cpu)?,
            memory: self.memory.checked_sub(other.memory)?,
        })
    }

    pub fn saturating_sub(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            gpu: self.gpu.saturating_sub(other.gpu),
            cpu: self.cpu.saturating_sub(other.cpu),
            memory: self.memory.saturating_sub(other.memory),
        }
    }

    /// Per-dimension minimum
    pub fn min(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            gpu: self.gpu.min(other.gpu),
            cpu: self.cpu.min(other.cpu),
            memory: self.memory.min(other.memory),
        }
    }

    pub fn checked_mul(&self, factor: u32) -> Option<ResourceVector> {
        Some(ResourceVector {
            gpu: self.gpu.checked_mul(factor)?,
            cpu: self.cpu.checked_mul(factor)?,
            memory: self.memory.checked_mul(u64::from(factor))?,
        })
    }

    /// Ordering key used by best-fit placement. GPUs are the scarce
    /// dimension, so they dominate the comparison.
    pub fn fit_key(&self) -> (u32, u32, u64) {
        (self.gpu, self.cpu, self.memory)
    }
}

impl Add for ResourceVector {
    type Output = ResourceVector;

    fn add(self, rhs: ResourceVector) -> ResourceVector {
        ResourceVector {
            gpu: self.gpu.saturating_add(rhs.gpu),
            cpu: self.cpu.saturating_add(rhs.cpu),
            memory: self.memory.saturating_add(rhs.memory),
        }
    }
}

impl Sum for ResourceVector {
    fn sum<I: Iterator<Item = ResourceVector>>(iter: I) -> Self {
        iter.fold(ResourceVector::ZERO, |acc, v| acc + v)
    }
}

impl<'a> Sum<&'a ResourceVector> for ResourceVector {
    fn sum<I: Iterator<Item = &'a ResourceVector>>(iter: I) -> Self {
        iter.fold(ResourceVector::ZERO, |acc, v| acc + *v)
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} GPU, {} CPU, {} MiB",
            self.gpu,
            self.cpu,
            self.memory / (1024 * 1024)
        )
    }
}

/// Placement constraints attached to a claim
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlacementConstraints {
    /// Only these nodes may be used (empty means any node)
    #[serde(default)]
    pub allowed_nodes: Vec<NodeId>,
    /// These nodes must not be used
    #[serde(default)]
    pub excluded_nodes: Vec<NodeId>,
    /// At most one unit of the same mini-cluster per node
    #[serde(default)]
    pub anti_affinity: bool,
    /// All units of the same mini-cluster on one node
    #[serde(default)]
    pub co_locate: bool,
}

impl PlacementConstraints {
    /// Whether the static allow/deny lists admit a node
    pub fn admits(&self, node: &NodeId) -> bool {
        if self.excluded_nodes.contains(node) {
            return false;
        }
        self.allowed_nodes.is_empty() || self.allowed_nodes.contains(node)
    }
}

fn default_span() -> u32 {
    1
}

/// A request for capacity, consumed by a single placement decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceClaim {
    /// Capacity needed on every node the claim spans
    pub resources: ResourceVector,
    /// Required GPU model, if any
    #[serde(default)]
    pub gpu_type: Option<String>,
    /// Number of distinct nodes the claim spans
    #[serde(default = "default_span")]
    pub nodes: u32,
    /// Placement constraints
    #[serde(default)]
    pub constraints: PlacementConstraints,
}

impl ResourceClaim {
    /// Create a single-node claim with no constraints
    pub fn new(resources: ResourceVector) -> Self {
        Self {
            resources,
            gpu_type: None,
            nodes: 1,
            constraints: PlacementConstraints::default(),
        }
    }

    pub fn with_gpu_type(mut self, gpu_type: impl Into<String>) -> Self {
        self.gpu_type = Some(gpu_type.into());
        self
    }

    pub fn spanning(mut self, nodes: u32) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_constraints(mut self, constraints: PlacementConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Total capacity the claim commits across all spanned nodes
    pub fn total(&self) -> ResourceVector {
        self.resources
            .checked_mul(self.nodes)
            .unwrap_or(ResourceVector {
                gpu: u32::MAX,
                cpu: u32::MAX,
                memory: u64::MAX,
            })
    }

    /// Reject claims that can never be placed
    pub fn validate(&self) -> CraneResult<()> {
        if self.resources.is_empty() {
            return Err(CraneError::InvalidRequest(
                "claim must request at least one resource".to_string(),
            ));
        }
        if self.nodes == 0 {
            return Err(CraneError::InvalidRequest(
                "claim must span at least one node".to_string(),
            ));
        }
        if self.constraints.co_locate && self.nodes > 1 {
            return Err(CraneError::InvalidRequest(
                "a co-located claim cannot span multiple nodes".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fits_within_is_per_dimension() {
        let node = ResourceVector::new(2, 8, 1024);
        assert!(ResourceVector::new(2, 8, 1024).fits_within(&node));
        assert!(ResourceVector::gpus(1).fits_within(&node));
        assert!(!ResourceVector::new(1, 9, 0).fits_within(&node));
        assert!(!ResourceVector::new(0, 0, 2048).fits_within(&node));
    }

    #[test]
    fn test_checked_sub_underflow() {
        let a = ResourceVector::new(1, 4, 100);
        let b = ResourceVector::new(2, 0, 0);
        assert!(a.checked_sub(&b).is_none());
        assert_eq!(a.saturating_sub(&b), ResourceVector::new(0, 4, 100));
    }

    #[test]
    fn test_sum_and_min() {
        let total: ResourceVector = vec![ResourceVector::gpus(1), ResourceVector::new(1, 2, 3)]
            .into_iter()
            .sum();
        assert_eq!(total, ResourceVector::new(2, 2, 3));
        assert_eq!(
            total.min(&ResourceVector::new(5, 1, 9)),
            ResourceVector::new(2, 1, 3)
        );
    }

    #[test]
    fn test_claim_validation() {
        assert!(ResourceClaim::new(ResourceVector::ZERO).validate().is_err());
        assert!(ResourceClaim::new(ResourceVector::gpus(1))
            .spanning(0)
            .validate()
            .is_err());
        assert!(ResourceClaim::new(ResourceVector::gpus(1)).validate().is_ok());
    }

    #[test]
    fn test_claim_total_spans_nodes() {
        let claim = ResourceClaim::new(ResourceVector::new(2, 4, 10)).spanning(3);
        assert_eq!(claim.total(), ResourceVector::new(6, 12, 30));
    }

    #[test]
    fn test_constraints_admit() {
        let constraints = PlacementConstraints {
            allowed_nodes: vec![NodeId::from("n1"), NodeId::from("n2")],
            excluded_nodes: vec![NodeId::from("n2")],
            ..Default::default()
        };
        assert!(constraints.admits(&NodeId::from("n1")));
        assert!(!constraints.admits(&NodeId::from("n2")));
        assert!(!constraints.admits(&NodeId::from("n3")));
    }

    #[test]
    fn test_claim_deserialize_defaults() {
        let claim: ResourceClaim =
            serde_json::from_str(r#"{"resources": {"gpu": 1}}"#).unwrap();
        assert_eq!(claim.nodes, 1);
        assert_eq!(claim.resources, ResourceVector::gpus(1));
        assert!(claim.gpu_type.is_none());
    }
}

//! Mini-cluster reservation types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{CraneError, CraneResult, ExpiryPolicy, Lease, LeaseId, Lifecycle, ResourceClaim, ResourceVector, StateHistory, TenantId};

/// Mini-cluster identifier
pub type MiniClusterId = Uuid;

/// Mini-cluster lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MiniClusterState {
    /// All-or-nothing creation window
    Reserving,
    /// Holding its leases and accepting cargo
    Active,
    /// Adding or removing leases
    Resizing,
    /// Tearing down cargo and leases
    Releasing,
    /// All leases returned
    Released,
}

impl Lifecycle for MiniClusterState {
    fn can_transition_to(self, next: Self) -> bool {
        use MiniClusterState::*;
        matches!(
            (self, next),
            (Reserving, Active)
                | (Reserving, Released)
                | (Active, Resizing)
                | (Active, Releasing)
                | (Resizing, Active)
                | (Resizing, Releasing)
                | (Releasing, Released)
        )
    }

    fn is_terminal(self) -> bool {
        self == MiniClusterState::Released
    }
}

impl fmt::Display for MiniClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiniClusterState::Reserving => write!(f, "Reserving"),
            MiniClusterState::Active => write!(f, "Active"),
            MiniClusterState::Resizing => write!(f, "Resizing"),
            MiniClusterState::Releasing => write!(f, "Releasing"),
            MiniClusterState::Released => write!(f, "Released"),
        }
    }
}

/// Request to reserve a mini-cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiniClusterRequest {
    /// Human-readable name (generated when omitted)
    #[serde(default)]
    pub name: Option<String>,
    /// Number of units (one lease each)
    pub target_size: u32,
    /// Claim for every unit, including placement constraints
    pub per_unit_claim: ResourceClaim,
    /// Expiry applied to every member lease
    #[serde(default)]
    pub expiry: ExpiryPolicy,
    /// Fewest units the mini-cluster may hold (reserve settles for this
    /// many; shrinking below it is refused). Defaults to `target_size` at
    /// reserve time and 1 afterwards.
    #[serde(default)]
    pub min_size: Option<u32>,
    /// Most units a resize may ask for
    #[serde(default)]
    pub max_size: Option<u32>,
}

impl MiniClusterRequest {
    pub fn new(target_size: u32, per_unit_claim: ResourceClaim) -> Self {
        Self {
            name: None,
            target_size,
            per_unit_claim,
            expiry: ExpiryPolicy::None,
            min_size: None,
            max_size: None,
        }
    }

    pub fn with_bounds(mut self, min_size: Option<u32>, max_size: Option<u32>) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    /// Check sizes and the per-unit claim
    pub fn validate(&self) -> CraneResult<()> {
        if self.target_size == 0 {
            return Err(CraneError::InvalidRequest(
                "target size must be at least 1".to_string(),
            ));
        }
        let min = self.min_size.unwrap_or(self.target_size);
        if min == 0 || min > self.target_size {
            return Err(CraneError::InvalidRequest(format!(
                "minimum size {} must be between 1 and the target size {}",
                min, self.target_size
            )));
        }
        if let Some(max) = self.max_size {
            if max < self.target_size {
                return Err(CraneError::InvalidRequest(format!(
                    "maximum size {} is below the target size {}",
                    max, self.target_size
                )));
            }
        }
        self.per_unit_claim.validate()
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_expiry(mut self, expiry: ExpiryPolicy) -> Self {
        self.expiry = expiry;
        self
    }
}

/// A tenant-owned set of leases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiniCluster {
    pub id: MiniClusterId,
    pub name: String,
    pub owner: TenantId,
    pub target_size: u32,
    pub per_unit_claim: ResourceClaim,
    pub expiry: ExpiryPolicy,
    #[serde(default)]
    pub min_size: Option<u32>,
    #[serde(default)]
    pub max_size: Option<u32>,
    /// Member leases in grant order
    pub lease_ids: Vec<LeaseId>,
    pub history: StateHistory<MiniClusterState>,
}

impl MiniCluster {
    pub fn new(owner: TenantId, request: MiniClusterRequest) -> Self {
        let id = Uuid::new_v4();
        let name = request
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("mc-{}", &id.simple().to_string()[..8]));
        Self {
            id,
            name,
            owner,
            target_size: request.target_size,
            per_unit_claim: request.per_unit_claim,
            expiry: request.expiry,
            min_size: request.min_size,
            max_size: request.max_size,
            lease_ids: Vec::new(),
            history: StateHistory::new(MiniClusterState::Reserving),
        }
    }

    pub fn state(&self) -> MiniClusterState {
        self.history.current()
    }

    pub fn current_size(&self) -> u32 {
        self.lease_ids.len() as u32
    }

    pub fn is_active(&self) -> bool {
        self.state() == MiniClusterState::Active
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.history.created_at()
    }

    /// Units a reservation must obtain to succeed
    pub fn required_size(&self) -> u32 {
        self.min_size.unwrap_or(self.target_size)
    }

    /// Reject resize targets outside the size bounds
    pub fn check_resize(&self, target: u32) -> CraneResult<()> {
        if target == 0 {
            return Err(CraneError::InvalidRequest(
                "target size must be at least 1, release the mini-cluster instead".to_string(),
            ));
        }
        if let Some(min) = self.min_size.filter(|min| target < *min) {
            return Err(CraneError::InvalidRequest(format!(
                "target size {} is below the minimum {}",
                target, min
            )));
        }
        if let Some(max) = self.max_size.filter(|max| target > *max) {
            return Err(CraneError::InvalidRequest(format!(
                "target size {} is above the maximum {}",
                target, max
            )));
        }
        Ok(())
    }
}

/// Result of a resize. A shortfall on growth is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeOutcome {
    /// Size asked for
    pub requested: u32,
    /// Size reached
    pub actual: u32,
    /// `actual < requested`
    pub partial: bool,
}

impl ResizeOutcome {
    pub fn new(requested: u32, actual: u32) -> Self {
        Self {
            requested,
            actual,
            partial: actual < requested,
        }
    }
}

/// Status snapshot of a mini-cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiniClusterStatus {
    pub mini_cluster: MiniCluster,
    /// Member leases
    pub leases: Vec<Lease>,
    /// Total capacity held by usable member leases
    pub leased: ResourceVector,
    /// Capacity sub-claimed by live cargo
    pub in_use: ResourceVector,
    /// Number of cargo records under this mini-cluster
    pub cargo_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mini_cluster_transitions() {
        use MiniClusterState::*;
        assert!(Reserving.can_transition_to(Active));
        assert!(Reserving.can_transition_to(Released));
        assert!(Active.can_transition_to(Resizing));
        assert!(Resizing.can_transition_to(Active));
        assert!(Releasing.can_transition_to(Released));
        assert!(!Released.can_transition_to(Active));
        assert!(!Active.can_transition_to(Released));
        assert!(Released.is_terminal());
    }

    #[test]
    fn test_mini_cluster_new_generates_name() {
        let request = MiniClusterRequest::new(2, ResourceClaim::new(ResourceVector::gpus(1)));
        let mc = MiniCluster::new(TenantId::from("t1"), request);
        assert!(mc.name.starts_with("mc-"));
        assert_eq!(mc.state(), MiniClusterState::Reserving);
        assert_eq!(mc.current_size(), 0);
        assert_eq!(mc.target_size, 2);
    }

    #[test]
    fn test_size_bounds_validation() {
        let claim = ResourceClaim::new(ResourceVector::gpus(1));
        assert!(MiniClusterRequest::new(0, claim.clone()).validate().is_err());
        assert!(MiniClusterRequest::new(3, claim.clone())
            .with_bounds(Some(4), None)
            .validate()
            .is_err());
        assert!(MiniClusterRequest::new(3, claim.clone())
            .with_bounds(None, Some(2))
            .validate()
            .is_err());

        let request = MiniClusterRequest::new(3, claim).with_bounds(Some(2), Some(5));
        request.validate().unwrap();
        let mc = MiniCluster::new(TenantId::from("t1"), request);
        assert_eq!(mc.required_size(), 2);
        assert!(mc.check_resize(1).is_err());
        assert!(mc.check_resize(6).is_err());
        assert!(mc.check_resize(0).is_err());
        mc.check_resize(5).unwrap();
        mc.check_resize(2).unwrap();
    }

    #[test]
    fn test_unbounded_mini_cluster_requires_full_target() {
        let request = MiniClusterRequest::new(4, ResourceClaim::new(ResourceVector::gpus(1)));
        let mc = MiniCluster::new(TenantId::from("t1"), request);
        assert_eq!(mc.required_size(), 4);
        mc.check_resize(1).unwrap();
        mc.check_resize(64).unwrap();
    }

    #[test]
    fn test_resize_outcome_partial() {
        assert!(ResizeOutcome::new(5, 4).partial);
        assert!(!ResizeOutcome::new(2, 2).partial);
    }
}

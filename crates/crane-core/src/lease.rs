//! Lease types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{NodeId, ResourceClaim, ResourceVector, TenantId};

/// Lease identifier
pub type LeaseId = Uuid;

/// Upper bound on a heartbeat TTL (100 years)
const MAX_TTL_SECS: i64 = 100 * 365 * 24 * 3600;

/// Lease lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    /// Capacity committed, waiting for the holder to confirm use
    Pending,
    /// Confirmed and in use
    Active,
    /// Deadline passed, inside the renewal grace window
    Expiring,
    /// Capacity returned to the pool
    Released,
}

impl LeaseState {
    /// Whether the lease counts against node capacity
    pub fn holds_capacity(self) -> bool {
        !matches!(self, LeaseState::Released)
    }

    /// Whether cargo may be placed on the lease
    pub fn is_usable(self) -> bool {
        matches!(self, LeaseState::Active | LeaseState::Expiring)
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseState::Pending => write!(f, "Pending"),
            LeaseState::Active => write!(f, "Active"),
            LeaseState::Expiring => write!(f, "Expiring"),
            LeaseState::Released => write!(f, "Released"),
        }
    }
}

/// How a lease ends on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// Held until released
    #[default]
    None,
    /// Held until a fixed point in time
    Deadline { at: DateTime<Utc> },
    /// Held while renewed at least every `ttl_secs`
    Heartbeat { ttl_secs: u64 },
}

impl ExpiryPolicy {
    /// Deadline for a lease activated or renewed at `now`
    pub fn deadline_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ExpiryPolicy::None => None,
            ExpiryPolicy::Deadline { at } => Some(*at),
            ExpiryPolicy::Heartbeat { ttl_secs } => {
                let secs = i64::try_from(*ttl_secs)
                    .unwrap_or(MAX_TTL_SECS)
                    .min(MAX_TTL_SECS);
                now.checked_add_signed(Duration::seconds(secs))
            }
        }
    }
}

/// Why a lease was released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// Holder asked for it
    Requested,
    /// Deadline and grace window passed without renewal
    Expired,
    /// Never confirmed by the holder
    PendingTimeout,
    /// Hosting node unreachable past its grace period
    NodeUnreachable,
    /// Part of an all-or-nothing reservation that failed
    Rollback,
    /// Could not be restored after a restart
    Recovery,
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReleaseReason::Requested => "requested",
            ReleaseReason::Expired => "expired",
            ReleaseReason::PendingTimeout => "pending_timeout",
            ReleaseReason::NodeUnreachable => "node_unreachable",
            ReleaseReason::Rollback => "rollback",
            ReleaseReason::Recovery => "recovery",
        };
        f.write_str(s)
    }
}

/// A capacity-accounted claim bound to concrete nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub owner: TenantId,
    pub claim: ResourceClaim,
    /// Nodes the claim is committed on, ascending
    pub nodes: Vec<NodeId>,
    pub state: LeaseState,
    pub expiry: ExpiryPolicy,
    pub expires_at: Option<DateTime<Utc>>,
    pub granted_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub release_reason: Option<ReleaseReason>,
}

impl Lease {
    /// A freshly granted, unconfirmed lease
    pub fn pending(
        owner: TenantId,
        claim: ResourceClaim,
        nodes: Vec<NodeId>,
        expiry: ExpiryPolicy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            claim,
            nodes,
            state: LeaseState::Pending,
            expiry,
            expires_at: None,
            granted_at: Utc::now(),
            activated_at: None,
            released_at: None,
            release_reason: None,
        }
    }

    /// Capacity committed on each bound node
    pub fn per_node(&self) -> ResourceVector {
        self.claim.resources
    }

    pub fn is_on(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    /// Deadline passed
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

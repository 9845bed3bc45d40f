//! State-transition events emitted to observability collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    CargoId, CargoState, FailureReason, LeaseId, MiniClusterId, MiniClusterState, NodeHealth,
    NodeId, ReleaseReason, TenantId,
};

/// Why the reconciliation loop overrode another component's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileReason {
    NodeUnreachable,
    LeaseExpired,
    PendingLeaseTimeout,
    SubstrateUntracked,
    LivenessLost,
    CargoExited,
    RecoveryRollback,
}

/// Every state transition the core performs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEvent {
    NodeRegistered {
        node: NodeId,
    },
    NodeDeregistered {
        node: NodeId,
    },
    NodeHealthChanged {
        node: NodeId,
        from: NodeHealth,
        to: NodeHealth,
    },
    LeaseGranted {
        lease_id: LeaseId,
        owner: TenantId,
        nodes: Vec<NodeId>,
    },
    LeaseActivated {
        lease_id: LeaseId,
        owner: TenantId,
    },
    LeaseExpiring {
        lease_id: LeaseId,
        owner: TenantId,
    },
    LeaseRenewed {
        lease_id: LeaseId,
        owner: TenantId,
        expires_at: Option<DateTime<Utc>>,
    },
    LeaseReleased {
        lease_id: LeaseId,
        owner: TenantId,
        reason: ReleaseReason,
    },
    MiniClusterTransition {
        mini_cluster_id: MiniClusterId,
        owner: TenantId,
        from: Option<MiniClusterState>,
        to: MiniClusterState,
    },
    CargoTransition {
        cargo_id: CargoId,
        mini_cluster_id: MiniClusterId,
        owner: TenantId,
        from: Option<CargoState>,
        to: CargoState,
        failure: Option<FailureReason>,
    },
    /// Forced correction applied by the reconciliation loop
    Reconciled {
        reason: ReconcileReason,
        /// Tenant owning the corrected object, if it still exists
        owner: Option<TenantId>,
        target: String,
        detail: String,
    },
    /// Teardown converged without substrate acknowledgement
    DegradedTeardown {
        cargo_id: CargoId,
        owner: TenantId,
        attempts: u32,
        error: String,
    },
}

impl ClusterEvent {
    /// Short name used as the SSE event type
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterEvent::NodeRegistered { .. } => "node_registered",
            ClusterEvent::NodeDeregistered { .. } => "node_deregistered",
            ClusterEvent::NodeHealthChanged { .. } => "node_health_changed",
            ClusterEvent::LeaseGranted { .. } => "lease_granted",
            ClusterEvent::LeaseActivated { .. } => "lease_activated",
            ClusterEvent::LeaseExpiring { .. } => "lease_expiring",
            ClusterEvent::LeaseRenewed { .. } => "lease_renewed",
            ClusterEvent::LeaseReleased { .. } => "lease_released",
            ClusterEvent::MiniClusterTransition { .. } => "mini_cluster_transition",
            ClusterEvent::CargoTransition { .. } => "cargo_transition",
            ClusterEvent::Reconciled { .. } => "reconciled",
            ClusterEvent::DegradedTeardown { .. } => "degraded_teardown",
        }
    }

    /// Tenant the event belongs to, when it concerns tenant-owned objects
    pub fn owner(&self) -> Option<&TenantId> {
        match self {
            ClusterEvent::LeaseGranted { owner, .. }
            | ClusterEvent::LeaseActivated { owner, .. }
            | ClusterEvent::LeaseExpiring { owner, .. }
            | ClusterEvent::LeaseRenewed { owner, .. }
            | ClusterEvent::LeaseReleased { owner, .. }
            | ClusterEvent::MiniClusterTransition { owner, .. }
            | ClusterEvent::CargoTransition { owner, .. }
            | ClusterEvent::DegradedTeardown { owner, .. } => Some(owner),
            ClusterEvent::Reconciled { owner, .. } => owner.as_ref(),
            ClusterEvent::NodeRegistered { .. }
            | ClusterEvent::NodeDeregistered { .. }
            | ClusterEvent::NodeHealthChanged { .. } => None,
        }
    }
}

/// Event with its sequence number and emission time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub event: ClusterEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = ClusterEvent::Reconciled {
            reason: ReconcileReason::SubstrateUntracked,
            owner: None,
            target: "cargo/x".to_string(),
            detail: "unit vanished".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "reconciled");
        assert_eq!(json["reason"], "substrate_untracked");
        assert_eq!(event.kind(), "reconciled");
        assert!(event.owner().is_none());
    }

    #[test]
    fn test_lease_events_carry_owner() {
        let alice = TenantId::from("alice");
        let released = ClusterEvent::LeaseReleased {
            lease_id: uuid::Uuid::new_v4(),
            owner: alice.clone(),
            reason: ReleaseReason::Expired,
        };
        assert_eq!(released.owner(), Some(&alice));

        let corrected = ClusterEvent::Reconciled {
            reason: ReconcileReason::NodeUnreachable,
            owner: Some(alice.clone()),
            target: "lease/x".to_string(),
            detail: "node gone".to_string(),
        };
        assert_eq!(corrected.owner(), Some(&alice));

        let node = ClusterEvent::NodeRegistered { node: NodeId::from("n1") };
        assert!(node.owner().is_none());
    }
}

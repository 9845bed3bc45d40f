//! Lease manager
//!
//! Sole writer of leases and of committed node capacity. Grants are two
//! phase: a lease is recorded Pending with its capacity committed, and only
//! becomes Active once the holder confirms it. Lock order is always node
//! slots (ascending id) first, then the lease map.

use chrono::{DateTime, Duration, Utc};
use crane_core::{
    ClusterEvent, CraneError, CraneResult, ExpiryPolicy, Lease, LeaseId, LeaseState, NodeId,
    ReleaseReason, ResourceClaim, SchedulerConfig, TenantId,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::event_bus::EventBus;
use crate::inventory::Inventory;
use crate::placement::{BestFitPlacement, CandidateNode, PlacementStrategy};

/// Owner of all leases and their capacity accounting
pub struct LeaseManager {
    inventory: Arc<Inventory>,
    leases: RwLock<HashMap<LeaseId, Lease>>,
    placement: Arc<dyn PlacementStrategy>,
    events: Arc<EventBus>,
    expiry_grace: Duration,
    pending_timeout: Duration,
}

/// Config windows are capped at 100 years
const MAX_WINDOW_SECS: i64 = 100 * 365 * 24 * 3600;

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(MAX_WINDOW_SECS).min(MAX_WINDOW_SECS))
}

impl LeaseManager {
    pub fn new(inventory: Arc<Inventory>, events: Arc<EventBus>, config: &SchedulerConfig) -> Self {
        Self {
            inventory,
            leases: RwLock::new(HashMap::new()),
            placement: Arc::new(BestFitPlacement),
            events,
            expiry_grace: secs(config.expiry_grace_secs),
            pending_timeout: secs(config.pending_timeout_secs),
        }
    }

    /// Replace the placement strategy
    pub fn with_placement(mut self, placement: Arc<dyn PlacementStrategy>) -> Self {
        self.placement = placement;
        self
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    /// Commit capacity for `claim` on nodes drawn from `candidates` and
    /// record a Pending lease.
    pub async fn grant(
        &self,
        owner: &TenantId,
        claim: &ResourceClaim,
        candidates: &[NodeId],
        expiry: ExpiryPolicy,
    ) -> CraneResult<Lease> {
        claim.validate()?;

        let mut guards = self.inventory.lock_sorted(candidates).await;

        // Availability is re-read under the locks
        let eligible: Vec<CandidateNode> = guards
            .iter()
            .filter(|g| g.node.is_schedulable())
            .map(|g| CandidateNode {
                id: g.node.id.clone(),
                available: g.available(),
                gpu_type: g.node.gpu_type.clone(),
            })
            .collect();

        let decision = self.placement.place(claim, &eligible).ok_or_else(|| {
            CraneError::InsufficientCapacity(format!(
                "no {} eligible node(s) with {} free",
                claim.nodes, claim.resources
            ))
        })?;

        let lease = Lease::pending(owner.clone(), claim.clone(), decision.nodes.clone(), expiry);
        let per_node = lease.per_node();

        for i in 0..guards.len() {
            if !decision.nodes.contains(&guards[i].node.id) {
                continue;
            }
            if let Err(e) = guards[i].commit(lease.id, per_node) {
                for guard in guards[..i].iter_mut() {
                    guard.uncommit(&lease.id, per_node);
                }
                return Err(e);
            }
        }

        self.leases.write().await.insert(lease.id, lease.clone());
        drop(guards);

        info!(
            lease_id = %lease.id,
            owner = %owner,
            nodes = ?lease.nodes,
            per_node = %per_node,
            "Lease granted"
        );
        self.events.publish(ClusterEvent::LeaseGranted {
            lease_id: lease.id,
            owner: owner.clone(),
            nodes: lease.nodes.clone(),
        });

        Ok(lease)
    }

    /// Confirm a Pending lease
    pub async fn activate(&self, id: &LeaseId) -> CraneResult<Lease> {
        let lease = {
            let mut leases = self.leases.write().await;
            let lease = leases
                .get_mut(id)
                .ok_or_else(|| CraneError::LeaseNotFound(id.to_string()))?;
            if lease.state != LeaseState::Pending {
                return Err(CraneError::LeaseNotActive(format!(
                    "{} is {}, expected Pending",
                    id, lease.state
                )));
            }
            let now = Utc::now();
            lease.state = LeaseState::Active;
            lease.activated_at = Some(now);
            lease.expires_at = lease.expiry.deadline_from(now);
            lease.clone()
        };

        debug!(lease_id = %id, expires_at = ?lease.expires_at, "Lease activated");
        self.events.publish(ClusterEvent::LeaseActivated {
            lease_id: *id,
            owner: lease.owner.clone(),
        });
        Ok(lease)
    }

    /// Push an Active or Expiring lease's deadline out.
    ///
    /// With no explicit deadline the lease's own expiry policy is re-applied
    /// from now.
    pub async fn renew(&self, id: &LeaseId, until: Option<DateTime<Utc>>) -> CraneResult<Lease> {
        let lease = {
            let mut leases = self.leases.write().await;
            let lease = leases
                .get_mut(id)
                .ok_or_else(|| CraneError::LeaseNotFound(id.to_string()))?;
            if !lease.state.is_usable() {
                return Err(CraneError::LeaseNotActive(format!(
                    "{} is {}",
                    id, lease.state
                )));
            }
            let now = Utc::now();
            let expires_at = until.or_else(|| lease.expiry.deadline_from(now));
            if expires_at.is_some_and(|at| at <= now) {
                return Err(CraneError::InvalidRequest(
                    "renewal deadline is in the past".to_string(),
                ));
            }
            lease.state = LeaseState::Active;
            lease.expires_at = expires_at;
            lease.clone()
        };

        debug!(lease_id = %id, expires_at = ?lease.expires_at, "Lease renewed");
        self.events.publish(ClusterEvent::LeaseRenewed {
            lease_id: *id,
            owner: lease.owner.clone(),
            expires_at: lease.expires_at,
        });
        Ok(lease)
    }

    /// Return a lease's capacity. Releasing a released lease is a no-op.
    ///
    /// Returns the lease if this call released it.
    pub async fn release(&self, id: &LeaseId, reason: ReleaseReason) -> CraneResult<Option<Lease>> {
        self.release_if(id, reason, |_| true).await
    }

    /// Release on behalf of the reconciliation loop
    pub async fn force_release(&self, id: &LeaseId, reason: ReleaseReason) -> CraneResult<Option<Lease>> {
        let released = self.release(id, reason).await?;
        if released.is_some() {
            warn!(lease_id = %id, reason = %reason, "Lease force-released");
        }
        Ok(released)
    }

    /// Release a lease if `still` holds once the node locks are taken
    async fn release_if<F>(
        &self,
        id: &LeaseId,
        reason: ReleaseReason,
        still: F,
    ) -> CraneResult<Option<Lease>>
    where
        F: Fn(&Lease) -> bool,
    {
        let nodes = {
            let leases = self.leases.read().await;
            let lease = leases
                .get(id)
                .ok_or_else(|| CraneError::LeaseNotFound(id.to_string()))?;
            if lease.state == LeaseState::Released {
                return Ok(None);
            }
            lease.nodes.clone()
        };

        let mut guards = self.inventory.lock_sorted(&nodes).await;
        let released = {
            let mut leases = self.leases.write().await;
            let lease = leases
                .get_mut(id)
                .ok_or_else(|| CraneError::LeaseNotFound(id.to_string()))?;
            if lease.state == LeaseState::Released || !still(lease) {
                return Ok(None);
            }
            let per_node = lease.per_node();
            for guard in guards.iter_mut() {
                guard.uncommit(id, per_node);
            }
            lease.state = LeaseState::Released;
            lease.released_at = Some(Utc::now());
            lease.release_reason = Some(reason);
            lease.clone()
        };
        drop(guards);

        info!(lease_id = %id, reason = %reason, nodes = ?released.nodes, "Lease released");
        self.events.publish(ClusterEvent::LeaseReleased {
            lease_id: *id,
            owner: released.owner.clone(),
            reason,
        });
        Ok(Some(released))
    }

    /// Advance lease expiry.
    ///
    /// Active leases past their deadline become Expiring. Leases past
    /// deadline plus grace, and Pending leases never confirmed within the
    /// pending timeout, are released. Returns the released leases.
    pub async fn expire_sweep(&self, now: DateTime<Utc>) -> Vec<Lease> {
        let grace = self.expiry_grace;
        let pending_timeout = self.pending_timeout;

        let (expiring, due) = {
            let mut leases = self.leases.write().await;
            let mut expiring = Vec::new();
            let mut due = Vec::new();
            for lease in leases.values_mut() {
                match lease.state {
                    LeaseState::Pending if lease.granted_at + pending_timeout <= now => {
                        due.push((lease.id, ReleaseReason::PendingTimeout));
                    }
                    LeaseState::Active if lease.is_past_deadline(now) => {
                        lease.state = LeaseState::Expiring;
                        expiring.push((lease.id, lease.owner.clone()));
                        if past_grace(lease, grace, now) {
                            due.push((lease.id, ReleaseReason::Expired));
                        }
                    }
                    LeaseState::Expiring if past_grace(lease, grace, now) => {
                        due.push((lease.id, ReleaseReason::Expired));
                    }
                    _ => {}
                }
            }
            (expiring, due)
        };

        for (id, owner) in expiring {
            debug!(lease_id = %id, "Lease expiring");
            self.events.publish(ClusterEvent::LeaseExpiring { lease_id: id, owner });
        }

        let mut released = Vec::new();
        for (id, reason) in due {
            // A renewal may have landed since the scan
            let result = self
                .release_if(&id, reason, |l| match reason {
                    ReleaseReason::PendingTimeout => l.state == LeaseState::Pending,
                    _ => l.state == LeaseState::Expiring && past_grace(l, grace, now),
                })
                .await;
            match result {
                Ok(Some(lease)) => released.push(lease),
                Ok(None) => {}
                Err(e) => warn!(lease_id = %id, error = %e, "Expiry release failed"),
            }
        }
        released
    }

    pub async fn get(&self, id: &LeaseId) -> CraneResult<Lease> {
        self.leases
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CraneError::LeaseNotFound(id.to_string()))
    }

    /// Leases for the given ids, in the given order; unknown ids are skipped
    pub async fn get_many(&self, ids: &[LeaseId]) -> Vec<Lease> {
        let leases = self.leases.read().await;
        ids.iter().filter_map(|id| leases.get(id).cloned()).collect()
    }

    pub async fn list(&self) -> Vec<Lease> {
        let mut all: Vec<Lease> = self.leases.read().await.values().cloned().collect();
        all.sort_by_key(|l| l.granted_at);
        all
    }

    pub async fn list_for(&self, owner: &TenantId) -> Vec<Lease> {
        let mut owned: Vec<Lease> = self
            .leases
            .read()
            .await
            .values()
            .filter(|l| &l.owner == owner)
            .cloned()
            .collect();
        owned.sort_by_key(|l| l.granted_at);
        owned
    }

    /// Leases holding capacity on a node
    pub async fn leases_on_node(&self, node: &NodeId) -> Vec<Lease> {
        self.leases
            .read()
            .await
            .values()
            .filter(|l| l.state.holds_capacity() && l.is_on(node))
            .cloned()
            .collect()
    }

    /// Ids of every lease still holding capacity
    pub async fn live_ids(&self) -> HashSet<LeaseId> {
        self.leases
            .read()
            .await
            .values()
            .filter(|l| l.state.holds_capacity())
            .map(|l| l.id)
            .collect()
    }

    /// Load leases read from a snapshot.
    ///
    /// Pending leases are rolled back. Active and Expiring leases have their
    /// capacity re-committed; any that no longer fit, or whose nodes are
    /// gone, are rolled back too. Returns the rolled back ids.
    pub async fn restore(&self, leases: Vec<Lease>) -> Vec<LeaseId> {
        let mut rolled_back = Vec::new();

        for mut lease in leases {
            if lease.state.holds_capacity() {
                let restored = lease.state != LeaseState::Pending && self.recommit(&lease).await;
                if !restored {
                    lease.state = LeaseState::Released;
                    lease.released_at = Some(Utc::now());
                    lease.release_reason = Some(ReleaseReason::Recovery);
                    rolled_back.push(lease.id);
                    warn!(lease_id = %lease.id, "Lease rolled back during recovery");
                }
            }
            self.leases.write().await.insert(lease.id, lease);
        }

        rolled_back
    }

    async fn recommit(&self, lease: &Lease) -> bool {
        let mut guards = self.inventory.lock_sorted(&lease.nodes).await;
        if guards.len() != lease.nodes.len() {
            return false;
        }
        let per_node = lease.per_node();
        for i in 0..guards.len() {
            if guards[i].commit(lease.id, per_node).is_err() {
                for guard in guards[..i].iter_mut() {
                    guard.uncommit(&lease.id, per_node);
                }
                return false;
            }
        }
        true
    }

    /// Drop released leases released before `before`
    pub async fn prune_released(&self, before: DateTime<Utc>) -> usize {
        let mut leases = self.leases.write().await;
        let initial = leases.len();
        leases.retain(|_, l| {
            !(l.state == LeaseState::Released && l.released_at.is_some_and(|at| at < before))
        });
        initial - leases.len()
    }
}

fn past_grace(lease: &Lease, grace: Duration, now: DateTime<Utc>) -> bool {
    lease.expires_at.is_some_and(|at| at + grace <= now)
}

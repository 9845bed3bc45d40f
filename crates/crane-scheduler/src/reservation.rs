//! Mini-cluster reservation manager
//!
//! A mini-cluster is a named set of leases, one per unit, held on behalf of a
//! tenant. Each record sits behind its own mutex; holding it serializes
//! resizes, releases and cargo capacity accounting for that mini-cluster.

use chrono::{DateTime, Utc};
use crane_core::{
    ClusterEvent, CraneError, CraneResult, Lease, LeaseId, LeaseState, Lifecycle, MiniCluster,
    MiniClusterId, MiniClusterRequest, MiniClusterState, NodeId, ReleaseReason, ResizeOutcome,
    TenantId,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::event_bus::EventBus;
use crate::lease_manager::LeaseManager;

type Record = Arc<Mutex<MiniCluster>>;

/// Owner of mini-cluster records
pub struct ReservationManager {
    leases: Arc<LeaseManager>,
    events: Arc<EventBus>,
    clusters: RwLock<HashMap<MiniClusterId, Record>>,
}

impl ReservationManager {
    pub fn new(leases: Arc<LeaseManager>, events: Arc<EventBus>) -> Self {
        Self {
            leases,
            events,
            clusters: RwLock::new(HashMap::new()),
        }
    }

    fn transition(&self, mc: &mut MiniCluster, next: MiniClusterState) -> CraneResult<()> {
        let previous = mc.history.transition(next)?;
        info!(
            mini_cluster_id = %mc.id,
            name = %mc.name,
            from = %previous,
            to = %next,
            "Mini-cluster transition"
        );
        self.events.publish(ClusterEvent::MiniClusterTransition {
            mini_cluster_id: mc.id,
            owner: mc.owner.clone(),
            from: Some(previous),
            to: next,
        });
        Ok(())
    }

    async fn record(&self, id: &MiniClusterId) -> CraneResult<Record> {
        self.clusters
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CraneError::MiniClusterNotFound(id.to_string()))
    }

    /// Lock a mini-cluster for exclusive mutation
    pub async fn lock(&self, id: &MiniClusterId) -> CraneResult<OwnedMutexGuard<MiniCluster>> {
        Ok(self.record(id).await?.lock_owned().await)
    }

    /// Reserve up to `target_size` units, all or nothing below the minimum.
    ///
    /// Every unit gets its own Pending lease. If fewer than the minimum size
    /// (the target unless given) can be granted, the granted leases are
    /// rolled back and the reservation is dropped. Otherwise all leases are
    /// activated and the mini-cluster becomes Active.
    pub async fn reserve(&self, owner: &TenantId, request: MiniClusterRequest) -> CraneResult<MiniCluster> {
        request.validate()?;

        let mc = MiniCluster::new(owner.clone(), request);
        let id = mc.id;
        info!(
            mini_cluster_id = %id,
            name = %mc.name,
            owner = %owner,
            target_size = mc.target_size,
            per_unit = %mc.per_unit_claim.resources,
            "Reserving mini-cluster"
        );
        self.events.publish(ClusterEvent::MiniClusterTransition {
            mini_cluster_id: id,
            owner: owner.clone(),
            from: None,
            to: MiniClusterState::Reserving,
        });

        let record = Arc::new(Mutex::new(mc));
        let mut guard = record.clone().lock_owned().await;
        self.clusters.write().await.insert(id, record);

        match self.fill(&mut guard).await {
            Ok(()) => {
                self.transition(&mut guard, MiniClusterState::Active)?;
                Ok(guard.clone())
            }
            Err(e) => {
                warn!(mini_cluster_id = %id, error = %e, "Reservation failed, rolling back");
                for lease_id in std::mem::take(&mut guard.lease_ids) {
                    if let Err(release_err) =
                        self.leases.release(&lease_id, ReleaseReason::Rollback).await
                    {
                        warn!(lease_id = %lease_id, error = %release_err, "Rollback release failed");
                    }
                }
                self.transition(&mut guard, MiniClusterState::Released)?;
                drop(guard);
                self.clusters.write().await.remove(&id);
                Err(e)
            }
        }
    }

    /// Grant and then activate one lease per unit, stopping short of the
    /// target only once the minimum is held
    async fn fill(&self, mc: &mut MiniCluster) -> CraneResult<()> {
        let required = mc.required_size();
        while mc.current_size() < mc.target_size {
            let candidates = self.candidates_for(mc).await;
            match self
                .leases
                .grant(&mc.owner, &mc.per_unit_claim, &candidates, mc.expiry)
                .await
            {
                Ok(lease) => mc.lease_ids.push(lease.id),
                Err(e) if mc.current_size() >= required => {
                    info!(
                        mini_cluster_id = %mc.id,
                        reached = mc.current_size(),
                        target = mc.target_size,
                        reason = %e,
                        "Reserved at or above minimum, short of target"
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        for lease_id in &mc.lease_ids {
            self.leases.activate(lease_id).await?;
        }
        Ok(())
    }

    /// Nodes a new unit of `mc` may be placed on
    async fn candidates_for(&self, mc: &MiniCluster) -> Vec<NodeId> {
        let mut candidates = self.leases.inventory().node_ids().await;
        let constraints = &mc.per_unit_claim.constraints;
        if !constraints.anti_affinity && !constraints.co_locate {
            return candidates;
        }

        let used: HashSet<NodeId> = self
            .leases
            .get_many(&mc.lease_ids)
            .await
            .into_iter()
            .filter(|l| l.state.holds_capacity())
            .flat_map(|l| l.nodes)
            .collect();

        if constraints.anti_affinity {
            candidates.retain(|n| !used.contains(n));
        }
        if constraints.co_locate && !used.is_empty() {
            candidates.retain(|n| used.contains(n));
        }
        candidates
    }

    /// Start a resize on a locked, Active mini-cluster
    pub fn begin_resize(&self, mc: &mut MiniCluster) -> CraneResult<()> {
        if !mc.is_active() {
            return Err(CraneError::MiniClusterNotActive(format!(
                "{} is {}",
                mc.id,
                mc.state()
            )));
        }
        self.transition(mc, MiniClusterState::Resizing)
    }

    pub fn end_resize(&self, mc: &mut MiniCluster) -> CraneResult<()> {
        self.transition(mc, MiniClusterState::Active)
    }

    /// Grow towards `target`, one independent grant per missing unit.
    ///
    /// Stops at the first grant that fails; the shortfall is reported in the
    /// outcome rather than as an error.
    pub async fn grow(&self, mc: &mut MiniCluster, target: u32) -> ResizeOutcome {
        mc.target_size = target;
        while mc.current_size() < target {
            let candidates = self.candidates_for(mc).await;
            let granted = self
                .leases
                .grant(&mc.owner, &mc.per_unit_claim, &candidates, mc.expiry)
                .await;
            let lease = match granted {
                Ok(lease) => lease,
                Err(e) => {
                    info!(
                        mini_cluster_id = %mc.id,
                        reached = mc.current_size(),
                        target = target,
                        reason = %e,
                        "Partial growth"
                    );
                    break;
                }
            };
            if let Err(e) = self.leases.activate(&lease.id).await {
                warn!(lease_id = %lease.id, error = %e, "Activation failed during growth");
                if let Err(e) = self.leases.release(&lease.id, ReleaseReason::Rollback).await {
                    warn!(lease_id = %lease.id, error = %e, "Rollback release failed");
                }
                break;
            }
            mc.lease_ids.push(lease.id);
        }
        ResizeOutcome::new(target, mc.current_size())
    }

    /// Leases to drop when shrinking to `target`: leases hosting no live
    /// cargo first, then most recently granted first.
    pub fn shrink_victims(mc: &MiniCluster, target: u32, busy: &HashSet<LeaseId>) -> Vec<LeaseId> {
        let excess = mc.current_size().saturating_sub(target) as usize;
        let newest_first = mc.lease_ids.iter().rev();
        let idle = newest_first.clone().filter(|id| !busy.contains(*id));
        let occupied = newest_first.filter(|id| busy.contains(*id));
        idle.chain(occupied).take(excess).copied().collect()
    }

    /// Release `victims` and record the new target
    pub async fn shrink(&self, mc: &mut MiniCluster, target: u32, victims: &[LeaseId]) -> ResizeOutcome {
        for lease_id in victims {
            if let Err(e) = self.leases.release(lease_id, ReleaseReason::Requested).await {
                warn!(lease_id = %lease_id, error = %e, "Release failed during shrink");
            }
        }
        mc.lease_ids.retain(|id| !victims.contains(id));
        mc.target_size = target;
        ResizeOutcome::new(target, mc.current_size())
    }

    /// Move a mini-cluster to Releasing. Returns `None` when it is already
    /// Released.
    pub async fn begin_release(&self, id: &MiniClusterId) -> CraneResult<Option<MiniCluster>> {
        let mut mc = self.lock(id).await?;
        match mc.state() {
            MiniClusterState::Released => return Ok(None),
            MiniClusterState::Releasing => {}
            _ => self.transition(&mut mc, MiniClusterState::Releasing)?,
        }
        Ok(Some(mc.clone()))
    }

    /// Release every member lease and close the mini-cluster
    pub async fn finish_release(&self, id: &MiniClusterId, reason: ReleaseReason) -> CraneResult<()> {
        let mut mc = self.lock(id).await?;
        if mc.state() == MiniClusterState::Released {
            return Ok(());
        }
        for lease_id in std::mem::take(&mut mc.lease_ids) {
            if let Err(e) = self.leases.release(&lease_id, reason).await {
                warn!(lease_id = %lease_id, error = %e, "Lease release failed");
            }
        }
        if mc.state() != MiniClusterState::Releasing {
            self.transition(&mut mc, MiniClusterState::Releasing)?;
        }
        self.transition(&mut mc, MiniClusterState::Released)
    }

    /// Drop released leases from their mini-clusters. Mini-clusters left
    /// without leases are closed; their ids are returned.
    pub async fn on_leases_released(&self, released: &[Lease]) -> Vec<MiniClusterId> {
        if released.is_empty() {
            return Vec::new();
        }
        let gone: HashSet<LeaseId> = released.iter().map(|l| l.id).collect();
        let records: Vec<Record> = self.clusters.read().await.values().cloned().collect();

        let mut closed = Vec::new();
        for record in records {
            let mut mc = record.lock().await;
            let before = mc.lease_ids.len();
            mc.lease_ids.retain(|id| !gone.contains(id));
            if mc.lease_ids.len() == before {
                continue;
            }
            debug!(
                mini_cluster_id = %mc.id,
                lost = before - mc.lease_ids.len(),
                "Mini-cluster lost leases"
            );
            if mc.lease_ids.is_empty()
                && matches!(
                    mc.state(),
                    MiniClusterState::Active | MiniClusterState::Resizing
                )
            {
                let closing = self
                    .transition(&mut mc, MiniClusterState::Releasing)
                    .and_then(|_| self.transition(&mut mc, MiniClusterState::Released));
                match closing {
                    Ok(()) => closed.push(mc.id),
                    Err(e) => warn!(mini_cluster_id = %mc.id, error = %e, "Failed to close mini-cluster"),
                }
            }
        }
        closed
    }

    pub async fn get(&self, id: &MiniClusterId) -> CraneResult<MiniCluster> {
        Ok(self.lock(id).await?.clone())
    }

    pub async fn list(&self) -> Vec<MiniCluster> {
        let records: Vec<Record> = self.clusters.read().await.values().cloned().collect();
        let mut all = Vec::with_capacity(records.len());
        for record in records {
            all.push(record.lock().await.clone());
        }
        all.sort_by_key(|mc| mc.created_at());
        all
    }

    pub async fn list_for(&self, owner: &TenantId) -> Vec<MiniCluster> {
        let mut owned = self.list().await;
        owned.retain(|mc| &mc.owner == owner);
        owned
    }

    /// Load mini-clusters read from a snapshot.
    ///
    /// Member leases not in `live_leases` are dropped. Half-built
    /// reservations are rolled back, interrupted resizes settle on Active and
    /// mini-clusters left without leases are closed. Returns rolled back ids.
    pub async fn restore(
        &self,
        mini_clusters: Vec<MiniCluster>,
        live_leases: &HashSet<LeaseId>,
    ) -> Vec<MiniClusterId> {
        let mut rolled_back = Vec::new();

        for mut mc in mini_clusters {
            let (kept, lost): (Vec<LeaseId>, Vec<LeaseId>) =
                mc.lease_ids.iter().copied().partition(|id| live_leases.contains(id));
            mc.lease_ids = kept;
            if !lost.is_empty() {
                debug!(mini_cluster_id = %mc.id, lost = lost.len(), "Dropped stale leases on restore");
            }

            let settled = match mc.state() {
                MiniClusterState::Reserving => {
                    for lease_id in std::mem::take(&mut mc.lease_ids) {
                        if let Err(e) = self.leases.release(&lease_id, ReleaseReason::Recovery).await {
                            warn!(lease_id = %lease_id, error = %e, "Recovery release failed");
                        }
                    }
                    rolled_back.push(mc.id);
                    self.transition(&mut mc, MiniClusterState::Released)
                }
                MiniClusterState::Resizing if !mc.lease_ids.is_empty() => {
                    self.transition(&mut mc, MiniClusterState::Active)
                }
                MiniClusterState::Active | MiniClusterState::Resizing if mc.lease_ids.is_empty() => {
                    self.transition(&mut mc, MiniClusterState::Releasing)
                        .and_then(|_| self.transition(&mut mc, MiniClusterState::Released))
                }
                _ => Ok(()),
            };
            if let Err(e) = settled {
                warn!(mini_cluster_id = %mc.id, error = %e, "Failed to settle restored mini-cluster");
            }

            self.clusters
                .write()
                .await
                .insert(mc.id, Arc::new(Mutex::new(mc)));
        }

        rolled_back
    }

    /// Drop Released mini-clusters closed before `before`
    pub async fn prune(&self, before: DateTime<Utc>) -> Vec<MiniClusterId> {
        let records: Vec<(MiniClusterId, Record)> = self
            .clusters
            .read()
            .await
            .iter()
            .map(|(id, r)| (*id, r.clone()))
            .collect();

        let mut stale = Vec::new();
        for (id, record) in records {
            let mc = record.lock().await;
            if mc.state().is_terminal() && mc.history.last_transition_at() < before {
                stale.push(id);
            }
        }

        if !stale.is_empty() {
            let mut clusters = self.clusters.write().await;
            for id in &stale {
                clusters.remove(id);
            }
            debug!(count = stale.len(), "Pruned released mini-clusters");
        }
        stale
    }

    /// Leases currently backing a mini-cluster
    pub async fn leases_of(&self, mc: &MiniCluster) -> Vec<Lease> {
        self.leases
            .get_many(&mc.lease_ids)
            .await
            .into_iter()
            .filter(|l| l.state != LeaseState::Released)
            .collect()
    }
}

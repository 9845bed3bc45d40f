//! Tenant-facing facade over the scheduling components
//!
//! Every tenant operation is checked by the isolation enforcer before it
//! touches state, and every mutation is followed by a snapshot when a state
//! store is attached.

use chrono::{DateTime, Utc};
use crane_core::{
    Cargo, CargoId, CargoRequest, ClusterEvent, CraneError, CraneResult, EventEnvelope,
    FailureReason, Lease, LeaseId, LeaseState, MiniCluster, MiniClusterId, MiniClusterRequest,
    MiniClusterState, MiniClusterStatus, Node, NodeHealth, NodeId, NodeSpec, NodeView,
    ReconcileReason, ReleaseReason, ResizeOutcome, ResourceVector, SchedulerConfig, TenantId,
};
use crane_runtime::Substrate;
use crane_store::{ClusterSnapshot, StateStore};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::event_bus::EventBus;
use crate::executor::CargoExecutor;
use crate::inventory::Inventory;
use crate::isolation::{IsolationEnforcer, ResourceRef, TenantView};
use crate::lease_manager::LeaseManager;
use crate::reservation::ReservationManager;

/// Cluster-wide counters
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub nodes: usize,
    pub healthy_nodes: usize,
    pub capacity: ResourceVector,
    pub committed: ResourceVector,
    pub available: ResourceVector,
    pub live_leases: usize,
    pub active_mini_clusters: usize,
    pub live_cargoes: usize,
    pub substrate: String,
    pub last_event_seq: u64,
}

/// Facade over inventory, leases, reservations and cargo
pub struct Scheduler {
    config: SchedulerConfig,
    events: Arc<EventBus>,
    inventory: Arc<Inventory>,
    leases: Arc<LeaseManager>,
    reservations: Arc<ReservationManager>,
    executor: Arc<CargoExecutor>,
    isolation: IsolationEnforcer,
    store: Option<Arc<dyn StateStore>>,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig, substrate: Arc<dyn Substrate>, event_capacity: usize) -> Self {
        let events = Arc::new(EventBus::new(event_capacity));
        let inventory = Arc::new(Inventory::new());
        let leases = Arc::new(LeaseManager::new(inventory.clone(), events.clone(), config));
        let reservations = Arc::new(ReservationManager::new(leases.clone(), events.clone()));
        let executor = Arc::new(CargoExecutor::new(
            substrate.clone(),
            leases.clone(),
            events.clone(),
            config,
        ));
        let isolation = IsolationEnforcer::new(reservations.clone(), executor.clone(), leases.clone());

        info!(
            substrate = substrate.name(),
            launch_timeout_secs = config.launch_timeout_secs,
            pending_timeout_secs = config.pending_timeout_secs,
            "Scheduler initialized"
        );

        Self {
            config: config.clone(),
            events,
            inventory,
            leases,
            reservations,
            executor,
            isolation,
            store: None,
        }
    }

    /// Persist a snapshot after every mutation
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build a scheduler from the latest snapshot in `store`.
    ///
    /// Unconfirmed leases and half-built reservations are rolled back,
    /// surviving leases re-commit their capacity, and every live cargo is
    /// checked against the substrate before the scheduler is returned.
    pub async fn recover(
        config: &SchedulerConfig,
        substrate: Arc<dyn Substrate>,
        store: Arc<dyn StateStore>,
        event_capacity: usize,
    ) -> CraneResult<Self> {
        let scheduler = Self::new(config, substrate, event_capacity).with_store(store.clone());

        let Some(snapshot) = store.load().await? else {
            info!(store = store.name(), "No snapshot found, starting empty");
            return Ok(scheduler);
        };

        info!(
            store = store.name(),
            taken_at = %snapshot.taken_at,
            nodes = snapshot.nodes.len(),
            leases = snapshot.leases.len(),
            mini_clusters = snapshot.mini_clusters.len(),
            cargoes = snapshot.cargoes.len(),
            "Recovering cluster state"
        );

        for node in snapshot.nodes {
            let id = node.id.clone();
            if let Err(e) = scheduler.inventory.restore(node).await {
                warn!(node = %id, error = %e, "Skipping node from snapshot");
            }
        }

        let mut rollbacks: Vec<(Option<TenantId>, String, &str)> = Vec::new();

        for id in scheduler.leases.restore(snapshot.leases).await {
            let owner = scheduler.leases.get(&id).await.ok().map(|l| l.owner);
            rollbacks.push((owner, id.to_string(), "lease not confirmed or no longer fits"));
        }

        let live = scheduler.leases.live_ids().await;
        for id in scheduler.reservations.restore(snapshot.mini_clusters, &live).await {
            let owner = scheduler.reservations.get(&id).await.ok().map(|mc| mc.owner);
            rollbacks.push((owner, id.to_string(), "reservation interrupted"));
        }

        // Leases granted but never attached to a mini-cluster
        let attached: HashSet<LeaseId> = scheduler
            .reservations
            .list()
            .await
            .iter()
            .filter(|mc| mc.state() != MiniClusterState::Released)
            .flat_map(|mc| mc.lease_ids.iter().copied())
            .collect();
        for id in scheduler.leases.live_ids().await.difference(&attached) {
            if let Ok(Some(lease)) = scheduler.leases.release(id, ReleaseReason::Recovery).await {
                rollbacks.push((Some(lease.owner), id.to_string(), "lease not attached to a mini-cluster"));
            }
        }

        let live = scheduler.leases.live_ids().await;
        for id in scheduler.executor.restore(snapshot.cargoes, &live).await {
            let owner = scheduler.executor.get(&id).await.ok().map(|c| c.owner);
            rollbacks.push((owner, id.to_string(), "cargo interrupted or exited while down"));
        }

        for mc in scheduler.reservations.list().await {
            if mc.state() == MiniClusterState::Releasing {
                scheduler.complete_release(&mc.id, ReleaseReason::Recovery).await?;
                rollbacks.push((Some(mc.owner.clone()), mc.id.to_string(), "release completed"));
            }
        }

        for (owner, target, detail) in rollbacks {
            warn!(target = %target, detail = %detail, "Recovery rollback");
            scheduler.events.publish(ClusterEvent::Reconciled {
                reason: ReconcileReason::RecoveryRollback,
                owner,
                target,
                detail: detail.to_string(),
            });
        }

        scheduler.persist().await?;
        Ok(scheduler)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn reservations(&self) -> &Arc<ReservationManager> {
        &self.reservations
    }

    pub fn executor(&self) -> &Arc<CargoExecutor> {
        &self.executor
    }

    pub fn isolation(&self) -> &IsolationEnforcer {
        &self.isolation
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    // Nodes

    pub async fn register_node(&self, spec: NodeSpec) -> CraneResult<NodeView> {
        let node = Node::new(spec);
        let id = node.id.clone();
        self.inventory.register(node).await?;
        self.events.publish(ClusterEvent::NodeRegistered { node: id.clone() });
        self.checkpoint().await;
        self.inventory.view(&id).await
    }

    /// Remove a node. Fails with `NodeBusy` while leases hold capacity on it.
    pub async fn deregister_node(&self, id: &NodeId) -> CraneResult<Node> {
        let node = self.inventory.deregister(id).await?;
        self.events.publish(ClusterEvent::NodeDeregistered { node: id.clone() });
        self.checkpoint().await;
        Ok(node)
    }

    pub async fn nodes(&self) -> Vec<NodeView> {
        self.inventory.snapshot().await
    }

    // Mini-clusters

    pub async fn reserve_mini_cluster(
        &self,
        tenant: &TenantId,
        request: MiniClusterRequest,
    ) -> CraneResult<MiniCluster> {
        let result = self.reservations.reserve(tenant, request).await;
        self.checkpoint().await;
        result
    }

    /// Resize to `target` units.
    ///
    /// Growth may stop short; the outcome reports the size reached. Shrinking
    /// past the leases hosting no live cargo kills the cargo on the dropped
    /// leases.
    pub async fn resize_mini_cluster(
        &self,
        tenant: &TenantId,
        id: &MiniClusterId,
        target: u32,
    ) -> CraneResult<ResizeOutcome> {
        self.isolation.require(tenant, ResourceRef::MiniCluster(*id)).await?;

        let mut mc = self.reservations.lock(id).await?;
        mc.check_resize(target)?;
        let current = mc.current_size();
        if target == current {
            if !mc.is_active() {
                return Err(CraneError::MiniClusterNotActive(format!(
                    "{} is {}",
                    mc.id,
                    mc.state()
                )));
            }
            mc.target_size = target;
            return Ok(ResizeOutcome::new(target, current));
        }

        self.reservations.begin_resize(&mut mc)?;
        let outcome = if target > current {
            self.reservations.grow(&mut mc, target).await
        } else {
            let busy = self.executor.busy_leases(id).await;
            let victims = ReservationManager::shrink_victims(&mc, target, &busy);
            let doomed: HashSet<LeaseId> = victims.iter().copied().collect();
            for cargo_id in self.executor.cargoes_on_leases(&doomed).await {
                info!(cargo_id = %cargo_id, mini_cluster_id = %id, "Killing cargo on shrunk lease");
                if let Err(e) = self.executor.kill(&cargo_id).await {
                    warn!(cargo_id = %cargo_id, error = %e, "Kill during shrink failed");
                }
            }
            self.reservations.shrink(&mut mc, target, &victims).await
        };
        self.reservations.end_resize(&mut mc)?;
        drop(mc);

        info!(
            mini_cluster_id = %id,
            requested = outcome.requested,
            actual = outcome.actual,
            partial = outcome.partial,
            "Mini-cluster resized"
        );
        self.checkpoint().await;
        Ok(outcome)
    }

    /// Release a mini-cluster, killing its cargo first. Idempotent.
    pub async fn release_mini_cluster(&self, tenant: &TenantId, id: &MiniClusterId) -> CraneResult<()> {
        self.isolation.require(tenant, ResourceRef::MiniCluster(*id)).await?;
        if self.reservations.begin_release(id).await?.is_none() {
            debug!(mini_cluster_id = %id, "Mini-cluster already released");
            return Ok(());
        }
        self.complete_release(id, ReleaseReason::Requested).await?;
        self.checkpoint().await;
        Ok(())
    }

    async fn complete_release(&self, id: &MiniClusterId, reason: ReleaseReason) -> CraneResult<()> {
        for cargo_id in self.executor.live_in(id).await {
            if let Err(e) = self.executor.kill(&cargo_id).await {
                warn!(cargo_id = %cargo_id, error = %e, "Kill during release failed");
            }
        }
        self.reservations.finish_release(id, reason).await
    }

    pub async fn mini_cluster_status(
        &self,
        tenant: &TenantId,
        id: &MiniClusterId,
    ) -> CraneResult<MiniClusterStatus> {
        self.isolation.require(tenant, ResourceRef::MiniCluster(*id)).await?;
        let mc = self.reservations.get(id).await?;
        let leases = self.reservations.leases_of(&mc).await;
        let leased = leases
            .iter()
            .filter(|l| l.state.is_usable())
            .map(|l| l.claim.total())
            .sum();
        Ok(MiniClusterStatus {
            leased,
            in_use: self.executor.in_use(id).await,
            cargo_count: self.executor.list_in(id).await.len(),
            leases,
            mini_cluster: mc,
        })
    }

    pub async fn list_mini_clusters(&self, tenant: &TenantId) -> Vec<MiniCluster> {
        self.reservations.list_for(tenant).await
    }

    // Cargo

    pub async fn submit_cargo(
        &self,
        tenant: &TenantId,
        mini_cluster_id: &MiniClusterId,
        request: CargoRequest,
    ) -> CraneResult<Cargo> {
        self.isolation
            .require(tenant, ResourceRef::MiniCluster(*mini_cluster_id))
            .await?;
        let mc = self.reservations.lock(mini_cluster_id).await?;
        let result = self.executor.submit(mc, request).await;
        self.checkpoint().await;
        result
    }

    pub async fn kill_cargo(&self, tenant: &TenantId, id: &CargoId) -> CraneResult<Cargo> {
        self.isolation.require(tenant, ResourceRef::Cargo(*id)).await?;
        let cargo = self.executor.kill(id).await?;
        self.checkpoint().await;
        Ok(cargo)
    }

    pub async fn reap_cargo(&self, tenant: &TenantId, id: &CargoId) -> CraneResult<Cargo> {
        self.isolation.require(tenant, ResourceRef::Cargo(*id)).await?;
        let cargo = self.executor.reap(id).await?;
        self.checkpoint().await;
        Ok(cargo)
    }

    pub async fn cargo_status(&self, tenant: &TenantId, id: &CargoId) -> CraneResult<Cargo> {
        self.isolation.require(tenant, ResourceRef::Cargo(*id)).await?;
        self.executor.get(id).await
    }

    /// Cargo of one mini-cluster, or every cargo of the tenant
    pub async fn list_cargoes(
        &self,
        tenant: &TenantId,
        mini_cluster_id: Option<&MiniClusterId>,
    ) -> CraneResult<Vec<Cargo>> {
        match mini_cluster_id {
            Some(id) => {
                self.isolation.require(tenant, ResourceRef::MiniCluster(*id)).await?;
                Ok(self.executor.list_in(id).await)
            }
            None => Ok(self.executor.list_for(tenant).await),
        }
    }

    // Leases

    pub async fn renew_lease(
        &self,
        tenant: &TenantId,
        id: &LeaseId,
        until: Option<DateTime<Utc>>,
    ) -> CraneResult<Lease> {
        self.isolation.require(tenant, ResourceRef::Lease(*id)).await?;
        let lease = self.leases.renew(id, until).await?;
        self.checkpoint().await;
        Ok(lease)
    }

    pub async fn tenant_view(&self, tenant: &TenantId) -> TenantView {
        self.isolation.tenant_view(tenant).await
    }

    /// Fail the cargo that depended on released leases and drop the leases
    /// from their mini-clusters. Returns the failed cargo and the closed
    /// mini-clusters.
    pub(crate) async fn cleanup_released_leases(
        &self,
        released: &[Lease],
        reason: FailureReason,
    ) -> (Vec<CargoId>, Vec<MiniClusterId>) {
        if released.is_empty() {
            return (Vec::new(), Vec::new());
        }
        let gone: HashSet<LeaseId> = released.iter().map(|l| l.id).collect();

        let mut failed = Vec::new();
        for cargo_id in self.executor.cargoes_on_leases(&gone).await {
            match self.executor.fail(&cargo_id, reason).await {
                Ok(Some(_)) => failed.push(cargo_id),
                Ok(None) => {}
                Err(e) => warn!(cargo_id = %cargo_id, error = %e, "Failed to fail dependent cargo"),
            }
        }

        let closed = self.reservations.on_leases_released(released).await;
        (failed, closed)
    }

    // State

    pub async fn snapshot(&self) -> ClusterSnapshot {
        let nodes = self
            .inventory
            .snapshot()
            .await
            .into_iter()
            .map(|v| v.node)
            .collect();
        ClusterSnapshot::new(
            nodes,
            self.leases.list().await,
            self.reservations.list().await,
            self.executor.list().await,
        )
    }

    /// Save a snapshot to the attached store, if any
    pub async fn persist(&self) -> CraneResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = self.snapshot().await;
        store.save(&snapshot).await
    }

    async fn checkpoint(&self) {
        if let Err(e) = self.persist().await {
            warn!(error = %e, "Failed to persist cluster snapshot");
        }
    }

    pub async fn status(&self) -> ClusterStatus {
        let views = self.inventory.snapshot().await;
        let live_leases = self
            .leases
            .list()
            .await
            .iter()
            .filter(|l| l.state != LeaseState::Released)
            .count();
        let active_mini_clusters = self
            .reservations
            .list()
            .await
            .iter()
            .filter(|mc| mc.state() != MiniClusterState::Released)
            .count();
        let live_cargoes = self.executor.list().await.iter().filter(|c| c.is_live()).count();

        ClusterStatus {
            nodes: views.len(),
            healthy_nodes: views
                .iter()
                .filter(|v| v.node.health == NodeHealth::Healthy)
                .count(),
            capacity: views.iter().map(|v| v.node.capacity).sum(),
            committed: views.iter().map(|v| v.committed).sum(),
            available: views.iter().map(|v| v.available).sum(),
            live_leases,
            active_mini_clusters,
            live_cargoes,
            substrate: self.executor.substrate().name().to_string(),
            last_event_seq: self.events.last_seq(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crane_core::{CargoState, LaunchSpec, ResourceClaim};
    use crane_runtime::InMemorySubstrate;
    use crane_store::MemoryStateStore;
    use std::collections::HashMap;
    use std::time::Duration;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            launch_timeout_secs: 1,
            liveness_poll_interval_ms: 10,
            kill_max_attempts: 2,
            kill_retry_initial_ms: 1,
            substrate_call_timeout_ms: 50,
            ..Default::default()
        }
    }

    async fn cluster(substrate: Arc<InMemorySubstrate>, nodes: &[(&str, u32)]) -> Scheduler {
        let scheduler = Scheduler::new(&test_config(), substrate, 256);
        for (id, gpus) in nodes {
            scheduler
                .register_node(NodeSpec::new(*id, ResourceVector::new(*gpus, 64, 1 << 34)))
                .await
                .unwrap();
        }
        scheduler
    }

    fn units(size: u32, gpus: u32) -> MiniClusterRequest {
        MiniClusterRequest::new(size, ResourceClaim::new(ResourceVector::gpus(gpus)))
    }

    fn job(gpus: u32) -> CargoRequest {
        CargoRequest::new(ResourceVector::gpus(gpus), LaunchSpec::command(["python", "train.py"]))
    }

    #[tokio::test]
    async fn test_two_gpu_mini_cluster_fits_two_single_gpu_cargoes() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let scheduler = cluster(substrate.clone(), &[("n1", 2)]).await;
        let tenant = TenantId::from("alice");

        let mc = scheduler
            .reserve_mini_cluster(&tenant, units(1, 2))
            .await
            .unwrap();

        let first = scheduler.submit_cargo(&tenant, &mc.id, job(1)).await.unwrap();
        let second = scheduler.submit_cargo(&tenant, &mc.id, job(1)).await.unwrap();
        assert_eq!(first.state(), CargoState::Running);
        assert_eq!(second.state(), CargoState::Running);

        let third = scheduler.submit_cargo(&tenant, &mc.id, job(1)).await;
        assert!(matches!(third, Err(CraneError::InsufficientCapacity(_))));

        scheduler.kill_cargo(&tenant, &first.id).await.unwrap();
        let fourth = scheduler.submit_cargo(&tenant, &mc.id, job(1)).await.unwrap();
        assert_eq!(fourth.state(), CargoState::Running);

        let status = scheduler.mini_cluster_status(&tenant, &mc.id).await.unwrap();
        assert_eq!(status.leased.gpu, 2);
        assert_eq!(status.in_use.gpu, 2);
        assert_eq!(status.cargo_count, 3);
    }

    #[tokio::test]
    async fn test_cross_tenant_access_is_denied() {
        let scheduler = cluster(Arc::new(InMemorySubstrate::new()), &[("n1", 4)]).await;
        let alice = TenantId::from("alice");
        let bob = TenantId::from("bob");

        let mc = scheduler.reserve_mini_cluster(&alice, units(1, 2)).await.unwrap();
        let cargo = scheduler.submit_cargo(&alice, &mc.id, job(1)).await.unwrap();

        assert!(matches!(
            scheduler.submit_cargo(&bob, &mc.id, job(1)).await,
            Err(CraneError::PermissionDenied(_))
        ));
        assert!(matches!(
            scheduler.kill_cargo(&bob, &cargo.id).await,
            Err(CraneError::PermissionDenied(_))
        ));
        assert!(matches!(
            scheduler.release_mini_cluster(&bob, &mc.id).await,
            Err(CraneError::PermissionDenied(_))
        ));
        assert!(matches!(
            scheduler.renew_lease(&bob, &mc.lease_ids[0], None).await,
            Err(CraneError::PermissionDenied(_))
        ));
        assert!(scheduler.list_mini_clusters(&bob).await.is_empty());

        let cargo = scheduler.cargo_status(&alice, &cargo.id).await.unwrap();
        assert_eq!(cargo.state(), CargoState::Running);
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let scheduler = cluster(substrate.clone(), &[("n1", 2)]).await;
        let tenant = TenantId::from("alice");
        let mc = scheduler.reserve_mini_cluster(&tenant, units(1, 2)).await.unwrap();
        let cargo = scheduler.submit_cargo(&tenant, &mc.id, job(2)).await.unwrap();

        let killed = scheduler.kill_cargo(&tenant, &cargo.id).await.unwrap();
        assert_eq!(killed.state(), CargoState::Killed);
        let again = scheduler.kill_cargo(&tenant, &cargo.id).await.unwrap();
        assert_eq!(again.state(), CargoState::Killed);
        assert_eq!(substrate.terminate_count(), 1);

        scheduler.reap_cargo(&tenant, &cargo.id).await.unwrap();
        assert!(matches!(
            scheduler.cargo_status(&tenant, &cargo.id).await,
            Err(CraneError::CargoNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_kill_converges_when_substrate_unresponsive() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let scheduler = cluster(substrate.clone(), &[("n1", 2)]).await;
        let tenant = TenantId::from("alice");
        let mc = scheduler.reserve_mini_cluster(&tenant, units(1, 2)).await.unwrap();
        let cargo = scheduler.submit_cargo(&tenant, &mc.id, job(1)).await.unwrap();
        let mut events = scheduler.subscribe();

        substrate.set_unresponsive(true);
        let killed = scheduler.kill_cargo(&tenant, &cargo.id).await.unwrap();
        assert_eq!(killed.state(), CargoState::Killed);

        let mut degraded = false;
        while let Ok(envelope) = events.try_recv() {
            if let ClusterEvent::DegradedTeardown { attempts, .. } = envelope.event {
                assert_eq!(attempts, 2);
                degraded = true;
            }
        }
        assert!(degraded);
    }

    #[tokio::test]
    async fn test_kill_converges_when_substrate_hangs() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let scheduler = cluster(substrate.clone(), &[("n1", 2)]).await;
        let tenant = TenantId::from("alice");
        let mc = scheduler.reserve_mini_cluster(&tenant, units(1, 2)).await.unwrap();
        let cargo = scheduler.submit_cargo(&tenant, &mc.id, job(1)).await.unwrap();
        let mut events = scheduler.subscribe();

        substrate.set_hung(true);
        let killed = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.kill_cargo(&tenant, &cargo.id),
        )
        .await
        .expect("kill stalled on a hung substrate")
        .unwrap();
        assert_eq!(killed.state(), CargoState::Killed);

        let mut degraded = false;
        while let Ok(envelope) = events.try_recv() {
            if let ClusterEvent::DegradedTeardown { attempts, owner, .. } = envelope.event {
                assert_eq!(attempts, 2);
                assert_eq!(owner, tenant);
                degraded = true;
            }
        }
        assert!(degraded);

        // Release still converges with the substrate stuck
        tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.release_mini_cluster(&tenant, &mc.id),
        )
        .await
        .expect("release stalled on a hung substrate")
        .unwrap();
        assert_eq!(scheduler.status().await.committed, ResourceVector::ZERO);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submits_never_exceed_leased_capacity() {
        let substrate = Arc::new(InMemorySubstrate::new());
        substrate.set_launch_delay(Some(Duration::from_millis(5))).await;
        let scheduler = Arc::new(cluster(substrate.clone(), &[("n1", 2), ("n2", 2)]).await);
        let tenant = TenantId::from("alice");
        let mc = scheduler.reserve_mini_cluster(&tenant, units(2, 2)).await.unwrap();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let scheduler = scheduler.clone();
                let tenant = tenant.clone();
                let id = mc.id;
                tokio::spawn(async move { scheduler.submit_cargo(&tenant, &id, job(1)).await })
            })
            .collect();

        let mut accepted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(cargo) => {
                    assert_eq!(cargo.state(), CargoState::Running);
                    accepted += 1;
                }
                Err(e) => assert!(matches!(e, CraneError::InsufficientCapacity(_))),
            }
        }
        assert_eq!(accepted, 4);

        let status = scheduler.mini_cluster_status(&tenant, &mc.id).await.unwrap();
        assert_eq!(status.leased.gpu, 4);
        assert_eq!(status.in_use.gpu, 4);

        // No lease slot is sub-claimed beyond its per-node capacity
        let mut per_lease: HashMap<LeaseId, u32> = HashMap::new();
        let cargoes = scheduler.list_cargoes(&tenant, Some(&mc.id)).await.unwrap();
        for cargo in cargoes.iter().filter(|c| c.is_live()) {
            for slice in &cargo.slices {
                *per_lease.entry(slice.lease_id).or_default() += slice.resources.gpu;
            }
        }
        assert!(per_lease.values().all(|gpus| *gpus <= 2));
    }

    #[tokio::test]
    async fn test_resize_respects_size_bounds() {
        let scheduler = cluster(Arc::new(InMemorySubstrate::new()), &[("n1", 8)]).await;
        let tenant = TenantId::from("alice");
        let mc = scheduler
            .reserve_mini_cluster(&tenant, units(3, 1).with_bounds(Some(2), Some(4)))
            .await
            .unwrap();

        assert!(matches!(
            scheduler.resize_mini_cluster(&tenant, &mc.id, 5).await,
            Err(CraneError::InvalidRequest(_))
        ));
        assert!(matches!(
            scheduler.resize_mini_cluster(&tenant, &mc.id, 1).await,
            Err(CraneError::InvalidRequest(_))
        ));
        let mc_after = scheduler.reservations().get(&mc.id).await.unwrap();
        assert_eq!(mc_after.current_size(), 3);
        assert!(mc_after.is_active());

        let grown = scheduler.resize_mini_cluster(&tenant, &mc.id, 4).await.unwrap();
        assert_eq!(grown, ResizeOutcome::new(4, 4));
        let shrunk = scheduler.resize_mini_cluster(&tenant, &mc.id, 2).await.unwrap();
        assert_eq!(shrunk, ResizeOutcome::new(2, 2));
    }

    #[tokio::test]
    async fn test_launch_timeout_frees_capacity() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let scheduler = cluster(substrate.clone(), &[("n1", 2)]).await;
        let tenant = TenantId::from("alice");
        let mc = scheduler.reserve_mini_cluster(&tenant, units(1, 2)).await.unwrap();

        substrate.set_launch_delay(Some(Duration::from_secs(5))).await;
        let result = scheduler.submit_cargo(&tenant, &mc.id, job(2)).await;
        assert!(matches!(result, Err(CraneError::LaunchTimeout(_))));

        let cargoes = scheduler.list_cargoes(&tenant, Some(&mc.id)).await.unwrap();
        assert_eq!(cargoes.len(), 1);
        assert_eq!(cargoes[0].state(), CargoState::Failed);
        assert_eq!(cargoes[0].failure, Some(FailureReason::LaunchTimeout));

        substrate.set_launch_delay(None).await;
        let retry = scheduler.submit_cargo(&tenant, &mc.id, job(2)).await.unwrap();
        assert_eq!(retry.state(), CargoState::Running);
    }

    #[tokio::test]
    async fn test_failed_launch_is_reported() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let scheduler = cluster(substrate.clone(), &[("n1", 2)]).await;
        let tenant = TenantId::from("alice");
        let mc = scheduler.reserve_mini_cluster(&tenant, units(1, 2)).await.unwrap();

        substrate.set_fail_launches(true);
        assert!(scheduler.submit_cargo(&tenant, &mc.id, job(1)).await.is_err());
        let cargoes = scheduler.list_cargoes(&tenant, None).await.unwrap();
        assert_eq!(cargoes[0].failure, Some(FailureReason::LaunchFailed));
        assert_eq!(scheduler.mini_cluster_status(&tenant, &mc.id).await.unwrap().in_use, ResourceVector::ZERO);
    }

    #[tokio::test]
    async fn test_resize_grows_partially_and_shrinks_with_cascade() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let scheduler = cluster(substrate.clone(), &[("n1", 1), ("n2", 1), ("n3", 1), ("n4", 1)]).await;
        let tenant = TenantId::from("alice");

        let mc = scheduler.reserve_mini_cluster(&tenant, units(3, 1)).await.unwrap();
        let outcome = scheduler.resize_mini_cluster(&tenant, &mc.id, 5).await.unwrap();
        assert_eq!(outcome, ResizeOutcome::new(5, 4));
        assert!(outcome.partial);

        let busy = scheduler.submit_cargo(&tenant, &mc.id, job(1)).await.unwrap();
        let outcome = scheduler.resize_mini_cluster(&tenant, &mc.id, 1).await.unwrap();
        assert_eq!(outcome, ResizeOutcome::new(1, 1));
        // The idle leases go first, so the busy cargo survives
        let cargo = scheduler.cargo_status(&tenant, &busy.id).await.unwrap();
        assert_eq!(cargo.state(), CargoState::Running);

        assert!(matches!(
            scheduler.resize_mini_cluster(&tenant, &mc.id, 0).await,
            Err(CraneError::InvalidRequest(_))
        ));

        let mc_after = scheduler.reservations().get(&mc.id).await.unwrap();
        assert_eq!(mc_after.state(), MiniClusterState::Active);
        assert_eq!(scheduler.status().await.committed.gpu, 1);
    }

    #[tokio::test]
    async fn test_release_cascades_and_is_idempotent() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let scheduler = cluster(substrate.clone(), &[("n1", 4)]).await;
        let tenant = TenantId::from("alice");
        let mc = scheduler.reserve_mini_cluster(&tenant, units(2, 2)).await.unwrap();
        let cargo = scheduler.submit_cargo(&tenant, &mc.id, job(3)).await.unwrap();
        assert_eq!(cargo.slices.len(), 2);

        scheduler.release_mini_cluster(&tenant, &mc.id).await.unwrap();
        scheduler.release_mini_cluster(&tenant, &mc.id).await.unwrap();

        let cargo = scheduler.cargo_status(&tenant, &cargo.id).await.unwrap();
        assert_eq!(cargo.state(), CargoState::Killed);
        assert_eq!(substrate.running_count().await, 0);
        let status = scheduler.status().await;
        assert_eq!(status.committed, ResourceVector::ZERO);
        assert_eq!(status.live_leases, 0);

        assert!(matches!(
            scheduler.submit_cargo(&tenant, &mc.id, job(1)).await,
            Err(CraneError::MiniClusterNotActive(_))
        ));
    }

    #[tokio::test]
    async fn test_deregister_busy_node_refused() {
        let scheduler = cluster(Arc::new(InMemorySubstrate::new()), &[("n1", 2)]).await;
        let tenant = TenantId::from("alice");
        let mc = scheduler.reserve_mini_cluster(&tenant, units(1, 1)).await.unwrap();

        let node = NodeId::from("n1");
        assert!(matches!(
            scheduler.deregister_node(&node).await,
            Err(CraneError::NodeBusy(_))
        ));
        scheduler.release_mini_cluster(&tenant, &mc.id).await.unwrap();
        scheduler.deregister_node(&node).await.unwrap();
        assert!(scheduler.nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_recover_restores_running_cargo() {
        let substrate = Arc::new(InMemorySubstrate::new());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let tenant = TenantId::from("alice");

        let (mc, running, lost) = {
            let scheduler = cluster(substrate.clone(), &[("n1", 4)])
                .await
                .with_store(store.clone());
            let mc = scheduler.reserve_mini_cluster(&tenant, units(1, 4)).await.unwrap();
            let running = scheduler.submit_cargo(&tenant, &mc.id, job(1)).await.unwrap();
            let lost = scheduler.submit_cargo(&tenant, &mc.id, job(1)).await.unwrap();
            scheduler.persist().await.unwrap();
            (mc, running, lost)
        };
        substrate.forget(lost.handle.as_deref().unwrap()).await;

        let recovered = Scheduler::recover(&test_config(), substrate.clone(), store, 256)
            .await
            .unwrap();

        let mc_after = recovered.reservations().get(&mc.id).await.unwrap();
        assert_eq!(mc_after.state(), MiniClusterState::Active);
        assert_eq!(recovered.status().await.committed.gpu, 4);

        let running = recovered.cargo_status(&tenant, &running.id).await.unwrap();
        assert_eq!(running.state(), CargoState::Running);
        let lost = recovered.cargo_status(&tenant, &lost.id).await.unwrap();
        assert_eq!(lost.failure, Some(FailureReason::SubstrateUntracked));

        let next = recovered.submit_cargo(&tenant, &mc.id, job(3)).await.unwrap();
        assert_eq!(next.state(), CargoState::Running);
    }

    #[tokio::test]
    async fn test_recover_rolls_back_half_built_reservation() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let tenant = TenantId::from("alice");

        let node = Node::new(NodeSpec::new("n1", ResourceVector::gpus(2)));
        let claim = ResourceClaim::new(ResourceVector::gpus(1));
        let lease = Lease::pending(tenant.clone(), claim.clone(), vec![node.id.clone()], Default::default());
        let mut mc = MiniCluster::new(tenant.clone(), MiniClusterRequest::new(2, claim));
        mc.lease_ids.push(lease.id);
        store
            .save(&ClusterSnapshot::new(vec![node], vec![lease.clone()], vec![mc.clone()], vec![]))
            .await
            .unwrap();

        let recovered = Scheduler::recover(
            &test_config(),
            Arc::new(InMemorySubstrate::new()),
            store.clone(),
            256,
        )
        .await
        .unwrap();

        let mc_after = recovered.reservations().get(&mc.id).await.unwrap();
        assert_eq!(mc_after.state(), MiniClusterState::Released);
        let lease_after = recovered.leases().get(&lease.id).await.unwrap();
        assert_eq!(lease_after.state, LeaseState::Released);
        assert_eq!(recovered.status().await.committed, ResourceVector::ZERO);
        assert!(store.load().await.unwrap().is_some());
    }
}

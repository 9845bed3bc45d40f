//! Background reconciliation loop
//!
//! Drives leases, mini-clusters and cargo towards what the cluster actually
//! looks like: node health, lease deadlines and substrate liveness. Every
//! override is logged and emitted as a `Reconciled` event.

use chrono::{DateTime, Utc};
use crane_core::{
    ClusterEvent, FailureReason, Lease, NodeHealth, NodeId, ReconcileConfig, ReconcileReason,
    ReleaseReason, TenantId,
};
use crane_network::{HealthProbe, ProbeTarget};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::scheduler::Scheduler;

/// What one pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub health_changes: usize,
    pub unreachable_nodes: Vec<NodeId>,
    pub leases_released: usize,
    pub cargoes_failed: usize,
    pub cargoes_settled: usize,
    pub mini_clusters_closed: usize,
    pub cargoes_reaped: usize,
    pub persisted: bool,
}

impl ReconcileReport {
    /// Whether the pass changed any state
    pub fn is_quiet(&self) -> bool {
        self.health_changes == 0
            && self.unreachable_nodes.is_empty()
            && self.leases_released == 0
            && self.cargoes_failed == 0
            && self.cargoes_settled == 0
            && self.mini_clusters_closed == 0
            && self.cargoes_reaped == 0
    }
}

pub struct Reconciler {
    scheduler: Arc<Scheduler>,
    probe: Arc<dyn HealthProbe>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(scheduler: Arc<Scheduler>, probe: Arc<dyn HealthProbe>, config: ReconcileConfig) -> Self {
        Self {
            scheduler,
            probe,
            config,
        }
    }

    fn reconciled(
        &self,
        reason: ReconcileReason,
        owner: Option<TenantId>,
        target: impl ToString,
        detail: impl Into<String>,
    ) {
        let target = target.to_string();
        let detail = detail.into();
        warn!(reason = ?reason, target = %target, detail = %detail, "Reconciled");
        self.scheduler.events().publish(ClusterEvent::Reconciled {
            reason,
            owner,
            target,
            detail,
        });
    }

    /// Run one reconciliation pass at `now`
    pub async fn reconcile_once(&self, now: DateTime<Utc>) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        self.apply_health(now, &mut report).await;
        self.reclaim_unreachable(now, &mut report).await;
        self.sweep_leases(now, &mut report).await;
        self.check_cargo(now, &mut report).await;
        self.collect_garbage(now, &mut report).await;

        report.persisted = match self.scheduler.persist().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to persist cluster snapshot");
                false
            }
        };

        if report.is_quiet() {
            debug!("Reconciliation pass found nothing to do");
        } else {
            info!(
                health_changes = report.health_changes,
                unreachable = report.unreachable_nodes.len(),
                leases_released = report.leases_released,
                cargoes_failed = report.cargoes_failed,
                cargoes_settled = report.cargoes_settled,
                mini_clusters_closed = report.mini_clusters_closed,
                cargoes_reaped = report.cargoes_reaped,
                "Reconciliation pass complete"
            );
        }
        report
    }

    async fn apply_health(&self, now: DateTime<Utc>, report: &mut ReconcileReport) {
        let inventory = self.scheduler.inventory();
        let targets: Vec<ProbeTarget> = inventory
            .snapshot()
            .await
            .into_iter()
            .map(|v| ProbeTarget::new(v.node.id, v.node.address))
            .collect();
        if targets.is_empty() {
            return;
        }

        for (node, health) in self.probe.probe(&targets).await {
            match inventory.set_health(&node, health, now).await {
                Ok(Some(previous)) => {
                    if health == NodeHealth::Unreachable {
                        warn!(node = %node, from = %previous, "Node unreachable");
                    } else {
                        info!(node = %node, from = %previous, to = %health, "Node health changed");
                    }
                    self.scheduler.events().publish(ClusterEvent::NodeHealthChanged {
                        node,
                        from: previous,
                        to: health,
                    });
                    report.health_changes += 1;
                }
                Ok(None) => {}
                // Deregistered while probing
                Err(e) => debug!(node = %node, error = %e, "Health result for unknown node"),
            }
        }
    }

    async fn reclaim_unreachable(&self, now: DateTime<Utc>, report: &mut ReconcileReport) {
        let grace = self.config.unreachable_grace();
        let leases = self.scheduler.leases();

        let mut released: Vec<Lease> = Vec::new();
        for view in self.scheduler.inventory().snapshot().await {
            let node = view.node;
            let overdue = node.health == NodeHealth::Unreachable
                && node
                    .health_changed_at
                    .checked_add_signed(grace)
                    .is_some_and(|until| until <= now);
            if !overdue || node.active_leases.is_empty() {
                continue;
            }

            report.unreachable_nodes.push(node.id.clone());
            for lease in leases.leases_on_node(&node.id).await {
                match leases.force_release(&lease.id, ReleaseReason::NodeUnreachable).await {
                    Ok(Some(lease)) => {
                        self.reconciled(
                            ReconcileReason::NodeUnreachable,
                            Some(lease.owner.clone()),
                            lease.id,
                            format!("node {} unreachable since {}", node.id, node.health_changed_at),
                        );
                        released.push(lease);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(lease_id = %lease.id, error = %e, "Force release failed"),
                }
            }
        }

        self.cleanup(&released, FailureReason::NodeUnreachable, report).await;
    }

    async fn sweep_leases(&self, now: DateTime<Utc>, report: &mut ReconcileReport) {
        let released = self.scheduler.leases().expire_sweep(now).await;
        for lease in &released {
            let reason = match lease.release_reason {
                Some(ReleaseReason::PendingTimeout) => ReconcileReason::PendingLeaseTimeout,
                _ => ReconcileReason::LeaseExpired,
            };
            self.reconciled(reason, Some(lease.owner.clone()), lease.id, "lease released by expiry sweep");
        }
        self.cleanup(&released, FailureReason::LeaseExpired, report).await;
    }

    async fn cleanup(&self, released: &[Lease], reason: FailureReason, report: &mut ReconcileReport) {
        if released.is_empty() {
            return;
        }
        report.leases_released += released.len();

        let (failed, closed) = self.scheduler.cleanup_released_leases(released, reason).await;
        for cargo_id in &failed {
            let owner = self.scheduler.executor().get(cargo_id).await.ok().map(|c| c.owner);
            self.reconciled(
                match reason {
                    FailureReason::NodeUnreachable => ReconcileReason::NodeUnreachable,
                    _ => ReconcileReason::LeaseExpired,
                },
                owner,
                cargo_id,
                format!("cargo failed: {}", reason),
            );
        }
        report.cargoes_failed += failed.len();
        report.mini_clusters_closed += closed.len();
        for id in closed {
            info!(mini_cluster_id = %id, "Mini-cluster closed after losing its last lease");
        }
    }

    async fn check_cargo(&self, now: DateTime<Utc>, report: &mut ReconcileReport) {
        let outcomes = self
            .scheduler
            .executor()
            .check_liveness(now, self.config.liveness_grace())
            .await;

        for outcome in &outcomes {
            let reason = match outcome.failure {
                Some(FailureReason::SubstrateUntracked) => ReconcileReason::SubstrateUntracked,
                Some(FailureReason::LivenessLost) => ReconcileReason::LivenessLost,
                _ => ReconcileReason::CargoExited,
            };
            let detail = match outcome.failure {
                Some(failure) => format!("{}: {}", outcome.state, failure),
                None => outcome.state.to_string(),
            };
            self.reconciled(reason, Some(outcome.owner.clone()), outcome.cargo_id, detail);
        }
        report.cargoes_settled += outcomes.len();
    }

    async fn collect_garbage(&self, now: DateTime<Utc>, report: &mut ReconcileReport) {
        let retention = self.config.retention();
        let reaped = self.scheduler.executor().gc(now, retention).await;
        report.cargoes_reaped += reaped.len();

        if let Some(cutoff) = now.checked_sub_signed(retention) {
            self.scheduler.reservations().prune(cutoff).await;
            let pruned = self.scheduler.leases().prune_released(cutoff).await;
            if pruned > 0 {
                debug!(count = pruned, "Pruned released leases");
            }
        }
    }

    /// Run passes on a fixed interval until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.config.interval().as_secs(), "Reconciliation loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reconcile_once(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Reconciliation loop stopped");
    }
}

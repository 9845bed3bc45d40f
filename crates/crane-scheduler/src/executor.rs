//! Cargo scheduler and executor
//!
//! Carves cargo sub-claims out of a mini-cluster's leases, hands them to the
//! substrate and tracks each cargo through its lifecycle. The sum of live
//! cargo slices on a lease never exceeds the lease's per-node capacity: the
//! capacity check and the insert of a Submitted cargo both happen under the
//! owning mini-cluster's lock.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use crane_core::{
    Cargo, CargoId, CargoRequest, CargoSlice, CargoState, ClusterEvent, CraneError, CraneResult,
    FailureReason, LeaseId, Lifecycle, MiniCluster, MiniClusterId, NodeId, ResourceVector,
    SchedulerConfig, TenantId,
};
use crane_runtime::{LaunchRequest, Substrate, UnitStatus};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::event_bus::EventBus;
use crate::lease_manager::LeaseManager;
use crate::retry::{retry_with_backoff, RetryConfig};

/// Unused capacity of one lease on one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FreeSlot {
    pub(crate) lease_id: LeaseId,
    pub(crate) node: NodeId,
    pub(crate) free: ResourceVector,
}

/// Split `claim` across free slots.
///
/// A claim that fits one slot goes to the tightest such slot. Otherwise it is
/// spread greedily, largest slots first, taking the per-dimension minimum of
/// what is left and what the slot offers. Returns `None` on aggregate
/// shortfall.
pub(crate) fn split_claim(claim: &ResourceVector, slots: &[FreeSlot]) -> Option<Vec<CargoSlice>> {
    let single = slots
        .iter()
        .filter(|s| claim.fits_within(&s.free))
        .min_by(|a, b| {
            let ka = (a.free.saturating_sub(claim).fit_key(), &a.node, a.lease_id);
            let kb = (b.free.saturating_sub(claim).fit_key(), &b.node, b.lease_id);
            ka.cmp(&kb)
        });
    if let Some(slot) = single {
        return Some(vec![CargoSlice {
            lease_id: slot.lease_id,
            node: slot.node.clone(),
            resources: *claim,
        }]);
    }

    let mut ordered: Vec<&FreeSlot> = slots.iter().collect();
    ordered.sort_by(|a, b| {
        b.free
            .fit_key()
            .cmp(&a.free.fit_key())
            .then_with(|| a.node.cmp(&b.node))
            .then_with(|| a.lease_id.cmp(&b.lease_id))
    });

    let mut remaining = *claim;
    let mut slices = Vec::new();
    for slot in ordered {
        if remaining.is_empty() {
            break;
        }
        let take = slot.free.min(&remaining);
        if take.is_empty() {
            continue;
        }
        remaining = remaining.saturating_sub(&take);
        slices.push(CargoSlice {
            lease_id: slot.lease_id,
            node: slot.node.clone(),
            resources: take,
        });
    }

    remaining.is_empty().then_some(slices)
}

/// Run a substrate call under `limit`. An elapsed call is reported as a
/// runtime error so retry loops treat it like any other failure.
async fn bounded<T, F>(limit: Duration, call: &str, handle: &str, fut: F) -> CraneResult<T>
where
    F: Future<Output = CraneResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CraneError::Runtime(format!(
            "{} of {} timed out after {}ms",
            call,
            handle,
            limit.as_millis()
        ))),
    }
}

/// Result of one liveness check that changed a cargo's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessOutcome {
    pub cargo_id: CargoId,
    pub owner: TenantId,
    pub state: CargoState,
    pub failure: Option<FailureReason>,
}

/// Launches cargo and owns their records
pub struct CargoExecutor {
    substrate: Arc<dyn Substrate>,
    leases: Arc<LeaseManager>,
    events: Arc<EventBus>,
    cargoes: RwLock<HashMap<CargoId, Cargo>>,
    launch_timeout: Duration,
    poll_interval: Duration,
    call_timeout: Duration,
    kill_retry: RetryConfig,
}

/// Apply a transition to a cargo record, returning the previous state
fn apply(
    cargo: &mut Cargo,
    next: CargoState,
    failure: Option<FailureReason>,
    exit_code: Option<i32>,
) -> CraneResult<CargoState> {
    let previous = cargo.history.transition(next)?;
    if failure.is_some() {
        cargo.failure = failure;
    }
    if exit_code.is_some() {
        cargo.exit_code = exit_code;
    }
    if next == CargoState::Running {
        cargo.last_liveness = Some(Utc::now());
    }
    Ok(previous)
}

impl CargoExecutor {
    pub fn new(
        substrate: Arc<dyn Substrate>,
        leases: Arc<LeaseManager>,
        events: Arc<EventBus>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            substrate,
            leases,
            events,
            cargoes: RwLock::new(HashMap::new()),
            launch_timeout: config.launch_timeout(),
            poll_interval: config.liveness_poll_interval().max(Duration::from_millis(1)),
            call_timeout: config.substrate_call_timeout().max(Duration::from_millis(1)),
            kill_retry: RetryConfig::bounded(config.kill_max_attempts, config.kill_retry_initial()),
        }
    }

    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    fn emit(&self, cargo: &Cargo, from: Option<CargoState>) {
        self.events.publish(ClusterEvent::CargoTransition {
            cargo_id: cargo.id,
            mini_cluster_id: cargo.mini_cluster_id,
            owner: cargo.owner.clone(),
            from,
            to: cargo.state(),
            failure: cargo.failure,
        });
    }

    async fn advance(
        &self,
        id: &CargoId,
        next: CargoState,
        failure: Option<FailureReason>,
        exit_code: Option<i32>,
    ) -> CraneResult<Cargo> {
        let (cargo, previous) = {
            let mut cargoes = self.cargoes.write().await;
            let cargo = cargoes
                .get_mut(id)
                .ok_or_else(|| CraneError::CargoNotFound(id.to_string()))?;
            let previous = apply(cargo, next, failure, exit_code)?;
            (cargo.clone(), previous)
        };

        match (next, failure) {
            (CargoState::Failed, Some(reason)) => {
                warn!(cargo_id = %id, from = %previous, reason = %reason, "Cargo failed")
            }
            _ => info!(cargo_id = %id, from = %previous, to = %next, "Cargo transition"),
        }
        self.emit(&cargo, Some(previous));
        if next.is_terminal() {
            self.discard(&cargo).await;
        }
        Ok(cargo)
    }

    async fn inspect_unit(&self, handle: &str, limit: Duration) -> CraneResult<UnitStatus> {
        bounded(limit, "inspect", handle, self.substrate.inspect(handle)).await
    }

    /// Drop the substrate's record of a finished cargo's unit
    async fn discard(&self, cargo: &Cargo) {
        let Some(handle) = &cargo.handle else {
            return;
        };
        let discarded = bounded(
            self.call_timeout,
            "discard",
            handle,
            self.substrate.discard(handle),
        )
        .await;
        if let Err(e) = discarded {
            warn!(cargo_id = %cargo.id, handle = %handle, error = %e, "Failed to discard unit record");
        }
    }

    /// Unused capacity of each (lease, node) slot of a mini-cluster
    async fn free_slots(&self, mc: &MiniCluster) -> Vec<FreeSlot> {
        let leases = self.leases.get_many(&mc.lease_ids).await;

        let mut used: HashMap<(LeaseId, NodeId), ResourceVector> = HashMap::new();
        {
            let cargoes = self.cargoes.read().await;
            for cargo in cargoes
                .values()
                .filter(|c| c.mini_cluster_id == mc.id && c.is_live())
            {
                for slice in &cargo.slices {
                    let entry = used
                        .entry((slice.lease_id, slice.node.clone()))
                        .or_insert(ResourceVector::ZERO);
                    *entry = *entry + slice.resources;
                }
            }
        }

        let mut slots = Vec::new();
        for lease in leases.into_iter().filter(|l| l.state.is_usable()) {
            let per_node = lease.per_node();
            for node in &lease.nodes {
                let taken = used
                    .get(&(lease.id, node.clone()))
                    .copied()
                    .unwrap_or(ResourceVector::ZERO);
                slots.push(FreeSlot {
                    lease_id: lease.id,
                    node: node.clone(),
                    free: per_node.saturating_sub(&taken),
                });
            }
        }
        slots
    }

    /// Submit a cargo into a locked mini-cluster and launch it.
    ///
    /// The lock is released once the cargo is recorded, before the substrate
    /// is called. Returns once the substrate reports the unit alive (or
    /// already finished); fails with `LaunchTimeout` if neither happens within
    /// the launch timeout.
    pub async fn submit(
        &self,
        mc: OwnedMutexGuard<MiniCluster>,
        request: CargoRequest,
    ) -> CraneResult<Cargo> {
        if !mc.is_active() {
            return Err(CraneError::MiniClusterNotActive(format!(
                "{} is {}",
                mc.id,
                mc.state()
            )));
        }
        if request.claim.is_empty() {
            return Err(CraneError::InvalidRequest(
                "cargo claim must request at least one resource".to_string(),
            ));
        }
        if request.launch.command.is_empty() && request.launch.image.is_empty() {
            return Err(CraneError::InvalidRequest(
                "launch spec needs an image or a command".to_string(),
            ));
        }

        let slots = self.free_slots(&mc).await;
        let claim = request.claim;
        let slices = split_claim(&claim, &slots).ok_or_else(|| {
            let free: ResourceVector = slots.iter().map(|s| s.free).sum();
            CraneError::InsufficientCapacity(format!(
                "mini-cluster {} has {} unused, cargo needs {}",
                mc.id, free, claim
            ))
        })?;

        let cargo = Cargo::new(mc.owner.clone(), mc.id, request, slices);
        let id = cargo.id;
        info!(
            cargo_id = %id,
            name = %cargo.name,
            mini_cluster_id = %mc.id,
            claim = %cargo.claim,
            nodes = ?cargo.nodes(),
            "Cargo submitted"
        );
        self.cargoes.write().await.insert(id, cargo.clone());
        self.emit(&cargo, None);
        drop(mc);

        self.launch(cargo).await
    }

    async fn launch(&self, cargo: Cargo) -> CraneResult<Cargo> {
        let id = cargo.id;
        let request = LaunchRequest {
            cargo_id: id,
            nodes: cargo.nodes(),
            slices: cargo.slices.clone(),
            spec: cargo.launch.clone(),
        };

        match self.advance(&id, CargoState::Launching, None, None).await {
            Ok(_) => {}
            // Killed before launch
            Err(CraneError::InvalidTransition { .. }) => return self.get(&id).await,
            Err(e) => return Err(e),
        }

        let deadline = Instant::now() + self.launch_timeout;
        let handle = match tokio::time::timeout(self.launch_timeout, self.substrate.launch(&request)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                error!(cargo_id = %id, error = %e, "Substrate rejected launch");
                self.settle_failure(&id, FailureReason::LaunchFailed).await;
                return Err(e);
            }
            Err(_) => {
                self.settle_failure(&id, FailureReason::LaunchTimeout).await;
                return Err(self.launch_timeout_error(&id));
            }
        };

        // Record the handle even if a kill raced the launch
        let still_launching = {
            let mut cargoes = self.cargoes.write().await;
            match cargoes.get_mut(&id) {
                Some(c) => {
                    c.handle = Some(handle.clone());
                    c.state() == CargoState::Launching
                }
                None => false,
            }
        };
        if !still_launching {
            debug!(cargo_id = %id, "Cargo left Launching during launch, stopping unit");
            let stopped = bounded(
                self.call_timeout,
                "terminate",
                &handle,
                self.substrate.terminate(&handle),
            )
            .await;
            if let Err(e) = stopped {
                warn!(cargo_id = %id, error = %e, "Terminate of raced launch failed");
            }
            let cargo = self.get(&id).await?;
            self.discard(&cargo).await;
            return Ok(cargo);
        }
        debug!(cargo_id = %id, handle = %handle, "Cargo handed to substrate");

        loop {
            let limit = self
                .call_timeout
                .min(deadline.saturating_duration_since(Instant::now()))
                .max(Duration::from_millis(1));
            let observed = match self.inspect_unit(&handle, limit).await {
                Ok(UnitStatus::Running) => Some((CargoState::Running, None, None)),
                Ok(UnitStatus::Exited(0)) => Some((CargoState::Succeeded, None, Some(0))),
                Ok(UnitStatus::Exited(code)) => Some((
                    CargoState::Failed,
                    Some(FailureReason::NonZeroExit { code }),
                    Some(code),
                )),
                Ok(UnitStatus::Unknown) => None,
                Err(e) => {
                    debug!(cargo_id = %id, error = %e, "Liveness poll failed");
                    None
                }
            };

            if let Some((next, failure, exit_code)) = observed {
                return match self.advance(&id, next, failure, exit_code).await {
                    Err(CraneError::InvalidTransition { .. }) => self.get(&id).await,
                    other => other,
                };
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(cargo_id = %id, handle = %handle, "No liveness signal before launch timeout");
                let stopped = bounded(
                    self.call_timeout,
                    "terminate",
                    &handle,
                    self.substrate.terminate(&handle),
                )
                .await;
                if let Err(e) = stopped {
                    warn!(cargo_id = %id, error = %e, "Terminate after launch timeout failed");
                }
                self.settle_failure(&id, FailureReason::LaunchTimeout).await;
                return Err(self.launch_timeout_error(&id));
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    fn launch_timeout_error(&self, id: &CargoId) -> CraneError {
        CraneError::LaunchTimeout(format!(
            "cargo {} not live within {}s",
            id,
            self.launch_timeout.as_secs_f64()
        ))
    }

    /// Fail a cargo unless something else already ended it
    async fn settle_failure(&self, id: &CargoId, reason: FailureReason) {
        match self.advance(id, CargoState::Failed, Some(reason), None).await {
            Ok(_) | Err(CraneError::InvalidTransition { .. }) => {}
            Err(e) => warn!(cargo_id = %id, error = %e, "Failed to record cargo failure"),
        }
    }

    /// Terminate a cargo's unit with bounded retry. Returns the error if the
    /// substrate never acknowledged.
    async fn terminate(&self, cargo: &Cargo) -> Result<(), CraneError> {
        let Some(handle) = cargo.handle.clone() else {
            return Ok(());
        };
        let substrate = self.substrate.clone();
        let limit = self.call_timeout;
        retry_with_backoff(&self.kill_retry, "terminate_cargo", || {
            let substrate = substrate.clone();
            let handle = handle.clone();
            async move { bounded(limit, "terminate", &handle, substrate.terminate(&handle)).await }
        })
        .await
    }

    /// Kill a cargo. Killing a finished cargo is a no-op.
    ///
    /// If the substrate never acknowledges, the cargo is still marked Killed
    /// and a degraded teardown is reported.
    pub async fn kill(&self, id: &CargoId) -> CraneResult<Cargo> {
        let cargo = self.get(id).await?;
        if !cargo.is_live() {
            return Ok(cargo);
        }

        info!(cargo_id = %id, state = %cargo.state(), "Killing cargo");
        if let Err(e) = self.terminate(&cargo).await {
            self.degraded(&cargo, &e);
        }

        match self.advance(id, CargoState::Killed, None, None).await {
            Err(CraneError::InvalidTransition { .. }) => self.get(id).await,
            other => other,
        }
    }

    /// Fail a live cargo on behalf of the reconciliation loop
    pub async fn fail(&self, id: &CargoId, reason: FailureReason) -> CraneResult<Option<Cargo>> {
        let cargo = self.get(id).await?;
        if !cargo.is_live() {
            return Ok(None);
        }
        if let Err(e) = self.terminate(&cargo).await {
            self.degraded(&cargo, &e);
        }
        match self.advance(id, CargoState::Failed, Some(reason), None).await {
            Ok(cargo) => Ok(Some(cargo)),
            Err(CraneError::InvalidTransition { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn degraded(&self, cargo: &Cargo, err: &CraneError) {
        let attempts = self.kill_retry.attempts();
        error!(
            cargo_id = %cargo.id,
            attempts = attempts,
            error = %err,
            "Substrate never acknowledged teardown, forcing terminal state"
        );
        self.events.publish(ClusterEvent::DegradedTeardown {
            cargo_id: cargo.id,
            owner: cargo.owner.clone(),
            attempts,
            error: err.to_string(),
        });
    }

    /// Remove a finished cargo's record
    pub async fn reap(&self, id: &CargoId) -> CraneResult<Cargo> {
        let (cargo, previous) = {
            let mut cargoes = self.cargoes.write().await;
            let cargo = cargoes
                .get_mut(id)
                .ok_or_else(|| CraneError::CargoNotFound(id.to_string()))?;
            let previous = apply(cargo, CargoState::Reaped, None, None)?;
            let cargo = cargo.clone();
            cargoes.remove(id);
            (cargo, previous)
        };
        debug!(cargo_id = %id, from = %previous, "Cargo reaped");
        self.emit(&cargo, Some(previous));
        Ok(cargo)
    }

    /// Reap finished cargo whose last transition is older than `retention`
    pub async fn gc(&self, now: DateTime<Utc>, retention: ChronoDuration) -> Vec<CargoId> {
        let cutoff = now - retention;
        let stale: Vec<CargoId> = self
            .cargoes
            .read()
            .await
            .values()
            .filter(|c| !c.is_live() && c.history.last_transition_at() <= cutoff)
            .map(|c| c.id)
            .collect();

        let mut reaped = Vec::with_capacity(stale.len());
        for id in stale {
            if self.reap(&id).await.is_ok() {
                reaped.push(id);
            }
        }
        reaped
    }

    /// Inspect every Running cargo and settle the ones that ended.
    ///
    /// A cargo whose substrate cannot be reached keeps running until
    /// `grace` has passed since its last liveness signal.
    pub async fn check_liveness(&self, now: DateTime<Utc>, grace: ChronoDuration) -> Vec<LivenessOutcome> {
        let running: Vec<(CargoId, TenantId, Option<String>, Option<DateTime<Utc>>)> = self
            .cargoes
            .read()
            .await
            .values()
            .filter(|c| c.state() == CargoState::Running)
            .map(|c| (c.id, c.owner.clone(), c.handle.clone(), c.last_liveness))
            .collect();

        let mut outcomes = Vec::new();
        for (id, owner, handle, last_liveness) in running {
            let status = match &handle {
                Some(h) => self.inspect_unit(h, self.call_timeout).await,
                None => Ok(UnitStatus::Unknown),
            };

            let settled = match status {
                Ok(UnitStatus::Running) => {
                    if let Some(c) = self.cargoes.write().await.get_mut(&id) {
                        c.last_liveness = Some(now);
                    }
                    None
                }
                Ok(UnitStatus::Exited(0)) => Some((CargoState::Succeeded, None, Some(0))),
                Ok(UnitStatus::Exited(code)) => Some((
                    CargoState::Failed,
                    Some(FailureReason::NonZeroExit { code }),
                    Some(code),
                )),
                Ok(UnitStatus::Unknown) => Some((
                    CargoState::Failed,
                    Some(FailureReason::SubstrateUntracked),
                    None,
                )),
                Err(e) => {
                    let lost = last_liveness
                        .and_then(|at| at.checked_add_signed(grace))
                        .map_or(true, |until| until <= now);
                    if lost {
                        warn!(cargo_id = %id, error = %e, "Liveness lost beyond grace");
                        if let Some(h) = &handle {
                            let stopped =
                                bounded(self.call_timeout, "terminate", h, self.substrate.terminate(h))
                                    .await;
                            if let Err(e) = stopped {
                                warn!(cargo_id = %id, error = %e, "Terminate of lost cargo failed");
                            }
                        }
                        Some((CargoState::Failed, Some(FailureReason::LivenessLost), None))
                    } else {
                        debug!(cargo_id = %id, error = %e, "Liveness check failed, within grace");
                        None
                    }
                }
            };

            if let Some((next, failure, exit_code)) = settled {
                if self.advance(&id, next, failure, exit_code).await.is_ok() {
                    outcomes.push(LivenessOutcome {
                        cargo_id: id,
                        owner,
                        state: next,
                        failure,
                    });
                }
            }
        }
        outcomes
    }

    /// Leases hosting live cargo of a mini-cluster
    pub async fn busy_leases(&self, mini_cluster_id: &MiniClusterId) -> HashSet<LeaseId> {
        self.cargoes
            .read()
            .await
            .values()
            .filter(|c| &c.mini_cluster_id == mini_cluster_id && c.is_live())
            .flat_map(|c| c.slices.iter().map(|s| s.lease_id))
            .collect()
    }

    /// Live cargo using any of `lease_ids`
    pub async fn cargoes_on_leases(&self, lease_ids: &HashSet<LeaseId>) -> Vec<CargoId> {
        self.cargoes
            .read()
            .await
            .values()
            .filter(|c| c.is_live() && c.slices.iter().any(|s| lease_ids.contains(&s.lease_id)))
            .map(|c| c.id)
            .collect()
    }

    pub async fn live_in(&self, mini_cluster_id: &MiniClusterId) -> Vec<CargoId> {
        self.cargoes
            .read()
            .await
            .values()
            .filter(|c| &c.mini_cluster_id == mini_cluster_id && c.is_live())
            .map(|c| c.id)
            .collect()
    }

    /// Capacity held by live cargo of a mini-cluster
    pub async fn in_use(&self, mini_cluster_id: &MiniClusterId) -> ResourceVector {
        self.cargoes
            .read()
            .await
            .values()
            .filter(|c| &c.mini_cluster_id == mini_cluster_id && c.is_live())
            .map(|c| c.claim)
            .sum()
    }

    pub async fn get(&self, id: &CargoId) -> CraneResult<Cargo> {
        self.cargoes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CraneError::CargoNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<Cargo> {
        let mut all: Vec<Cargo> = self.cargoes.read().await.values().cloned().collect();
        all.sort_by_key(|c| c.history.created_at());
        all
    }

    pub async fn list_for(&self, owner: &TenantId) -> Vec<Cargo> {
        let mut owned = self.list().await;
        owned.retain(|c| &c.owner == owner);
        owned
    }

    pub async fn list_in(&self, mini_cluster_id: &MiniClusterId) -> Vec<Cargo> {
        let mut cargoes = self.list().await;
        cargoes.retain(|c| &c.mini_cluster_id == mini_cluster_id);
        cargoes
    }

    /// Load cargo read from a snapshot and re-check each live one against
    /// the substrate. Returns the ids of cargo forced to a terminal state.
    pub async fn restore(&self, cargoes: Vec<Cargo>, live_leases: &HashSet<LeaseId>) -> Vec<CargoId> {
        let mut settled = Vec::new();

        for mut cargo in cargoes {
            if cargo.state() == CargoState::Reaped {
                continue;
            }
            let previous = cargo.state();

            if cargo.is_live() {
                let outcome = self.recover_one(&cargo, live_leases).await;
                if let Some((next, failure, exit_code)) = outcome {
                    if next == CargoState::Running && previous == CargoState::Running {
                        cargo.last_liveness = Some(Utc::now());
                    } else {
                        match apply(&mut cargo, next, failure, exit_code) {
                            Ok(_) => {
                                if cargo.state().is_terminal() {
                                    settled.push(cargo.id);
                                    self.discard(&cargo).await;
                                }
                                self.emit(&cargo, Some(previous));
                            }
                            Err(e) => {
                                warn!(cargo_id = %cargo.id, error = %e, "Failed to settle restored cargo")
                            }
                        }
                    }
                }
            }

            self.cargoes.write().await.insert(cargo.id, cargo);
        }

        if !settled.is_empty() {
            info!(count = settled.len(), "Settled interrupted cargo during recovery");
        }
        settled
    }

    async fn recover_one(
        &self,
        cargo: &Cargo,
        live_leases: &HashSet<LeaseId>,
    ) -> Option<(CargoState, Option<FailureReason>, Option<i32>)> {
        let interrupted = Some((CargoState::Failed, Some(FailureReason::Interrupted), None));

        if cargo.slices.iter().any(|s| !live_leases.contains(&s.lease_id)) {
            if let Err(e) = self.terminate(cargo).await {
                self.degraded(cargo, &e);
            }
            return interrupted;
        }

        let Some(handle) = &cargo.handle else {
            return interrupted;
        };

        match self.inspect_unit(handle, self.call_timeout).await {
            Ok(UnitStatus::Running) => Some((CargoState::Running, None, None)),
            Ok(UnitStatus::Exited(0)) => Some((CargoState::Succeeded, None, Some(0))),
            Ok(UnitStatus::Exited(code)) => Some((
                CargoState::Failed,
                Some(FailureReason::NonZeroExit { code }),
                Some(code),
            )),
            Ok(UnitStatus::Unknown) => Some((
                CargoState::Failed,
                Some(FailureReason::SubstrateUntracked),
                None,
            )),
            // Left to the liveness loop
            Err(_) if cargo.state() == CargoState::Running => None,
            Err(_) => interrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn slot(lease: LeaseId, node: &str, gpus: u32) -> FreeSlot {
        FreeSlot {
            lease_id: lease,
            node: NodeId::from(node),
            free: ResourceVector::gpus(gpus),
        }
    }

    #[test]
    fn test_split_prefers_single_tightest_slot() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let slots = vec![slot(a, "n1", 4), slot(b, "n2", 2)];

        let slices = split_claim(&ResourceVector::gpus(2), &slots).unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].lease_id, b);
        assert_eq!(slices[0].resources.gpu, 2);
    }

    #[test]
    fn test_split_spreads_across_slots() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let slots = vec![slot(a, "n1", 1), slot(b, "n2", 2), slot(c, "n3", 1)];

        let slices = split_claim(&ResourceVector::gpus(3), &slots).unwrap();
        let total: u32 = slices.iter().map(|s| s.resources.gpu).sum();
        assert_eq!(total, 3);
        assert_eq!(slices[0].lease_id, b);
        for s in &slices {
            let offered = slots.iter().find(|x| x.lease_id == s.lease_id).unwrap();
            assert!(s.resources.fits_within(&offered.free));
        }
    }

    #[test]
    fn test_split_shortfall() {
        let slots = vec![slot(Uuid::new_v4(), "n1", 1), slot(Uuid::new_v4(), "n2", 1)];
        assert!(split_claim(&ResourceVector::gpus(3), &slots).is_none());
        assert!(split_claim(&ResourceVector::gpus(1), &[]).is_none());
    }

    #[test]
    fn test_split_mixed_dimensions() {
        let a = FreeSlot {
            lease_id: Uuid::new_v4(),
            node: "n1".into(),
            free: ResourceVector::new(2, 4, 100),
        };
        let b = FreeSlot {
            lease_id: Uuid::new_v4(),
            node: "n2".into(),
            free: ResourceVector::new(0, 8, 100),
        };
        let claim = ResourceVector::new(2, 10, 150);
        let slices = split_claim(&claim, &[a, b]).unwrap();
        let total: ResourceVector = slices.iter().map(|s| s.resources).sum();
        assert_eq!(total, claim);
    }
}

//! Tenant isolation
//!
//! Every tenant-facing operation names a tenant and a target. Access is
//! granted only when the tenant owns the target and every lease the target
//! depends on. Anything the enforcer cannot verify is denied.

use crane_core::{
    Cargo, CargoId, CraneError, CraneResult, Lease, LeaseId, LeaseState, MiniCluster,
    MiniClusterId, TenantId,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::executor::CargoExecutor;
use crate::lease_manager::LeaseManager;
use crate::reservation::ReservationManager;

/// Object a tenant is acting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceRef {
    MiniCluster(MiniClusterId),
    Cargo(CargoId),
    Lease(LeaseId),
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceRef::MiniCluster(id) => write!(f, "mini-cluster {}", id),
            ResourceRef::Cargo(id) => write!(f, "cargo {}", id),
            ResourceRef::Lease(id) => write!(f, "lease {}", id),
        }
    }
}

/// Everything one tenant can see
#[derive(Debug, Clone, Serialize)]
pub struct TenantView {
    pub tenant: TenantId,
    pub mini_clusters: Vec<MiniCluster>,
    pub cargoes: Vec<Cargo>,
    pub leases: Vec<Lease>,
}

enum Lookup {
    Missing,
    Denied,
    Allowed,
}

pub struct IsolationEnforcer {
    reservations: Arc<ReservationManager>,
    executor: Arc<CargoExecutor>,
    leases: Arc<LeaseManager>,
}

impl IsolationEnforcer {
    pub fn new(
        reservations: Arc<ReservationManager>,
        executor: Arc<CargoExecutor>,
        leases: Arc<LeaseManager>,
    ) -> Self {
        Self {
            reservations,
            executor,
            leases,
        }
    }

    /// Whether `tenant` may act on `target`
    pub async fn authorize(&self, tenant: &TenantId, target: ResourceRef) -> bool {
        matches!(self.check(tenant, target).await, Lookup::Allowed)
    }

    /// Like [`authorize`](Self::authorize), as an error: a missing target is
    /// reported as not found, a foreign one as permission denied.
    pub async fn require(&self, tenant: &TenantId, target: ResourceRef) -> CraneResult<()> {
        match self.check(tenant, target).await {
            Lookup::Allowed => Ok(()),
            Lookup::Missing => Err(match target {
                ResourceRef::MiniCluster(id) => CraneError::MiniClusterNotFound(id.to_string()),
                ResourceRef::Cargo(id) => CraneError::CargoNotFound(id.to_string()),
                ResourceRef::Lease(id) => CraneError::LeaseNotFound(id.to_string()),
            }),
            Lookup::Denied => {
                warn!(tenant = %tenant, target = %target, "Cross-tenant access denied");
                Err(CraneError::PermissionDenied(format!(
                    "tenant {} may not access {}",
                    tenant, target
                )))
            }
        }
    }

    async fn check(&self, tenant: &TenantId, target: ResourceRef) -> Lookup {
        match target {
            ResourceRef::MiniCluster(id) => match self.reservations.get(&id).await {
                Ok(mc) if &mc.owner != tenant => Lookup::Denied,
                Ok(mc) => self.check_leases(tenant, &mc.lease_ids, false).await,
                Err(_) => Lookup::Missing,
            },
            ResourceRef::Cargo(id) => match self.executor.get(&id).await {
                Ok(cargo) if &cargo.owner != tenant => Lookup::Denied,
                Ok(cargo) => {
                    let parent = match self.reservations.get(&cargo.mini_cluster_id).await {
                        Ok(mc) => Some(mc),
                        // Only finished cargo may outlive their mini-cluster
                        Err(_) if !cargo.is_live() => None,
                        Err(_) => return Lookup::Denied,
                    };
                    if parent.is_some_and(|mc| &mc.owner != tenant) {
                        return Lookup::Denied;
                    }
                    let lease_ids: Vec<LeaseId> = cargo.slices.iter().map(|s| s.lease_id).collect();
                    self.check_leases(tenant, &lease_ids, !cargo.is_live()).await
                }
                Err(_) => Lookup::Missing,
            },
            ResourceRef::Lease(id) => match self.leases.get(&id).await {
                Ok(lease) if &lease.owner != tenant => Lookup::Denied,
                Ok(_) => Lookup::Allowed,
                Err(_) => Lookup::Missing,
            },
        }
    }

    /// Every listed lease must belong to `tenant`. Pruned leases are only
    /// tolerated when `allow_pruned` is set.
    async fn check_leases(&self, tenant: &TenantId, ids: &[LeaseId], allow_pruned: bool) -> Lookup {
        let found = self.leases.get_many(ids).await;
        if !allow_pruned && found.len() != ids.len() {
            return Lookup::Denied;
        }
        if found.iter().any(|l| &l.owner != tenant) {
            return Lookup::Denied;
        }
        Lookup::Allowed
    }

    /// Mini-clusters, cargo and live leases owned by `tenant`
    pub async fn tenant_view(&self, tenant: &TenantId) -> TenantView {
        let mut leases = self.leases.list_for(tenant).await;
        leases.retain(|l| l.state != LeaseState::Released);
        TenantView {
            tenant: tenant.clone(),
            mini_clusters: self.reservations.list_for(tenant).await,
            cargoes: self.executor.list_for(tenant).await,
            leases,
        }
    }
}

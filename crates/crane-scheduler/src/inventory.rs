//! Live resource inventory
//!
//! Each registered node lives in its own mutex-guarded slot. Writers that
//! touch several nodes lock the slots in ascending node-id order and hold
//! them across check-and-commit, so concurrent grants never oversubscribe a
//! node and never deadlock. Reads are public; writes are reachable only
//! through the lease manager and the reconciliation loop.

use chrono::{DateTime, Utc};
use crane_core::{CraneError, CraneResult, LeaseId, Node, NodeHealth, NodeId, NodeView, ResourceVector};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

/// Mutable state of one node
#[derive(Debug)]
pub(crate) struct NodeSlot {
    pub(crate) node: Node,
    /// Capacity held by pending, active and expiring leases
    pub(crate) committed: ResourceVector,
    /// Set once deregistered; lockers holding a stale Arc must skip the slot
    pub(crate) removed: bool,
}

impl NodeSlot {
    fn new(node: Node) -> Self {
        Self {
            node,
            committed: ResourceVector::ZERO,
            removed: false,
        }
    }

    pub(crate) fn available(&self) -> ResourceVector {
        self.node.capacity.saturating_sub(&self.committed)
    }

    pub(crate) fn view(&self) -> NodeView {
        NodeView {
            node: self.node.clone(),
            committed: self.committed,
            available: self.available(),
        }
    }

    /// Commit `amount` for a lease, refusing to exceed capacity
    pub(crate) fn commit(&mut self, lease_id: LeaseId, amount: ResourceVector) -> CraneResult<()> {
        let next = self
            .committed
            .checked_add(&amount)
            .filter(|c| c.fits_within(&self.node.capacity))
            .ok_or_else(|| {
                CraneError::InsufficientCapacity(format!(
                    "node {} has {} free, {} requested",
                    self.node.id,
                    self.available(),
                    amount
                ))
            })?;
        self.committed = next;
        self.node.active_leases.insert(lease_id);
        Ok(())
    }

    /// Return a lease's capacity; a lease not on this node is ignored
    pub(crate) fn uncommit(&mut self, lease_id: &LeaseId, amount: ResourceVector) -> bool {
        if !self.node.active_leases.remove(lease_id) {
            return false;
        }
        self.committed = self.committed.saturating_sub(&amount);
        true
    }
}

/// Registry of nodes and their committed capacity
#[derive(Default)]
pub struct Inventory {
    slots: RwLock<BTreeMap<NodeId, Arc<Mutex<NodeSlot>>>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, id: &NodeId) -> CraneResult<Arc<Mutex<NodeSlot>>> {
        self.slots
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CraneError::UnknownNode(id.to_string()))
    }

    /// Total capacity of a node
    pub async fn capacity_of(&self, id: &NodeId) -> CraneResult<ResourceVector> {
        Ok(self.view(id).await?.node.capacity)
    }

    /// Capacity held by live leases on a node
    pub async fn committed_of(&self, id: &NodeId) -> CraneResult<ResourceVector> {
        Ok(self.view(id).await?.committed)
    }

    /// `capacity - committed`
    pub async fn available(&self, id: &NodeId) -> CraneResult<ResourceVector> {
        Ok(self.view(id).await?.available)
    }

    pub async fn node(&self, id: &NodeId) -> CraneResult<Node> {
        Ok(self.view(id).await?.node)
    }

    pub async fn view(&self, id: &NodeId) -> CraneResult<NodeView> {
        let slot = self.slot(id).await?;
        let guard = slot.lock().await;
        if guard.removed {
            return Err(CraneError::UnknownNode(id.to_string()));
        }
        Ok(guard.view())
    }

    /// Cluster-wide read view, ascending by node id
    pub async fn snapshot(&self) -> Vec<NodeView> {
        let slots: Vec<_> = self.slots.read().await.values().cloned().collect();
        let mut views = Vec::with_capacity(slots.len());
        for slot in slots {
            let guard = slot.lock().await;
            if !guard.removed {
                views.push(guard.view());
            }
        }
        views
    }

    pub async fn node_ids(&self) -> Vec<NodeId> {
        self.slots.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    pub(crate) async fn register(&self, node: Node) -> CraneResult<()> {
        let mut slots = self.slots.write().await;
        if slots.contains_key(&node.id) {
            return Err(CraneError::NodeExists(node.id.to_string()));
        }
        info!(
            node = %node.id,
            capacity = %node.capacity,
            gpu_type = node.gpu_type.as_deref().unwrap_or("-"),
            "Node registered"
        );
        slots.insert(node.id.clone(), Arc::new(Mutex::new(NodeSlot::new(node))));
        Ok(())
    }

    /// Remove a node that hosts no live lease
    pub(crate) async fn deregister(&self, id: &NodeId) -> CraneResult<Node> {
        let slot = self.slot(id).await?;
        let node = {
            let mut guard = slot.lock().await;
            if guard.removed {
                return Err(CraneError::UnknownNode(id.to_string()));
            }
            if !guard.node.active_leases.is_empty() {
                return Err(CraneError::NodeBusy(format!(
                    "{} hosts {} active lease(s)",
                    id,
                    guard.node.active_leases.len()
                )));
            }
            guard.removed = true;
            guard.node.clone()
        };
        self.slots.write().await.remove(id);
        info!(node = %id, "Node deregistered");
        Ok(node)
    }

    /// Lock the slots of `ids` in ascending id order.
    ///
    /// Unregistered ids are skipped. Callers must not hold the lease map lock
    /// while waiting here.
    pub(crate) async fn lock_sorted(&self, ids: &[NodeId]) -> Vec<OwnedMutexGuard<NodeSlot>> {
        let mut wanted: Vec<&NodeId> = ids.iter().collect();
        wanted.sort();
        wanted.dedup();

        let slots: Vec<Arc<Mutex<NodeSlot>>> = {
            let map = self.slots.read().await;
            wanted.iter().filter_map(|id| map.get(*id).cloned()).collect()
        };

        let mut guards = Vec::with_capacity(slots.len());
        for slot in slots {
            let guard = slot.lock_owned().await;
            if !guard.removed {
                guards.push(guard);
            }
        }
        guards
    }

    /// Record a health observation. Returns the previous health when it changed.
    pub(crate) async fn set_health(
        &self,
        id: &NodeId,
        health: NodeHealth,
        at: DateTime<Utc>,
    ) -> CraneResult<Option<NodeHealth>> {
        let slot = self.slot(id).await?;
        let mut guard = slot.lock().await;
        if guard.removed {
            return Err(CraneError::UnknownNode(id.to_string()));
        }
        let previous = guard.node.health;
        if previous == health {
            return Ok(None);
        }
        guard.node.health = health;
        guard.node.health_changed_at = at;
        debug!(node = %id, from = %previous, to = %health, "Node health changed");
        Ok(Some(previous))
    }

    /// Re-insert a node read from a snapshot with no committed capacity
    pub(crate) async fn restore(&self, mut node: Node) -> CraneResult<()> {
        node.active_leases.clear();
        let mut slots = self.slots.write().await;
        if slots.contains_key(&node.id) {
            return Err(CraneError::NodeExists(node.id.to_string()));
        }
        slots.insert(node.id.clone(), Arc::new(Mutex::new(NodeSlot::new(node))));
        Ok(())
    }
}

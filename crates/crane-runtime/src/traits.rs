//! Substrate trait definitions

use async_trait::async_trait;
use crane_core::{CargoId, CargoSlice, CraneResult, LaunchSpec, NodeId};

/// Opaque handle returned by a substrate launch
pub type SubstrateHandle = String;

/// What the substrate knows about a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    /// Alive
    Running,
    /// Finished with an exit status
    Exited(i32),
    /// No record of the handle
    Unknown,
}

/// A launch scoped to a subset of leased node capacity
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub cargo_id: CargoId,
    /// Distinct nodes the unit spans, ascending
    pub nodes: Vec<NodeId>,
    /// Capacity the unit may use on each node
    pub slices: Vec<CargoSlice>,
    pub spec: LaunchSpec,
}

/// Clustered container runtime that starts, inspects and stops units
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Start a unit
    async fn launch(&self, request: &LaunchRequest) -> CraneResult<SubstrateHandle>;

    /// Report a unit's status
    async fn inspect(&self, handle: &str) -> CraneResult<UnitStatus>;

    /// Stop a unit. Stopping an unknown or exited unit succeeds.
    async fn terminate(&self, handle: &str) -> CraneResult<()>;

    /// Drop the record of a finished unit. Later inspects report `Unknown`.
    async fn discard(&self, handle: &str) -> CraneResult<()>;

    /// Get the substrate name
    fn name(&self) -> &'static str;
}

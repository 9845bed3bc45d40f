//! Cargo (bounded execution unit) types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::{LeaseId, Lifecycle, MiniClusterId, NodeId, ResourceVector, StateHistory, TenantId};

/// Cargo identifier
pub type CargoId = Uuid;

/// Cargo lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CargoState {
    /// Capacity accounted, not yet handed to the substrate
    Submitted,
    /// Launch requested, waiting for a liveness signal
    Launching,
    /// Substrate confirmed the unit is alive
    Running,
    /// Exited with status 0
    Succeeded,
    /// Exited abnormally, lost, or never started
    Failed,
    /// Terminated on request or by a cascading release
    Killed,
    /// Terminal record cleaned up
    Reaped,
}

impl CargoState {
    /// Whether the cargo still holds its sub-claim
    pub fn is_live(self) -> bool {
        matches!(
            self,
            CargoState::Submitted | CargoState::Launching | CargoState::Running
        )
    }
}

impl Lifecycle for CargoState {
    fn can_transition_to(self, next: Self) -> bool {
        use CargoState::*;
        matches!(
            (self, next),
            (Submitted, Launching)
                | (Submitted, Failed)
                | (Submitted, Killed)
                | (Launching, Running)
                | (Launching, Succeeded)
                | (Launching, Failed)
                | (Launching, Killed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Killed)
                | (Succeeded, Reaped)
                | (Failed, Reaped)
                | (Killed, Reaped)
        )
    }

    fn is_terminal(self) -> bool {
        !self.is_live()
    }
}

impl fmt::Display for CargoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CargoState::Submitted => write!(f, "Submitted"),
            CargoState::Launching => write!(f, "Launching"),
            CargoState::Running => write!(f, "Running"),
            CargoState::Succeeded => write!(f, "Succeeded"),
            CargoState::Failed => write!(f, "Failed"),
            CargoState::Killed => write!(f, "Killed"),
            CargoState::Reaped => write!(f, "Reaped"),
        }
    }
}

/// Why a cargo failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// Substrate rejected the launch
    LaunchFailed,
    /// No liveness signal within the launch timeout
    LaunchTimeout,
    /// Unit exited with a non-zero status
    NonZeroExit { code: i32 },
    /// Liveness signal lost beyond the grace window
    LivenessLost,
    /// Substrate no longer knows the unit
    SubstrateUntracked,
    /// Hosting node became unreachable
    NodeUnreachable,
    /// Backing lease expired
    LeaseExpired,
    /// Control plane restarted before the launch completed
    Interrupted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::LaunchFailed => write!(f, "LaunchFailed"),
            FailureReason::LaunchTimeout => write!(f, "LaunchTimeout"),
            FailureReason::NonZeroExit { code } => write!(f, "NonZeroExit({})", code),
            FailureReason::LivenessLost => write!(f, "LivenessLost"),
            FailureReason::SubstrateUntracked => write!(f, "SubstrateUntracked"),
            FailureReason::NodeUnreachable => write!(f, "NodeUnreachable"),
            FailureReason::LeaseExpired => write!(f, "LeaseExpired"),
            FailureReason::Interrupted => write!(f, "Interrupted"),
        }
    }
}

/// What to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Container image reference, interpreted by the substrate
    #[serde(default)]
    pub image: String,
    /// Command and arguments
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    pub fn command<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            image: String::new(),
            command: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
        }
    }
}

/// Request to run a cargo inside a mini-cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CargoRequest {
    #[serde(default)]
    pub name: Option<String>,
    /// Capacity the cargo needs out of the mini-cluster's leases
    pub claim: ResourceVector,
    pub launch: LaunchSpec,
}

impl CargoRequest {
    pub fn new(claim: ResourceVector, launch: LaunchSpec) -> Self {
        Self {
            name: None,
            claim,
            launch,
        }
    }
}

/// Part of a cargo's claim carved out of one lease on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CargoSlice {
    pub lease_id: LeaseId,
    pub node: NodeId,
    pub resources: ResourceVector,
}

/// A launched (or launching) execution unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cargo {
    pub id: CargoId,
    pub name: String,
    pub owner: TenantId,
    pub mini_cluster_id: MiniClusterId,
    pub claim: ResourceVector,
    pub launch: LaunchSpec,
    pub slices: Vec<CargoSlice>,
    /// Substrate handle once launched
    pub handle: Option<String>,
    pub history: StateHistory<CargoState>,
    pub failure: Option<FailureReason>,
    pub exit_code: Option<i32>,
    /// Last time the substrate reported the unit alive
    pub last_liveness: Option<DateTime<Utc>>,
}

impl Cargo {
    pub fn new(
        owner: TenantId,
        mini_cluster_id: MiniClusterId,
        request: CargoRequest,
        slices: Vec<CargoSlice>,
    ) -> Self {
        let id = Uuid::new_v4();
        let name = request
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("cargo-{}", &id.simple().to_string()[..8]));
        Self {
            id,
            name,
            owner,
            mini_cluster_id,
            claim: request.claim,
            launch: request.launch,
            slices,
            handle: None,
            history: StateHistory::new(CargoState::Submitted),
            failure: None,
            exit_code: None,
            last_liveness: None,
        }
    }

    pub fn state(&self) -> CargoState {
        self.history.current()
    }

    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    /// Distinct nodes the cargo runs on, ascending
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.slices.iter().map(|s| s.node.clone()).collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    pub fn uses_lease(&self, lease_id: &LeaseId) -> bool {
        self.slices.iter().any(|s| &s.lease_id == lease_id)
    }
}

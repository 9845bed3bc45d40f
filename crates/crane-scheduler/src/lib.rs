//! crane-scheduler: Resource scheduling and reservation engine for crane
//!
//! This crate owns the live cluster state:
//! - Resource inventory and best-fit lease placement
//! - Two-phase leases with expiry and renewal
//! - All-or-nothing mini-cluster reservations with elastic resize
//! - Cargo launch, liveness tracking and teardown
//! - Tenant isolation checks
//! - The background reconciliation loop

pub mod event_bus;
pub mod executor;
pub mod inventory;
pub mod isolation;
pub mod lease_manager;
pub mod placement;
pub mod reconcile;
pub mod reservation;
pub mod retry;
pub mod scheduler;

pub use event_bus::EventBus;
pub use executor::{CargoExecutor, LivenessOutcome};
pub use inventory::Inventory;
pub use isolation::{IsolationEnforcer, ResourceRef, TenantView};
pub use lease_manager::LeaseManager;
pub use placement::{BestFitPlacement, CandidateNode, PlacementDecision, PlacementStrategy};
pub use reconcile::{ReconcileReport, Reconciler};
pub use reservation::ReservationManager;
pub use retry::{retry_with_backoff, RetryConfig};
pub use scheduler::{ClusterStatus, Scheduler};

//! crane-network: Node health probing for crane
//!
//! Health probes classify registered nodes as healthy, suspect or
//! unreachable. The reconciliation loop consumes their reports.

pub mod health;

pub use health::{HealthProbe, HttpHealthProbe, ProbeTarget, StaticHealthProbe};

//! crane-store: Durable cluster state for crane
//!
//! The scheduler writes a snapshot of nodes, leases, mini-clusters and cargo
//! after every mutation pass and reads it back on startup.

pub mod snapshot;
pub mod store;

pub use snapshot::{ClusterSnapshot, SNAPSHOT_VERSION};
pub use store::{FileStateStore, MemoryStateStore, StateStore};

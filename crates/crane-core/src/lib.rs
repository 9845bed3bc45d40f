//! crane-core: Core types for the crane cluster manager
//!
//! This crate provides the fundamental types used throughout the crane system:
//! - Resource vectors, claims and placement constraints
//! - Nodes, leases, mini-clusters and cargo
//! - Lifecycle state history and transition events
//! - Configuration types
//! - Error handling

pub mod cargo;
pub mod config;
pub mod error;
pub mod event;
pub mod lease;
pub mod mini_cluster;
pub mod node;
pub mod resource;
pub mod state;
pub mod tenant;

pub use cargo::*;
pub use config::*;
pub use error::*;
pub use event::*;
pub use lease::*;
pub use mini_cluster::*;
pub use node::*;
pub use resource::*;
pub use state::*;
pub use tenant::*;

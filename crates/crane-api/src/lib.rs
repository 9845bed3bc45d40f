//! crane-api: REST API server for crane
//!
//! This crate provides the REST API for interacting with crane:
//! - Mini-cluster reservation, resize and release
//! - Cargo submission, kill and status
//! - Node registration and the cluster resource view
//! - Server-sent stream of state transitions

pub mod rest;

pub use rest::{create_router, AppState, Tenant, TENANT_HEADER};

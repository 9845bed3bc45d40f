//! crane-runtime: Container-launch substrate abstraction
//!
//! This crate provides substrate implementations for running cargo:
//! - Process-based substrate for single-host clusters
//! - In-memory substrate for dry runs and tests

pub mod memory;
pub mod process;
pub mod traits;

pub use memory::InMemorySubstrate;
pub use process::{ProcessSubstrate, ProcessSubstrateConfig};
pub use traits::{LaunchRequest, Substrate, SubstrateHandle, UnitStatus};

//! In-memory substrate
//!
//! Simulates units without running anything. Backs the daemon's dry-run mode
//! and lets scheduler tests script launch failures, exits and lost units.

use async_trait::async_trait;
use crane_core::{CraneError, CraneResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use crate::traits::{LaunchRequest, Substrate, SubstrateHandle, UnitStatus};

/// Exit status reported for terminated units (128 + SIGKILL)
pub const KILLED_EXIT_CODE: i32 = 137;

/// Substrate whose units live in a map
#[derive(Default)]
pub struct InMemorySubstrate {
    units: RwLock<HashMap<SubstrateHandle, UnitStatus>>,
    launch_delay: RwLock<Option<Duration>>,
    fail_launches: AtomicBool,
    unresponsive: AtomicBool,
    hung: AtomicBool,
    launches: AtomicU64,
    terminations: AtomicU64,
}

impl InMemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every launch call
    pub async fn set_launch_delay(&self, delay: Option<Duration>) {
        *self.launch_delay.write().await = delay;
    }

    /// Make launch calls fail
    pub fn set_fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    /// Make inspect and terminate calls fail
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    /// Make inspect and terminate calls never return
    pub fn set_hung(&self, hung: bool) {
        self.hung.store(hung, Ordering::SeqCst);
    }

    /// Units the substrate still has a record of
    pub async fn unit_count(&self) -> usize {
        self.units.read().await.len()
    }

    /// Mark a unit as exited
    pub async fn exit(&self, handle: &str, code: i32) {
        self.units
            .write()
            .await
            .insert(handle.to_string(), UnitStatus::Exited(code));
    }

    /// Drop a unit as if the substrate lost track of it
    pub async fn forget(&self, handle: &str) {
        self.units.write().await.remove(handle);
    }

    pub async fn status(&self, handle: &str) -> Option<UnitStatus> {
        self.units.read().await.get(handle).copied()
    }

    pub async fn running_count(&self) -> usize {
        self.units
            .read()
            .await
            .values()
            .filter(|s| **s == UnitStatus::Running)
            .count()
    }

    pub fn launch_count(&self) -> u64 {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn terminate_count(&self) -> u64 {
        self.terminations.load(Ordering::SeqCst)
    }

    async fn check_responsive(&self) -> CraneResult<()> {
        if self.hung.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.unresponsive.load(Ordering::SeqCst) {
            return Err(CraneError::Runtime("substrate unresponsive".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Substrate for InMemorySubstrate {
    async fn launch(&self, request: &LaunchRequest) -> CraneResult<SubstrateHandle> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(CraneError::Runtime("launch rejected".to_string()));
        }

        let delay = *self.launch_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let handle = format!("mem-{}", request.cargo_id);
        self.units
            .write()
            .await
            .insert(handle.clone(), UnitStatus::Running);
        debug!(handle = %handle, "Simulated unit started");
        Ok(handle)
    }

    async fn inspect(&self, handle: &str) -> CraneResult<UnitStatus> {
        self.check_responsive().await?;
        Ok(self
            .units
            .read()
            .await
            .get(handle)
            .copied()
            .unwrap_or(UnitStatus::Unknown))
    }

    async fn terminate(&self, handle: &str) -> CraneResult<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.check_responsive().await?;
        let mut units = self.units.write().await;
        if let Some(status) = units.get_mut(handle) {
            if *status == UnitStatus::Running {
                *status = UnitStatus::Exited(KILLED_EXIT_CODE);
            }
        }
        Ok(())
    }

    async fn discard(&self, handle: &str) -> CraneResult<()> {
        self.units.write().await.remove(handle);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crane_core::LaunchSpec;
    use uuid::Uuid;

    fn request() -> LaunchRequest {
        LaunchRequest {
            cargo_id: Uuid::new_v4(),
            nodes: vec!["n1".into()],
            slices: Vec::new(),
            spec: LaunchSpec::command(["train"]),
        }
    }

    #[tokio::test]
    async fn test_launch_and_terminate() {
        let substrate = InMemorySubstrate::new();
        let handle = substrate.launch(&request()).await.unwrap();
        assert_eq!(substrate.inspect(&handle).await.unwrap(), UnitStatus::Running);

        substrate.terminate(&handle).await.unwrap();
        assert_eq!(
            substrate.inspect(&handle).await.unwrap(),
            UnitStatus::Exited(KILLED_EXIT_CODE)
        );
        assert_eq!(substrate.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_forget_and_unresponsive() {
        let substrate = InMemorySubstrate::new();
        let handle = substrate.launch(&request()).await.unwrap();
        substrate.forget(&handle).await;
        assert_eq!(substrate.inspect(&handle).await.unwrap(), UnitStatus::Unknown);

        substrate.set_unresponsive(true);
        assert!(substrate.inspect(&handle).await.is_err());
        assert!(substrate.terminate(&handle).await.is_err());
    }

    #[tokio::test]
    async fn test_hung_calls_never_return() {
        let substrate = InMemorySubstrate::new();
        let handle = substrate.launch(&request()).await.unwrap();
        substrate.set_hung(true);
        let stalled =
            tokio::time::timeout(Duration::from_millis(20), substrate.terminate(&handle)).await;
        assert!(stalled.is_err());

        substrate.set_hung(false);
        substrate.discard(&handle).await.unwrap();
        assert_eq!(substrate.unit_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_launch_counts() {
        let substrate = InMemorySubstrate::new();
        substrate.set_fail_launches(true);
        assert!(substrate.launch(&request()).await.is_err());
        assert_eq!(substrate.launch_count(), 1);
    }
}

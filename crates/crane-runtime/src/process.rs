//! Process-based substrate implementation
//!
//! Runs every cargo as a local OS process. Used for single-host development
//! clusters where a clustered container runtime is not available.

use async_trait::async_trait;
use crane_core::{CraneError, CraneResult};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::traits::{LaunchRequest, Substrate, SubstrateHandle, UnitStatus};

/// Process-based substrate configuration
#[derive(Debug, Clone, Default)]
pub struct ProcessSubstrateConfig {
    /// Working directory for spawned processes
    pub work_dir: Option<PathBuf>,
    /// Environment added to every process
    pub extra_env: Vec<(String, String)>,
}

/// Substrate that manages cargo as child processes
pub struct ProcessSubstrate {
    config: ProcessSubstrateConfig,
    children: Mutex<HashMap<SubstrateHandle, Child>>,
}

impl ProcessSubstrate {
    /// Create a new process substrate
    pub fn new(config: ProcessSubstrateConfig) -> Self {
        Self {
            config,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Build the command to start a unit
    fn build_command(&self, request: &LaunchRequest) -> CraneResult<Command> {
        let (program, args) = request.spec.command.split_first().ok_or_else(|| {
            CraneError::InvalidRequest("launch spec has an empty command".to_string())
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.envs(&request.spec.env);

        let gpus: u32 = request.slices.iter().map(|s| s.resources.gpu).sum();
        let nodes: Vec<&str> = request.nodes.iter().map(|n| n.as_str()).collect();
        cmd.env("CRANE_CARGO_ID", request.cargo_id.to_string());
        cmd.env("CRANE_NODES", nodes.join(","));
        cmd.env("CRANE_GPU_COUNT", gpus.to_string());

        for (key, value) in &self.config.extra_env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.config.work_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);

        Ok(cmd)
    }
}

#[async_trait]
impl Substrate for ProcessSubstrate {
    async fn launch(&self, request: &LaunchRequest) -> CraneResult<SubstrateHandle> {
        info!(
            cargo_id = %request.cargo_id,
            nodes = ?request.nodes,
            "Starting cargo process"
        );

        let mut cmd = self.build_command(request)?;

        match cmd.spawn() {
            Ok(child) => {
                let handle = format!("proc-{}", request.cargo_id);
                debug!(
                    cargo_id = %request.cargo_id,
                    pid = child.id().unwrap_or(0),
                    "Cargo process spawned"
                );
                self.children.lock().await.insert(handle.clone(), child);
                Ok(handle)
            }
            Err(e) => {
                error!(
                    cargo_id = %request.cargo_id,
                    error = %e,
                    "Failed to spawn cargo process"
                );
                Err(CraneError::Runtime(format!("Failed to spawn cargo: {}", e)))
            }
        }
    }

    async fn inspect(&self, handle: &str) -> CraneResult<UnitStatus> {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(handle) else {
            return Ok(UnitStatus::Unknown);
        };

        match child.try_wait() {
            Ok(None) => Ok(UnitStatus::Running),
            // Killed by a signal: no exit code
            Ok(Some(status)) => Ok(UnitStatus::Exited(status.code().unwrap_or(-1))),
            Err(e) => Err(CraneError::Runtime(format!(
                "Failed to inspect {}: {}",
                handle, e
            ))),
        }
    }

    async fn terminate(&self, handle: &str) -> CraneResult<()> {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(handle) else {
            debug!(handle = handle, "Terminate on unknown handle");
            return Ok(());
        };

        if !matches!(child.try_wait(), Ok(Some(_))) {
            info!(handle = handle, pid = child.id().unwrap_or(0), "Stopping cargo process");
            child
                .start_kill()
                .map_err(|e| CraneError::Runtime(format!("Failed to stop {}: {}", handle, e)))?;
        }

        // tokio reaps the killed child once it is dropped
        children.remove(handle);
        Ok(())
    }

    async fn discard(&self, handle: &str) -> CraneResult<()> {
        if self.children.lock().await.remove(handle).is_some() {
            debug!(handle = handle, "Discarded cargo process record");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crane_core::LaunchSpec;
    use std::time::Duration;
    use uuid::Uuid;

    fn request(args: &[&str]) -> LaunchRequest {
        LaunchRequest {
            cargo_id: Uuid::new_v4(),
            nodes: vec!["n1".into()],
            slices: Vec::new(),
            spec: LaunchSpec::command(args.iter().copied()),
        }
    }

    async fn wait_for_exit(substrate: &ProcessSubstrate, handle: &str) -> UnitStatus {
        for _ in 0..100 {
            let status = substrate.inspect(handle).await.unwrap();
            if matches!(status, UnitStatus::Exited(_)) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        substrate.inspect(handle).await.unwrap()
    }

    #[test]
    fn test_empty_command_rejected() {
        let substrate = ProcessSubstrate::new(ProcessSubstrateConfig::default());
        assert!(substrate.build_command(&request(&[])).is_err());
        assert_eq!(substrate.name(), "process");
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let substrate = ProcessSubstrate::new(ProcessSubstrateConfig::default());
        assert_eq!(
            substrate.inspect("proc-missing").await.unwrap(),
            UnitStatus::Unknown
        );
        assert!(substrate.terminate("proc-missing").await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_status() {
        let substrate = ProcessSubstrate::new(ProcessSubstrateConfig::default());
        let handle = substrate.launch(&request(&["sh", "-c", "exit 3"])).await.unwrap();
        assert_eq!(wait_for_exit(&substrate, &handle).await, UnitStatus::Exited(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_running_process() {
        let substrate = ProcessSubstrate::new(ProcessSubstrateConfig::default());
        let handle = substrate.launch(&request(&["sleep", "30"])).await.unwrap();
        assert_eq!(substrate.inspect(&handle).await.unwrap(), UnitStatus::Running);

        substrate.terminate(&handle).await.unwrap();
        assert_eq!(substrate.inspect(&handle).await.unwrap(), UnitStatus::Unknown);
        assert!(substrate.children.lock().await.is_empty());
        assert!(substrate.terminate(&handle).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_finished_units_are_not_retained() {
        let substrate = ProcessSubstrate::new(ProcessSubstrateConfig::default());
        let mut handles = Vec::new();
        for _ in 0..20 {
            handles.push(substrate.launch(&request(&["true"])).await.unwrap());
        }
        for handle in &handles {
            assert_eq!(wait_for_exit(&substrate, handle).await, UnitStatus::Exited(0));
        }

        for (i, handle) in handles.iter().enumerate() {
            if i % 2 == 0 {
                substrate.terminate(handle).await.unwrap();
            } else {
                substrate.discard(handle).await.unwrap();
            }
        }
        assert!(substrate.children.lock().await.is_empty());
    }
}

//! Configuration types for crane

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::NodeSpec;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Lease and cargo scheduling configuration
    pub scheduler: SchedulerConfig,
    /// Reconciliation loop configuration
    pub reconcile: ReconcileConfig,
    /// Container-launch substrate configuration
    pub runtime: RuntimeConfig,
    /// Node health probing configuration
    pub network: NetworkConfig,
    /// Durable state configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Nodes registered at startup
    pub nodes: Vec<NodeSpec>,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::CraneError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::CraneError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::CraneError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub rest_address: String,
    /// Port for the REST API server
    pub rest_port: u16,
    /// Enable CORS
    pub cors_enabled: bool,
    /// Allowed CORS origins
    pub cors_origins: Vec<String>,
    /// Events buffered per event-stream subscriber
    pub event_buffer: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            rest_address: "0.0.0.0".to_string(),
            rest_port: 9090,
            cors_enabled: true,
            cors_origins: vec!["*".to_string()],
            event_buffer: 1024,
        }
    }
}

/// Lease and cargo scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Pending leases not confirmed within this window are released
    pub pending_timeout_secs: u64,
    /// Expired leases may still be renewed during this window
    pub expiry_grace_secs: u64,
    /// Bound on launch plus liveness confirmation
    pub launch_timeout_secs: u64,
    /// Interval between liveness polls while launching
    pub liveness_poll_interval_ms: u64,
    /// Terminate attempts before a teardown is forced
    pub kill_max_attempts: u32,
    /// Initial delay between terminate attempts
    pub kill_retry_initial_ms: u64,
    /// Bound on a single inspect or terminate call
    pub substrate_call_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pending_timeout_secs: 60,
            expiry_grace_secs: 30,
            launch_timeout_secs: 30,
            liveness_poll_interval_ms: 200,
            kill_max_attempts: 3,
            kill_retry_initial_ms: 100,
            substrate_call_timeout_ms: 5000,
        }
    }
}

impl SchedulerConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    pub fn liveness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_interval_ms)
    }

    pub fn kill_retry_initial(&self) -> Duration {
        Duration::from_millis(self.kill_retry_initial_ms)
    }

    pub fn substrate_call_timeout(&self) -> Duration {
        Duration::from_millis(self.substrate_call_timeout_ms)
    }
}

/// Reconciliation loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Fixed interval between passes
    pub interval_secs: u64,
    /// How long a node may stay unreachable before its leases are reclaimed
    pub unreachable_grace_secs: u64,
    /// How long a running cargo may go without a liveness signal
    pub liveness_grace_secs: u64,
    /// Terminal cargo and released mini-clusters are kept this long
    pub retention_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            unreachable_grace_secs: 60,
            liveness_grace_secs: 30,
            retention_secs: 3600,
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn unreachable_grace(&self) -> chrono::Duration {
        window(self.unreachable_grace_secs)
    }

    pub fn liveness_grace(&self) -> chrono::Duration {
        window(self.liveness_grace_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        window(self.retention_secs)
    }
}

/// Seconds as a wall-clock window, capped at 100 years
fn window(secs: u64) -> chrono::Duration {
    const MAX_SECS: i64 = 100 * 365 * 24 * 3600;
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(MAX_SECS).min(MAX_SECS))
}

/// Container-launch substrate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Substrate implementation
    pub substrate: SubstrateType,
    /// Working directory for process-based units
    pub work_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            substrate: SubstrateType::Process,
            work_dir: None,
        }
    }
}

/// Substrate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubstrateType {
    /// Units are local OS processes
    Process,
    /// Units are simulated in memory (dry-run)
    Memory,
}

/// Node health probing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Path probed on each node agent
    pub health_path: String,
    /// Probe timeout in seconds
    pub health_check_timeout_secs: u64,
    /// Consecutive failures before a node is unreachable
    pub failure_threshold: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            health_path: "/health".to_string(),
            health_check_timeout_secs: 5,
            failure_threshold: 3,
        }
    }
}

/// Durable state configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Snapshot file path
    pub state_path: PathBuf,
    /// Persist snapshots at all
    pub persist: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("/var/lib/crane/state.json"),
            persist: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
    /// Log file path (if any)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.api.rest_port, 9090);
        assert_eq!(config.scheduler.kill_max_attempts, 3);
        assert_eq!(config.runtime.substrate, SubstrateType::Process);
        assert!(config.nodes.is_empty());
    }

    #[test]
    fn test_partial_config_parse() {
        let toml_str = r#"
[api]
rest_port = 8000

[reconcile]
interval_secs = 2
unreachable_grace_secs = 10

[runtime]
substrate = "memory"

[[nodes]]
id = "gpu-01"
gpu_type = "a100"
capacity = { gpu = 8, cpu = 64, memory = 549755813888 }

[[nodes]]
id = "gpu-02"
address = "http://10.0.0.2:7000"
capacity = { gpu = 4 }
"#;
        let config: DaemonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.api.rest_port, 8000);
        assert_eq!(config.api.rest_address, "0.0.0.0");
        assert_eq!(config.reconcile.interval_secs, 2);
        assert_eq!(config.reconcile.liveness_grace_secs, 30);
        assert_eq!(config.runtime.substrate, SubstrateType::Memory);
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].capacity.gpu, 8);
        assert_eq!(config.nodes[1].capacity.cpu, 0);
        assert_eq!(
            config.nodes[1].address.as_deref(),
            Some("http://10.0.0.2:7000")
        );
    }
}

//! Health probing for nodes

use async_trait::async_trait;
use futures::future::join_all;
use crane_core::{CraneError, CraneResult, NetworkConfig, NodeHealth, NodeId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// A node to probe and the agent address to reach it at
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub node: NodeId,
    pub address: Option<String>,
}

impl ProbeTarget {
    pub fn new(node: NodeId, address: Option<String>) -> Self {
        Self { node, address }
    }
}

/// Source of node health observations
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe every target and report its health
    async fn probe(&self, targets: &[ProbeTarget]) -> HashMap<NodeId, NodeHealth>;
}

/// Probes node agents over HTTP
///
/// One failed probe marks a node suspect. `failure_threshold` consecutive
/// failures mark it unreachable. Nodes without an address are never probed
/// and always report healthy.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    health_path: String,
    timeout: Duration,
    failure_threshold: u32,
    failures: RwLock<HashMap<NodeId, u32>>,
}

impl HttpHealthProbe {
    /// Create a new health probe
    pub fn new(config: &NetworkConfig) -> CraneResult<Self> {
        let timeout = Duration::from_secs(config.health_check_timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CraneError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            health_path: config.health_path.clone(),
            timeout,
            failure_threshold: config.failure_threshold.max(1),
            failures: RwLock::new(HashMap::new()),
        })
    }

    /// Check one node agent
    async fn check(&self, address: &str) -> bool {
        let url = format!("{}{}", address.trim_end_matches('/'), self.health_path);

        match self.client.get(&url).send().await {
            Ok(response) => {
                let healthy = response.status().is_success();
                if healthy {
                    debug!(endpoint = %url, "Health check passed");
                } else {
                    warn!(
                        endpoint = %url,
                        status = %response.status(),
                        "Health check failed"
                    );
                }
                healthy
            }
            Err(e) => {
                warn!(
                    endpoint = %url,
                    error = %e,
                    "Health check error"
                );
                false
            }
        }
    }

    /// Fold one probe result into the failure count
    async fn record(&self, node: &NodeId, passed: bool) -> NodeHealth {
        let mut failures = self.failures.write().await;
        if passed {
            failures.remove(node);
            return NodeHealth::Healthy;
        }
        let count = failures.entry(node.clone()).or_insert(0);
        *count = count.saturating_add(1);
        classify(*count, self.failure_threshold)
    }

    /// Get the timeout duration
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn classify(failures: u32, threshold: u32) -> NodeHealth {
    match failures {
        0 => NodeHealth::Healthy,
        n if n >= threshold => NodeHealth::Unreachable,
        _ => NodeHealth::Suspect,
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, targets: &[ProbeTarget]) -> HashMap<NodeId, NodeHealth> {
        let checks = targets.iter().map(|target| async move {
            let passed = match &target.address {
                Some(address) => self.check(address).await,
                None => true,
            };
            (target.node.clone(), passed)
        });

        let mut report = HashMap::with_capacity(targets.len());
        for (node, passed) in join_all(checks).await {
            let health = self.record(&node, passed).await;
            report.insert(node, health);
        }

        // Forget counters for nodes no longer registered
        let mut failures = self.failures.write().await;
        failures.retain(|node, _| report.contains_key(node));

        report
    }
}

/// Probe reporting whatever health was last set; unset nodes are healthy
#[derive(Default)]
pub struct StaticHealthProbe {
    health: RwLock<HashMap<NodeId, NodeHealth>>,
}

impl StaticHealthProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, node: impl Into<NodeId>, health: NodeHealth) {
        self.health.write().await.insert(node.into(), health);
    }
}

#[async_trait]
impl HealthProbe for StaticHealthProbe {
    async fn probe(&self, targets: &[ProbeTarget]) -> HashMap<NodeId, NodeHealth> {
        let health = self.health.read().await;
        targets
            .iter()
            .map(|t| {
                let h = health.get(&t.node).copied().unwrap_or(NodeHealth::Healthy);
                (t.node.clone(), h)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32) -> NetworkConfig {
        NetworkConfig {
            health_path: "/health".to_string(),
            health_check_timeout_secs: 1,
            failure_threshold: threshold,
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(0, 3), NodeHealth::Healthy);
        assert_eq!(classify(1, 3), NodeHealth::Suspect);
        assert_eq!(classify(2, 3), NodeHealth::Suspect);
        assert_eq!(classify(3, 3), NodeHealth::Unreachable);
        assert_eq!(classify(1, 1), NodeHealth::Unreachable);
    }

    #[test]
    fn test_probe_creation() {
        let probe = HttpHealthProbe::new(&config(3)).unwrap();
        assert_eq!(probe.timeout(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_failure_counting() {
        let probe = HttpHealthProbe::new(&config(2)).unwrap();
        let node = NodeId::from("n1");

        assert_eq!(probe.record(&node, false).await, NodeHealth::Suspect);
        assert_eq!(probe.record(&node, false).await, NodeHealth::Unreachable);
        assert_eq!(probe.record(&node, true).await, NodeHealth::Healthy);
        assert_eq!(probe.record(&node, false).await, NodeHealth::Suspect);
    }

    #[tokio::test]
    async fn test_addressless_nodes_are_healthy() {
        let probe = HttpHealthProbe::new(&config(1)).unwrap();
        let report = probe
            .probe(&[ProbeTarget::new("n1".into(), None)])
            .await;
        assert_eq!(report[&NodeId::from("n1")], NodeHealth::Healthy);
    }

    #[tokio::test]
    async fn test_unreachable_address() {
        let probe = HttpHealthProbe::new(&config(1)).unwrap();
        // Port 9 on localhost refuses connections
        let target = ProbeTarget::new("n1".into(), Some("http://127.0.0.1:9".to_string()));
        let report = probe.probe(&[target]).await;
        assert_eq!(report[&NodeId::from("n1")], NodeHealth::Unreachable);
    }

    #[tokio::test]
    async fn test_static_probe() {
        let probe = StaticHealthProbe::new();
        probe.set("n2", NodeHealth::Unreachable).await;

        let report = probe
            .probe(&[
                ProbeTarget::new("n1".into(), None),
                ProbeTarget::new("n2".into(), None),
            ])
            .await;
        assert_eq!(report[&NodeId::from("n1")], NodeHealth::Healthy);
        assert_eq!(report[&NodeId::from("n2")], NodeHealth::Unreachable);
    }
}

//! CLI commands implementation

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use crane_core::{
    Cargo, CargoRequest, ExpiryPolicy, LaunchSpec, Lease, MiniCluster, MiniClusterStatus,
    NodeSpec, NodeView, PlacementConstraints, ResizeOutcome, ResourceClaim, ResourceVector,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

const TENANT_HEADER: &str = "x-crane-tenant";

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    tenant: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str, tenant: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            tenant: tenant.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(self.url(path))
            .header(TENANT_HEADER, &self.tenant)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(path))
            .header(TENANT_HEADER, &self.tenant)
    }

    fn delete(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .delete(self.url(path))
            .header(TENANT_HEADER, &self.tenant)
    }
}

/// Fail with the server's message unless the response succeeded
async fn check(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error = response.text().await.unwrap_or_default();
    bail!("Failed to {}: {} {}", action, status, error)
}

/// Placement flags for a reservation
pub struct Placement {
    pub gpu_type: Option<String>,
    pub span: u32,
    pub anti_affinity: bool,
    pub co_locate: bool,
}

/// Target size and optional bounds of a reservation
pub struct Sizes {
    pub target: u32,
    pub min: Option<u32>,
    pub max: Option<u32>,
}

/// Status response
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub cluster: ClusterStatus,
}

#[derive(Debug, Deserialize)]
pub struct ClusterStatus {
    pub nodes: usize,
    pub healthy_nodes: usize,
    pub capacity: ResourceVector,
    pub committed: ResourceVector,
    pub available: ResourceVector,
    pub live_leases: usize,
    pub active_mini_clusters: usize,
    pub live_cargoes: usize,
    pub substrate: String,
}

/// Reserve a mini-cluster
pub async fn reserve(
    client: &ApiClient,
    sizes: Sizes,
    resources: ResourceVector,
    placement: Placement,
    ttl: Option<u64>,
    name: Option<String>,
) -> Result<()> {
    #[derive(Serialize)]
    struct ReserveRequest {
        name: Option<String>,
        size: u32,
        min_size: Option<u32>,
        max_size: Option<u32>,
        per_unit: ResourceClaim,
        expiry: ExpiryPolicy,
    }

    let mut per_unit = ResourceClaim::new(resources)
        .spanning(placement.span)
        .with_constraints(PlacementConstraints {
            anti_affinity: placement.anti_affinity,
            co_locate: placement.co_locate,
            ..Default::default()
        });
    if let Some(gpu_type) = placement.gpu_type {
        per_unit = per_unit.with_gpu_type(gpu_type);
    }

    let req = ReserveRequest {
        name,
        size: sizes.target,
        min_size: sizes.min,
        max_size: sizes.max,
        per_unit,
        expiry: ttl.map_or(ExpiryPolicy::None, |ttl_secs| ExpiryPolicy::Heartbeat { ttl_secs }),
    };

    let response = client.post("/api/v1/mini_clusters").json(&req).send().await?;
    let mc: MiniCluster = check(response, "reserve mini-cluster").await?.json().await?;

    println!("Mini-cluster '{}' reserved", mc.name);
    println!("  ID: {}", mc.id);
    println!("  Units: {}", mc.current_size());
    println!("  Per unit: {}", mc.per_unit_claim.resources);
    Ok(())
}

/// Resize a mini-cluster
pub async fn resize(client: &ApiClient, mini_cluster: String, size: u32) -> Result<()> {
    let id = resolve_mini_cluster(client, &mini_cluster).await?;

    #[derive(Serialize)]
    struct ResizeRequest {
        size: u32,
    }

    let response = client
        .post(&format!("/api/v1/mini_clusters/{}/resize", id))
        .json(&ResizeRequest { size })
        .send()
        .await?;
    let outcome: ResizeOutcome = check(response, "resize mini-cluster").await?.json().await?;

    if outcome.partial {
        println!(
            "Mini-cluster '{}' resized to {} of {} requested units",
            mini_cluster, outcome.actual, outcome.requested
        );
    } else {
        println!("Mini-cluster '{}' resized to {} units", mini_cluster, outcome.actual);
    }
    Ok(())
}

/// Release a mini-cluster
pub async fn release(client: &ApiClient, mini_cluster: String) -> Result<()> {
    let id = resolve_mini_cluster(client, &mini_cluster).await?;
    let response = client
        .delete(&format!("/api/v1/mini_clusters/{}", id))
        .send()
        .await?;
    check(response, "release mini-cluster").await?;
    println!("Mini-cluster '{}' released", mini_cluster);
    Ok(())
}

/// Submit a cargo
pub async fn submit(
    client: &ApiClient,
    mini_cluster: String,
    claim: ResourceVector,
    name: Option<String>,
    image: String,
    env: Vec<String>,
    command: Vec<String>,
) -> Result<()> {
    let id = resolve_mini_cluster(client, &mini_cluster).await?;

    let env = parse_env(&env)?;
    let mut req = CargoRequest::new(claim, LaunchSpec { image, command, env });
    req.name = name;

    let response = client
        .post(&format!("/api/v1/mini_clusters/{}/cargoes", id))
        .json(&req)
        .send()
        .await?;
    let cargo: Cargo = check(response, "submit cargo").await?.json().await?;

    println!("Cargo '{}' {}", cargo.name, cargo.state());
    println!("  ID: {}", cargo.id);
    println!("  Nodes: {}", join_nodes(&cargo));
    Ok(())
}

fn parse_env(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("environment '{}' is not KEY=VALUE", pair))?;
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Kill a cargo
pub async fn kill(client: &ApiClient, cargo: String) -> Result<()> {
    let id = parse_id(&cargo, "cargo")?;
    let response = client.delete(&format!("/api/v1/cargoes/{}", id)).send().await?;
    let cargo: Cargo = check(response, "kill cargo").await?.json().await?;
    println!("Cargo '{}' {}", cargo.name, cargo.state());
    Ok(())
}

/// Reap a finished cargo
pub async fn reap(client: &ApiClient, cargo: String) -> Result<()> {
    let id = parse_id(&cargo, "cargo")?;
    let response = client
        .post(&format!("/api/v1/cargoes/{}/reap", id))
        .send()
        .await?;
    let cargo: Cargo = check(response, "reap cargo").await?.json().await?;
    println!("Cargo '{}' reaped", cargo.name);
    Ok(())
}

/// Get mini-cluster status
pub async fn status(client: &ApiClient, mini_cluster: Option<String>) -> Result<()> {
    let Some(name) = mini_cluster else {
        return ps(client).await;
    };

    let id = resolve_mini_cluster(client, &name).await?;
    let response = client.get(&format!("/api/v1/mini_clusters/{}", id)).send().await?;
    let status: MiniClusterStatus = check(response, "get mini-cluster").await?.json().await?;

    let mc = &status.mini_cluster;
    println!("Mini-cluster: {}", mc.name);
    println!("  ID: {}", mc.id);
    println!("  State: {}", mc.state());
    println!("  Units: {}/{}", mc.current_size(), mc.target_size);
    println!("  Leased: {}", status.leased);
    println!("  In use: {}", status.in_use);
    println!("  Cargo: {}", status.cargo_count);

    if !status.leases.is_empty() {
        println!("\nLeases:");
        for lease in &status.leases {
            print_lease(lease);
        }
    }
    Ok(())
}

fn print_lease(lease: &Lease) {
    let nodes: Vec<&str> = lease.nodes.iter().map(|n| n.as_str()).collect();
    let expires = lease
        .expires_at
        .map_or_else(|| "never".to_string(), |at| at.to_rfc3339());
    println!(
        "  {} {} on {} (expires {})",
        lease.id,
        lease.state,
        nodes.join(","),
        expires
    );
}

/// List mini-clusters
pub async fn ps(client: &ApiClient) -> Result<()> {
    let response = client.get("/api/v1/mini_clusters").send().await?;
    let mini_clusters: Vec<MiniCluster> = check(response, "list mini-clusters").await?.json().await?;

    if mini_clusters.is_empty() {
        println!("No mini-clusters found");
        return Ok(());
    }

    println!(
        "{:<36} {:<20} {:<10} {:<8} {:<20}",
        "ID", "NAME", "STATE", "UNITS", "PER UNIT"
    );
    println!("{}", "-".repeat(100));
    for mc in mini_clusters {
        println!(
            "{:<36} {:<20} {:<10} {:<8} {:<20}",
            mc.id,
            mc.name,
            mc.state().to_string(),
            format!("{}/{}", mc.current_size(), mc.target_size),
            mc.per_unit_claim.resources.to_string()
        );
    }
    Ok(())
}

/// List cargo
pub async fn cargoes(client: &ApiClient, mini_cluster: Option<String>) -> Result<()> {
    let path = match mini_cluster {
        Some(name) => {
            let id = resolve_mini_cluster(client, &name).await?;
            format!("/api/v1/mini_clusters/{}/cargoes", id)
        }
        None => "/api/v1/cargoes".to_string(),
    };
    let response = client.get(&path).send().await?;
    let cargoes: Vec<Cargo> = check(response, "list cargo").await?.json().await?;

    if cargoes.is_empty() {
        println!("No cargo found");
        return Ok(());
    }

    println!(
        "{:<36} {:<20} {:<10} {:<20} {:<20}",
        "ID", "NAME", "STATE", "CLAIM", "NODES"
    );
    println!("{}", "-".repeat(110));
    for cargo in cargoes {
        let state = match cargo.failure {
            Some(reason) => format!("{} ({})", cargo.state(), reason),
            None => cargo.state().to_string(),
        };
        println!(
            "{:<36} {:<20} {:<10} {:<20} {:<20}",
            cargo.id,
            cargo.name,
            state,
            cargo.claim.to_string(),
            join_nodes(&cargo)
        );
    }
    Ok(())
}

fn join_nodes(cargo: &Cargo) -> String {
    cargo
        .nodes()
        .iter()
        .map(|n| n.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Show the cluster resource view
pub async fn nodes(client: &ApiClient) -> Result<()> {
    let response = client.get("/api/v1/nodes").send().await?;
    let views: Vec<NodeView> = check(response, "list nodes").await?.json().await?;

    if views.is_empty() {
        println!("No nodes registered");
        return Ok(());
    }

    println!(
        "{:<20} {:<12} {:<10} {:<24} {:<24}",
        "NODE", "HEALTH", "GPU TYPE", "CAPACITY", "AVAILABLE"
    );
    println!("{}", "-".repeat(94));
    for view in views {
        println!(
            "{:<20} {:<12} {:<10} {:<24} {:<24}",
            view.node.id.as_str(),
            view.node.health.to_string(),
            view.node.gpu_type.as_deref().unwrap_or("-"),
            view.node.capacity.to_string(),
            view.available.to_string()
        );
    }
    Ok(())
}

/// Register a node
pub async fn node_add(
    client: &ApiClient,
    id: String,
    capacity: ResourceVector,
    gpu_type: Option<String>,
    address: Option<String>,
) -> Result<()> {
    let mut spec = NodeSpec::new(id, capacity);
    spec.gpu_type = gpu_type;
    spec.address = address;

    let response = client.post("/api/v1/nodes").json(&spec).send().await?;
    let view: NodeView = check(response, "register node").await?.json().await?;
    println!("Node '{}' registered with {}", view.node.id, view.node.capacity);
    Ok(())
}

/// Deregister a node
pub async fn node_rm(client: &ApiClient, id: String) -> Result<()> {
    let response = client.delete(&format!("/api/v1/nodes/{}", id)).send().await?;
    check(response, "deregister node").await?;
    println!("Node '{}' deregistered", id);
    Ok(())
}

/// Renew a lease
pub async fn renew(client: &ApiClient, lease: String, until: Option<String>) -> Result<()> {
    let id = parse_id(&lease, "lease")?;
    let until: Option<DateTime<Utc>> = until
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|at| at.with_timezone(&Utc))
                .with_context(|| format!("'{}' is not an RFC 3339 timestamp", raw))
        })
        .transpose()?;

    #[derive(Serialize)]
    struct RenewRequest {
        until: Option<DateTime<Utc>>,
    }

    let response = client
        .post(&format!("/api/v1/leases/{}/renew", id))
        .json(&RenewRequest { until })
        .send()
        .await?;
    let lease: Lease = check(response, "renew lease").await?.json().await?;
    print_lease(&lease);
    Ok(())
}

/// Follow the event stream until the daemon closes it
pub async fn events(client: &ApiClient, kind: Option<String>) -> Result<()> {
    let mut request = client.get("/api/v1/events");
    if let Some(kind) = &kind {
        request = request.query(&[("kind", kind)]);
    }
    let mut response = check(request.send().await?, "subscribe to events").await?;

    let mut buffer = String::new();
    while let Some(chunk) = response.chunk().await? {
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(end) = buffer.find('\n') {
            let line: String = buffer.drain(..=end).collect();
            if let Some(data) = line.trim_end().strip_prefix("data:") {
                println!("{}", data.trim_start());
            }
        }
    }
    Ok(())
}

/// Show system status
pub async fn top(client: &ApiClient) -> Result<()> {
    let response = client.get("/api/v1/status").send().await?;
    let status: StatusResponse = check(response, "get status").await?.json().await?;
    let cluster = status.cluster;

    println!("crane v{}", status.version);
    println!();
    println!("Nodes: {} ({} healthy)", cluster.nodes, cluster.healthy_nodes);
    println!("Capacity: {}", cluster.capacity);
    println!("Committed: {}", cluster.committed);
    println!("Available: {}", cluster.available);
    println!("Leases: {}", cluster.live_leases);
    println!("Mini-clusters: {}", cluster.active_mini_clusters);
    println!("Cargo: {}", cluster.live_cargoes);
    println!("Substrate: {}", cluster.substrate);
    Ok(())
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("'{}' is not a {} ID", raw, what))
}

/// Helper to parse mini-cluster ID (UUID or name)
async fn resolve_mini_cluster(client: &ApiClient, mini_cluster: &str) -> Result<Uuid> {
    // Try parsing as UUID first
    if let Ok(id) = Uuid::parse_str(mini_cluster) {
        return Ok(id);
    }

    // Otherwise, search by name
    let response = client.get("/api/v1/mini_clusters").send().await?;
    let mini_clusters: Vec<MiniCluster> = check(response, "list mini-clusters").await?.json().await?;
    mini_clusters
        .into_iter()
        .filter(|mc| mc.state() != crane_core::MiniClusterState::Released)
        .find(|mc| mc.name == mini_cluster)
        .map(|mc| mc.id)
        .with_context(|| format!("Mini-cluster '{}' not found", mini_cluster))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env() {
        let env = parse_env(&["A=1".to_string(), "B=x=y".to_string()]).unwrap();
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "x=y");
        assert!(parse_env(&["broken".to_string()]).is_err());
    }

    #[test]
    fn test_client_url() {
        let client = ApiClient::new("http://localhost:9090/", "alice");
        assert_eq!(client.url("/api/v1/status"), "http://localhost:9090/api/v1/status");
    }
}

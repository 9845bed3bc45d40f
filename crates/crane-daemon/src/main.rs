//! crane daemon
//!
//! Serves the tenant API and runs the reconciliation loop over the cluster
//! inventory.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use crane_api::create_router;
use crane_core::{CraneError, DaemonConfig, LoggingConfig, SubstrateType};
use crane_network::HttpHealthProbe;
use crane_runtime::{InMemorySubstrate, ProcessSubstrate, ProcessSubstrateConfig, Substrate};
use crane_scheduler::{Reconciler, Scheduler};
use crane_store::FileStateStore;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// crane daemon - multi-tenant GPU cluster reservation and scheduling
#[derive(Parser, Debug)]
#[command(name = "craned")]
#[command(version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (text or json)
    #[arg(long)]
    log_format: Option<String>,

    /// Launch substrate (process or memory)
    #[arg(long)]
    substrate: Option<String>,

    /// Snapshot file path
    #[arg(long)]
    state_path: Option<PathBuf>,

    /// Keep all state in memory
    #[arg(long)]
    no_persist: bool,
}

/// Load the config file, then apply command-line overrides
fn load_config(args: &Args) -> Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DaemonConfig::default(),
    };

    if let Some(address) = &args.address {
        config.api.rest_address = address.clone();
    }
    if let Some(port) = args.port {
        config.api.rest_port = port;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &args.log_format {
        config.logging.format = format.clone();
    }
    if let Some(substrate) = &args.substrate {
        config.runtime.substrate = match substrate.to_lowercase().as_str() {
            "process" => SubstrateType::Process,
            "memory" => SubstrateType::Memory,
            other => bail!("unknown substrate '{}', expected process or memory", other),
        };
    }
    if let Some(path) = &args.state_path {
        config.storage.state_path = path.clone();
    }
    if args.no_persist {
        config.storage.persist = false;
    }

    Ok(config)
}

fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let json = config.format.eq_ignore_ascii_case("json");

    let installed = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let builder = builder.with_ansi(false).with_writer(Mutex::new(file));
            if json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
        None if json => builder.json().try_init(),
        None => builder.try_init(),
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}

fn build_substrate(config: &DaemonConfig) -> Arc<dyn Substrate> {
    match config.runtime.substrate {
        SubstrateType::Process => Arc::new(ProcessSubstrate::new(ProcessSubstrateConfig {
            work_dir: config.runtime.work_dir.clone(),
            extra_env: Vec::new(),
        })),
        SubstrateType::Memory => Arc::new(InMemorySubstrate::new()),
    }
}

async fn build_scheduler(config: &DaemonConfig) -> Result<Arc<Scheduler>> {
    let substrate = build_substrate(config);
    let scheduler = if config.storage.persist {
        let store = Arc::new(FileStateStore::new(&config.storage.state_path));
        info!(path = %config.storage.state_path.display(), "Recovering from snapshot");
        Scheduler::recover(&config.scheduler, substrate, store, config.api.event_buffer)
            .await
            .context("recovering cluster state")?
    } else {
        Scheduler::new(&config.scheduler, substrate, config.api.event_buffer)
    };
    let scheduler = Arc::new(scheduler);

    for spec in &config.nodes {
        match scheduler.register_node(spec.clone()).await {
            Ok(view) => debug!(node = %view.node.id, "Registered configured node"),
            Err(CraneError::NodeExists(_)) => debug!(node = %spec.id, "Configured node already known"),
            Err(e) => warn!(node = %spec.id, error = %e, "Failed to register configured node"),
        }
    }

    Ok(scheduler)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.logging)?;

    info!("Starting crane daemon v{}", env!("CARGO_PKG_VERSION"));

    let scheduler = build_scheduler(&config).await?;
    let status = scheduler.status().await;
    info!(
        nodes = status.nodes,
        gpus = status.capacity.gpu,
        substrate = %status.substrate,
        "Cluster state ready"
    );

    // Reconciliation loop
    let probe = Arc::new(HttpHealthProbe::new(&config.network)?);
    let reconciler = Reconciler::new(scheduler.clone(), probe, config.reconcile.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconcile_task = tokio::spawn(async move { reconciler.run(shutdown_rx).await });

    let router = create_router(scheduler.clone(), &config.api);
    let addr: SocketAddr = format!("{}:{}", config.api.rest_address, config.api.rest_port)
        .parse()
        .context("invalid API address")?;

    info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = reconcile_task.await {
        warn!(error = %e, "Reconciliation task ended abnormally");
    }
    scheduler.persist().await.context("persisting final snapshot")?;

    info!("crane daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["craned"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_defaults_without_config() {
        let config = load_config(&args(&[])).unwrap();
        assert_eq!(config.api.rest_port, 9090);
        assert_eq!(config.runtime.substrate, SubstrateType::Process);
        assert!(config.storage.persist);
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[api]
rest_port = 7000

[runtime]
substrate = "memory"

[[nodes]]
id = "gpu-0"
capacity = {{ gpu = 8, cpu = 64, memory = 0 }}
"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = load_config(&args(&["--config", &path, "--port", "7100", "--no-persist"])).unwrap();
        assert_eq!(config.api.rest_port, 7100);
        assert_eq!(config.runtime.substrate, SubstrateType::Memory);
        assert!(!config.storage.persist);
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.nodes[0].capacity.gpu, 8);
    }

    #[test]
    fn test_unknown_substrate_rejected() {
        assert!(load_config(&args(&["--substrate", "kubernetes"])).is_err());
    }

    #[tokio::test]
    async fn test_build_scheduler_registers_nodes_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.runtime.substrate = SubstrateType::Memory;
        config.storage.state_path = dir.path().join("state.json");
        config.nodes.push(crane_core::NodeSpec::new(
            "gpu-0",
            crane_core::ResourceVector::gpus(4),
        ));

        let first = build_scheduler(&config).await.unwrap();
        assert_eq!(first.nodes().await.len(), 1);
        drop(first);

        // Recovered from the snapshot, config node already present
        let second = build_scheduler(&config).await.unwrap();
        assert_eq!(second.nodes().await.len(), 1);
    }
}

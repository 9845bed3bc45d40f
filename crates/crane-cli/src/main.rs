//! crane CLI
//!
//! Command-line interface for interacting with the crane daemon.

mod commands;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// crane - reserve GPU mini-clusters and run cargo on them
#[derive(Parser, Debug)]
#[command(name = "crane")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:9090", global = true)]
    api: String,

    /// Tenant to act as
    #[arg(long, default_value = "default", global = true)]
    tenant: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Per-unit or per-cargo capacity flags
#[derive(clap::Args, Debug, Clone, Copy)]
pub struct Capacity {
    /// GPUs
    #[arg(long, default_value_t = 0)]
    gpus: u32,

    /// CPU cores
    #[arg(long, default_value_t = 0)]
    cpus: u32,

    /// Memory in MiB
    #[arg(long, default_value_t = 0)]
    memory_mb: u64,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reserve a mini-cluster
    Reserve {
        /// Number of units
        #[arg(long, default_value_t = 1)]
        size: u32,

        /// Accept the reservation once this many units are granted
        #[arg(long)]
        min_size: Option<u32>,

        /// Largest size later resizes may reach
        #[arg(long)]
        max_size: Option<u32>,

        #[command(flatten)]
        capacity: Capacity,

        /// Required GPU model
        #[arg(long)]
        gpu_type: Option<String>,

        /// Nodes each unit spans
        #[arg(long, default_value_t = 1)]
        span: u32,

        /// At most one unit per node
        #[arg(long)]
        anti_affinity: bool,

        /// All units on one node
        #[arg(long)]
        co_locate: bool,

        /// Heartbeat lease TTL in seconds
        #[arg(long)]
        ttl: Option<u64>,

        /// Mini-cluster name
        #[arg(long)]
        name: Option<String>,
    },

    /// Resize a mini-cluster
    Resize {
        /// Mini-cluster name or ID
        mini_cluster: String,

        /// New number of units
        size: u32,
    },

    /// Release a mini-cluster
    Release {
        /// Mini-cluster name or ID
        mini_cluster: String,
    },

    /// Run a cargo in a mini-cluster
    Submit {
        /// Mini-cluster name or ID
        mini_cluster: String,

        #[command(flatten)]
        capacity: Capacity,

        /// Cargo name
        #[arg(long)]
        name: Option<String>,

        /// Container image
        #[arg(long, default_value = "")]
        image: String,

        /// Environment variable (KEY=VALUE)
        #[arg(long = "env", short = 'e')]
        env: Vec<String>,

        /// Command to run
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Kill a cargo
    Kill {
        /// Cargo ID
        cargo: String,
    },

    /// Remove a finished cargo
    Reap {
        /// Cargo ID
        cargo: String,
    },

    /// Get mini-cluster status
    Status {
        /// Mini-cluster name or ID (optional, shows all if not provided)
        mini_cluster: Option<String>,
    },

    /// List mini-clusters
    Ps,

    /// List cargo
    Cargoes {
        /// Only cargo of this mini-cluster
        #[arg(long)]
        mini_cluster: Option<String>,
    },

    /// Show the cluster resource view
    Nodes,

    /// Register a node
    NodeAdd {
        /// Node ID
        id: String,

        #[command(flatten)]
        capacity: Capacity,

        /// GPU model
        #[arg(long)]
        gpu_type: Option<String>,

        /// Node agent base URL
        #[arg(long)]
        address: Option<String>,
    },

    /// Deregister an idle node
    NodeRm {
        /// Node ID
        id: String,
    },

    /// Renew a lease
    Renew {
        /// Lease ID
        lease: String,

        /// New deadline (RFC 3339)
        #[arg(long)]
        until: Option<String>,
    },

    /// Follow state transitions
    Events {
        /// Only events of this kind
        #[arg(long)]
        kind: Option<String>,
    },

    /// Show system status
    Top,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api, &cli.tenant);

    match cli.command {
        Commands::Reserve {
            size,
            min_size,
            max_size,
            capacity,
            gpu_type,
            span,
            anti_affinity,
            co_locate,
            ttl,
            name,
        } => {
            let placement = commands::Placement {
                gpu_type,
                span,
                anti_affinity,
                co_locate,
            };
            let sizes = commands::Sizes {
                target: size,
                min: min_size,
                max: max_size,
            };
            commands::reserve(&client, sizes, capacity.into(), placement, ttl, name).await?;
        }
        Commands::Resize { mini_cluster, size } => {
            commands::resize(&client, mini_cluster, size).await?;
        }
        Commands::Release { mini_cluster } => {
            commands::release(&client, mini_cluster).await?;
        }
        Commands::Submit {
            mini_cluster,
            capacity,
            name,
            image,
            env,
            command,
        } => {
            commands::submit(&client, mini_cluster, capacity.into(), name, image, env, command).await?;
        }
        Commands::Kill { cargo } => {
            commands::kill(&client, cargo).await?;
        }
        Commands::Reap { cargo } => {
            commands::reap(&client, cargo).await?;
        }
        Commands::Status { mini_cluster } => {
            commands::status(&client, mini_cluster).await?;
        }
        Commands::Ps => {
            commands::ps(&client).await?;
        }
        Commands::Cargoes { mini_cluster } => {
            commands::cargoes(&client, mini_cluster).await?;
        }
        Commands::Nodes => {
            commands::nodes(&client).await?;
        }
        Commands::NodeAdd {
            id,
            capacity,
            gpu_type,
            address,
        } => {
            commands::node_add(&client, id, capacity.into(), gpu_type, address).await?;
        }
        Commands::NodeRm { id } => {
            commands::node_rm(&client, id).await?;
        }
        Commands::Renew { lease, until } => {
            commands::renew(&client, lease, until).await?;
        }
        Commands::Events { kind } => {
            commands::events(&client, kind).await?;
        }
        Commands::Top => {
            commands::top(&client).await?;
        }
    }

    Ok(())
}

impl From<Capacity> for crane_core::ResourceVector {
    fn from(c: Capacity) -> Self {
        crane_core::ResourceVector::new(c.gpus, c.cpus, c.memory_mb.saturating_mul(1024 * 1024))
    }
}

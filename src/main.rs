//! WolfMesh - Self-Organising Service Cluster
//!
//! Runs a cluster node and offers a few operator commands around it.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfmesh::api::StateResponse;
use wolfmesh::config::WolfMeshConfig;
use wolfmesh::connector::{Connector, Notification};
use wolfmesh::topology::TopologySnapshot;

/// WolfMesh - Self-Organising Service Cluster
#[derive(Parser)]
#[command(name = "wolfmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfmesh.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a WolfMesh node
    Start {
        /// Bootstrap node URL (repeatable), e.g. http://10.0.0.1:7400
        #[arg(short, long)]
        bootstrap: Vec<String>,

        /// Port for links and the HTTP API
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show the state and topology of a running node
    Status {
        /// Node address to query (host:port)
        #[arg(short, long, default_value = "localhost:7400")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfmesh.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long)]
        node_id: Option<String>,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { bootstrap, port } => {
            run_start(&cli.config, cli.log_level, bootstrap, port).await
        }
        Commands::Status { address } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "pretty");
            run_status(&address).await
        }
        Commands::Init { output, node_id } => run_init(&output, node_id),
        Commands::Validate => run_validate(&cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Load the config file, falling back to defaults when it does not exist
fn load_config(path: &Path) -> anyhow::Result<WolfMeshConfig> {
    if path.exists() {
        WolfMeshConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))
    } else {
        Ok(WolfMeshConfig::default())
    }
}

/// Start the node and run until Ctrl-C
async fn run_start(
    config_path: &Path,
    log_level: Option<String>,
    bootstrap: Vec<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if !bootstrap.is_empty() {
        config.cluster.bootstraps = bootstrap;
    }
    if let Some(port) = port {
        config.node.port = port;
    }
    if let Some(level) = log_level {
        config.logging.level = level;
    }

    init_logging(&config.logging.level, &config.logging.format);
    tracing::info!("Starting WolfMesh node...");

    let handle = Connector::start(config).await.context("failed to start connector")?;
    let mut notifications = handle.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            notification = notifications.recv() => match notification {
                Ok(Notification::MemberJoined(node)) => tracing::info!("Node {} joined", node),
                Ok(Notification::MemberLeft(id)) => tracing::info!("Node {} left", id),
                Ok(Notification::Topology { revision }) => tracing::debug!("Topology at revision {}", revision),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} notifications", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    handle.stop().await?;
    tracing::info!("WolfMesh node stopped");
    Ok(())
}

/// Check node status
async fn run_status(address: &str) -> anyhow::Result<()> {
    let base = format!("http://{}", address);

    let state: StateResponse = reqwest::get(format!("{}/state", base))
        .await
        .with_context(|| format!("failed to reach {}", address))?
        .json()
        .await?;

    println!("Node:        {}", address);
    println!("State:       {}", state.state.map(|s| s.to_string()).unwrap_or_else(|| "-".into()));
    println!("Topology:    {}", state.topology_ver);

    let response = reqwest::get(format!("{}/topology", base)).await?;
    if !response.status().is_success() {
        println!("Topology unavailable ({})", response.status());
        return Ok(());
    }
    let topology: TopologySnapshot = response.json().await?;

    println!("Master:      {}", topology.master.as_deref().unwrap_or("-"));
    println!("Revision:    {}", topology.revision);
    println!();
    println!("Nodes:");
    for node in &topology.nodes {
        let marker = if topology.master.as_deref() == Some(node.id()) { "*" } else { " " };
        println!("  {} {:<24} {}", marker, node.id(), node.endpoint());
    }

    Ok(())
}

/// Initialize configuration file
fn run_init(output: &Path, node_id: Option<String>) -> anyhow::Result<()> {
    let mut config = WolfMeshConfig::default();
    config.node.id = node_id;

    let content = format!("# WolfMesh Configuration\n# Generated configuration file\n\n{}", config.to_toml()?);
    std::fs::write(output, content)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Configuration file created: {}", output.display());
    println!("\nAdd bootstrap URLs under [cluster] to join an existing cluster.");
    println!("Then start with: wolfmesh --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: &Path) -> anyhow::Result<()> {
    let config = match WolfMeshConfig::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            return Err(e.into());
        }
    };

    println!("✓ Configuration is valid");
    println!("  Node ID:     {}", config.node_id(config.node.port));
    println!("  Listen:      {}", config.bind_address());
    println!("  Bootstraps:  {}", config.cluster.bootstraps.len());
    println!("  Protocols:   {:?}", config.link.protocols);
    Ok(())
}

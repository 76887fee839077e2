//! cluster-hub: bus relay and node runner.
//!
//! `cluster-hub relay` forwards bus frames between nodes. `cluster-hub node`
//! joins a relay with an in-memory room store per namespace and logs what
//! the cluster does.

use anyhow::Result;
use clap::{Parser, Subcommand};
use cluster_core::{ClusterEvent, ClusterNode, EngineEvent, InMemoryAdapter, NodeId};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use cluster_hub::{HubSettings, RelayServer, WsBus};

#[derive(Parser, Debug)]
#[command(name = "cluster-hub")]
#[command(about = "Cluster bus relay and node runner")]
struct Args {
    /// Settings file (JSON); defaults apply when absent
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bus relay
    Relay {
        /// Address to listen on, overriding the settings file
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Run a cluster node attached to a relay
    Node {
        /// Relay URL, overriding the settings file
        #[arg(short, long)]
        relay: Option<String>,

        /// Node ID as 16 hex characters (generated if not provided)
        #[arg(long)]
        node_id: Option<NodeId>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,cluster_hub=debug,cluster_core=debug"
    } else {
        "info,cluster_hub=info,cluster_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = HubSettings::load(args.config.as_deref())?;

    match args.command {
        Command::Relay { listen } => run_relay(listen.unwrap_or(settings.listen)).await,
        Command::Node { relay, node_id } => {
            let relay = relay.unwrap_or_else(|| settings.relay_url.clone());
            run_node(settings, relay, node_id.unwrap_or_else(NodeId::generate)).await
        }
    }
}

async fn run_relay(listen: String) -> Result<()> {
    info!("Starting relay");
    let listener = RelayServer::bind(&listen).await?;
    let relay = RelayServer::new();

    tokio::select! {
        result = relay.run(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    }
}

async fn run_node(settings: HubSettings, relay: String, node_id: NodeId) -> Result<()> {
    info!("Starting node {}", node_id);
    let endpoint = WsBus::connect(&relay, node_id).await?;
    let (node, mut engine_events) = ClusterNode::start_with_id(node_id, settings.cluster, endpoint)?;

    let _membership = node.events().subscribe(|event| match event {
        ClusterEvent::NodeJoined { node_id, .. } => info!("Peer {} joined", node_id),
        ClusterEvent::NodeLeft { node_id, reason, .. } => info!("Peer {} left ({:?})", node_id, reason),
    });
    for nsp in &settings.namespaces {
        node.adapter(nsp, InMemoryAdapter::new());
        info!("Serving namespace {}", nsp);
    }

    info!("Node running. Press Ctrl+C to stop.");
    loop {
        tokio::select! {
            Some(event) = engine_events.recv() => match event {
                EngineEvent::Connection { sid } => info!("Session {} connected", sid),
                EngineEvent::Upgrade { sid } => info!("Session {} upgraded", sid),
                EngineEvent::Close { sid, reason } => info!("Session {} closed ({})", sid, reason),
                EngineEvent::Packet { sid, packet } => debug!("Session {}: {:?}", sid, packet),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    node.shutdown().await;
    info!("Shutting down");
    Ok(())
}

//! Auralink MCP node - runs one agent of the coordination protocol.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use auralink_mcp::agents::{self, OfflineBackend};
use auralink_mcp::transport::{Listener, RemoteLink};
use auralink_mcp::workflow;
use auralink_mcp::{AgentKind, Bus, BusConfig, Endpoint, PeerAddress};

/// Auralink MCP node - one agent on the coordination bus.
#[derive(Parser, Debug)]
#[command(name = "auralink-mcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Agent this node runs (transcription, vision, generation, orchestrator).
    #[arg(long, default_value = "orchestrator")]
    agent: AgentKind,

    /// Address to listen on; defaults to the agent's configured peer address.
    #[arg(long)]
    listen: Option<String>,

    /// Peer override as kind=host:port. Repeatable.
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(AgentKind, PeerAddress)>,

    /// JSON bus configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON.
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

fn parse_peer(s: &str) -> Result<(AgentKind, PeerAddress), String> {
    let (kind, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected kind=host:port, got {s}"))?;
    let kind = kind.parse::<AgentKind>().map_err(|e| e.to_string())?;
    let addr = addr.parse::<PeerAddress>().map_err(|e| e.to_string())?;
    Ok((kind, addr))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let mut config = match &args.config {
        Some(path) => BusConfig::from_json_file(path)?,
        None => BusConfig::default(),
    };
    config.peers.extend(args.peers);

    info!(agent = %args.agent, "Auralink MCP node starting");

    let listen = match args.listen {
        Some(addr) => addr,
        None => config
            .peer(args.agent)
            .map(|peer| format!("0.0.0.0:{}", peer.port))
            .ok_or_else(|| anyhow::anyhow!("no address configured for {}", args.agent))?,
    };
    let peers: Vec<(AgentKind, PeerAddress)> = config
        .peers
        .iter()
        .filter(|(kind, _)| **kind != args.agent)
        .map(|(kind, peer)| (*kind, peer.clone()))
        .collect();

    let bus = Bus::new(config);
    let endpoint = Endpoint::attach(&bus, args.agent)?;
    agents::mount_builtins(&endpoint)?;
    match args.agent {
        AgentKind::Orchestrator => workflow::mount_orchestrator(&endpoint)?,
        kind => agents::mount(&endpoint, Arc::new(OfflineBackend::new(kind)))?,
    }
    info!(methods = ?endpoint.methods(), "capabilities registered");

    let listener = Listener::bind(&bus, listen.as_str()).await?;
    info!(addr = %listener.local_addr()?, "accepting peers");
    let listening = tokio::spawn(async move {
        if let Err(e) = listener.run().await {
            error!(%e, "listener stopped");
        }
    });

    let mut links = Vec::new();
    for (kind, peer) in peers {
        match RemoteLink::connect(&bus, kind, peer.clone()).await {
            Ok(link) => links.push(link),
            Err(e) => warn!(agent = %kind, %peer, %e, "peer unavailable"),
        }
    }

    let running = tokio::spawn({
        let endpoint = endpoint.clone();
        async move { endpoint.run().await }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    endpoint.shutdown();
    running.await??;
    for link in links {
        link.close();
    }
    listening.abort();
    bus.shutdown();

    info!(stats = ?bus.stats(), "Auralink MCP node stopped");
    Ok(())
}

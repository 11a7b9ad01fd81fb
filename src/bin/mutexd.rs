//! `mutexd`: one mutual exclusion peer served over gRPC.
//!
//! Starts the `ExclusionManager` service, optionally runs a few
//! acquire/release rounds against a resource, and serves peers until Ctrl-C.

use clap::Parser;
use praborrow_mutex::config::{NodeConfig, PeerEntry};
use praborrow_mutex::grpc::{GrpcConfig, GrpcTransport, start_grpc_server_with_shutdown};
use praborrow_mutex::{MutexEngine, MutexEngineBuilder, MutexError, MutexMetrics, ProcessId};
use rand::Rng;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "mutexd")]
#[command(about = "Distributed mutual exclusion peer", long_about = None)]
struct Cli {
    /// Node configuration file (TOML). Overrides --id, --listen and --peer.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// This process's id
    #[arg(long)]
    id: Option<String>,

    /// Address to serve on
    #[arg(long, default_value = "127.0.0.1:50051")]
    listen: SocketAddr,

    /// Peer as `id=address`, repeatable
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(ProcessId, String)>,

    /// Resource to contend for
    #[arg(long, default_value = "resA")]
    resource: String,

    /// Acquire/release rounds to run (0 only serves peers)
    #[arg(long, default_value_t = 3)]
    rounds: u32,

    /// Time spent inside the critical section per round
    #[arg(long, default_value_t = 500)]
    hold_ms: u64,

    /// Wait before the first round so peers can come up
    #[arg(long, default_value_t = 2000)]
    startup_delay_ms: u64,
}

fn parse_peer(raw: &str) -> Result<(ProcessId, String), String> {
    match raw.split_once('=') {
        Some((id, address)) if !id.is_empty() && !address.is_empty() => {
            Ok((ProcessId::from(id), address.to_string()))
        }
        _ => Err(format!("expected id=address, got {raw:?}")),
    }
}

fn setup_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

fn node_config(cli: &Cli) -> Result<NodeConfig, MutexError> {
    if let Some(path) = &cli.config {
        return NodeConfig::load(path);
    }

    let id = cli
        .id
        .clone()
        .ok_or_else(|| MutexError::Config("either --config or --id is required".into()))?;
    let peers = cli.peers.iter().map(|(peer, address)| PeerEntry {
        id: peer.clone(),
        address: address.clone(),
    });
    NodeConfig::new(id, cli.listen, peers)
}

async fn run_rounds(engine: MutexEngine<GrpcTransport>, cli: &Cli) {
    tokio::time::sleep(Duration::from_millis(cli.startup_delay_ms)).await;

    for round in 1..=cli.rounds {
        match engine.acquire(cli.resource.as_str()).await {
            Ok(acquired) => {
                tracing::info!(
                    round,
                    resource = %acquired.resource,
                    timestamp = acquired.request_timestamp,
                    "Working inside critical section"
                );
                tokio::time::sleep(Duration::from_millis(cli.hold_ms)).await;
                if let Err(e) = engine.release(cli.resource.as_str()).await {
                    tracing::error!(round, error = %e, "Release failed");
                }
            }
            Err(e) => tracing::warn!(round, error = %e, "Could not acquire resource"),
        }

        let pause = rand::rng().random_range(100..=400);
        tokio::time::sleep(Duration::from_millis(pause)).await;
    }

    tracing::info!(rounds = cli.rounds, "Finished; serving peers until interrupted");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    setup_logging();
    let cli = Cli::parse();
    let node = node_config(&cli)?;

    let id = node.id.clone();
    let metrics = MutexMetrics::new(id.clone());
    let peers = node.peers.iter().map(|p| (p.id.clone(), p.address.clone()));
    let transport = GrpcTransport::new(id.clone(), GrpcConfig::default(), peers, Some(metrics.clone()));

    let engine = MutexEngineBuilder::new()
        .id(id.clone())
        .peers(node.peer_ids())
        .with_network(transport)
        .config(node.mutex_config())
        .with_metrics(metrics.clone())
        .build()?;

    let server = tokio::spawn(start_grpc_server_with_shutdown(
        node.listen,
        Arc::new(engine.clone()),
        async {
            let _ = tokio::signal::ctrl_c().await;
        },
    ));

    if cli.rounds > 0 {
        let engine = engine.clone();
        run_rounds(engine, &cli).await;
    }

    server.await??;
    tracing::info!(process_id = %id, "Shut down");
    println!("{}", metrics.to_prometheus_text());
    Ok(())
}

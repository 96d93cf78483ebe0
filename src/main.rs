use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use floodmesh::{MemoryTransport, Network, NodeConfig, TcpTransport, TopologyConfig, Transport};

#[derive(Parser, Debug)]
#[command(name = "floodmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of nodes to create.
    #[arg(short, long, default_value = "5")]
    nodes: usize,

    /// Client address of the first node; later nodes count up from its port.
    #[arg(short, long, default_value = floodmesh::topology::DEFAULT_BASE_ADDR)]
    base: SocketAddr,

    /// Leave out subscriptions that would target a node's own server.
    #[arg(long)]
    skip_self_subscription: bool,

    /// Run over in-process channels instead of TCP.
    #[arg(long)]
    memory: bool,

    /// Log every delivered envelope and the decision taken.
    #[arg(long)]
    trace: bool,

    #[arg(short, long, default_value = "30")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let transport: Arc<dyn Transport> = if args.memory {
        Arc::new(MemoryTransport::new())
    } else {
        Arc::new(TcpTransport::new())
    };

    let config = TopologyConfig {
        nodes: args.nodes,
        base_addr: args.base,
        skip_self_subscription: args.skip_self_subscription,
        node: NodeConfig::default(),
    };
    let network = Network::build(transport, config).await?;

    if args.trace {
        for node in network.nodes() {
            let Some(mut rx) = node.deliveries().await else {
                continue;
            };
            tokio::spawn(async move {
                while let Some(delivery) = rx.recv().await {
                    info!(
                        node = %delivery.node,
                        role = %delivery.role,
                        connection = delivery.connection,
                        visited = ?delivery.envelope.visited_nodes,
                        depth = delivery.envelope.depth(),
                        decision = ?delivery.decision,
                        "delivery"
                    );
                }
            });
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                match network.snapshot().await {
                    Ok(snapshots) => {
                        for snap in snapshots {
                            info!(
                                node = %snap.id,
                                server = ?snap.server_bound,
                                server_connections = snap.server_connections.len(),
                                subscribers = snap.subscribers.len(),
                                received = snap.counters.received,
                                forwarded = snap.counters.forwarded,
                                suppressed = snap.counters.suppressed,
                                dropped = snap.counters.dropped,
                                over_limit = snap.counters.over_limit,
                                "telemetry snapshot"
                            );
                        }
                    }
                    Err(e) => warn!(error = %e, "telemetry snapshot failed"),
                }
            }
        }
    }

    network.shutdown().await;
    Ok(())
}

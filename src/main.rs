use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kadence::{Node, NodeEvent, NodeOptions};

#[derive(Parser, Debug)]
#[command(name = "kadence")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind address; port 0 picks a random port.
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Bootstrap endpoints (IP:PORT), repeatable.
    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddr>,

    /// Force persistence: adopt an identity as soon as the public endpoint
    /// is known. Use for standing bootstrappers.
    #[arg(long)]
    persistent: bool,

    /// Assert that this node is reachable from the outside.
    #[arg(long)]
    not_firewalled: bool,

    /// Seconds between status lines.
    #[arg(short, long, default_value = "60")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let node = Node::new(NodeOptions {
        bootstrap: args.bootstrap.clone(),
        bind: Some(args.bind),
        ephemeral: args.persistent.then_some(false),
        firewalled: args.not_firewalled.then_some(false),
        ..NodeOptions::default()
    })
    .await?;
    let mut events = node.subscribe();

    info!(addr = %node.address(), "kadence node started");
    node.ready().await?;
    info!(
        ephemeral = node.ephemeral(),
        firewalled = node.firewalled(),
        "bootstrap complete"
    );

    let mut status = time::interval(Duration::from_secs(args.status_interval));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                node.destroy().await;
                break;
            }
            event = events.recv() => {
                match event {
                    Ok(NodeEvent::Persistent(id)) => info!(%id, "node is now persistent"),
                    Ok(NodeEvent::WakeUp) => warn!("wake-up detected"),
                    Ok(event) => info!(?event, "node event"),
                    Err(_) => {}
                }
            }
            _ = status.tick() => {
                let peers = node.to_array().await.map(|p| p.len()).unwrap_or(0);
                info!(
                    id = node.id().map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
                    ephemeral = node.ephemeral(),
                    firewalled = node.firewalled(),
                    port = node.port(),
                    peers,
                    "status"
                );
            }
        }
    }

    Ok(())
}

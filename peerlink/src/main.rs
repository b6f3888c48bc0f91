//! peerlink: relay-multiplexed TCP tunnels
//!
//! `peerlink serve` exposes local services to peers, `peerlink tunnel`
//! reaches a peer's service through a local port.

use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;

mod cli;

#[derive(Parser)]
#[command(name = "peerlink")]
#[command(about = "TCP tunnels between peers over a shared relay")]
struct Cli {
    #[command(flatten)]
    global: cli::GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept inbound tunnels from peers until interrupted
    Serve {
        /// Local ports peers may reach (repeatable; default: any)
        #[arg(long = "allow-port")]
        allow_ports: Vec<u16>,
    },
    /// Forward a local port to a port on a remote peer
    Tunnel {
        /// Remote peer ID
        #[arg(long)]
        peer: String,
        /// Port on the remote peer
        #[arg(long)]
        remote_port: u16,
        /// Local port to listen on (0 picks a free port)
        #[arg(long, default_value_t = 0)]
        local_port: u16,
    },
}

fn init_tracing(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.global.log_level);

    let config = cli::load_config(&cli.global).await?;

    match cli.command {
        Commands::Serve { allow_ports } => cli::serve::run(config, allow_ports).await,
        Commands::Tunnel {
            peer,
            remote_port,
            local_port,
        } => {
            let tunnel = peerlink::TunnelConfig::new(peer, remote_port, local_port);
            cli::tunnel::run(config, tunnel).await
        }
    }
}

//! flowsyncd entry point.

use clap::Parser;
use flowsyncd::{Daemon, DaemonConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Kernel-topology to forwarding-element reconciliation daemon
#[derive(Parser, Debug)]
#[command(name = "flowsyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port the forwarding element connects to
    #[arg(short = 'p', long, default_value = "6653")]
    listen_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(listen_port = args.listen_port, "starting flowsyncd");

    let config = DaemonConfig {
        listen_port: args.listen_port,
        ..DaemonConfig::default()
    };

    let daemon = Daemon::new(config).await?;
    daemon.run().await
}

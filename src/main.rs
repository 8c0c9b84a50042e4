//! Process entry point: parse flags, initialize logging, boot a `Node` and
//! serve its control-plane router until shutdown.
//!
//! All node configuration is environment-driven (spec §6); the CLI surface
//! here only covers process-level overrides, in the same spirit as the
//! teacher's `clap`-based `main.rs` (`--dir`/`--join`/`--bootstrap`) but
//! updated to clap's derive API.

use agenda_raft::config::{LogFormat, NodeConfig};
use agenda_raft::errors::*;
use agenda_raft::node::Node;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agenda-node", about = "Replicated calendar/agenda node")]
struct Cli {
    /// Overrides LOG_LEVEL for this run without touching the environment.
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

fn init_tracing(config: &NodeConfig) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = NodeConfig::from_env()?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    init_tracing(&config);

    let node = Node::start(config).await?;
    let running = node.clone();

    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };

    let result = running.serve(shutdown).await;
    node.shutdown().await;
    result
}

//! Portgate server agent binary
//!
//! Started on the remote host by the client's transport. Standard output
//! carries the protocol, so every log line goes to standard error.

use anyhow::{bail, Result};
use clap::Parser;
use portgate_agent::{spawn_metrics_server, Server, ServerConfig, ServerMetrics, StdioStream};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "server-agent", version, about = "Portgate server agent")]
struct Cli {
    /// Serve the protocol over standard input and output
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    stdio: bool,

    /// Allow-list and limits file
    #[arg(long, default_value = "server.yaml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if !cli.stdio {
        bail!("Only stdio mode is supported currently");
    }

    let config = ServerConfig::load_or_default(&cli.config);
    let metrics = Arc::new(ServerMetrics::new());

    if config.metrics_port > 0 {
        if let Err(e) = spawn_metrics_server(Arc::clone(&metrics), config.metrics_port).await {
            warn!("Metrics server disabled: {}", e);
        }
    }

    let session_id = uuid::Uuid::new_v4();
    info!(%session_id, "Starting agent in stdio mode");

    let server = Server::over_io(StdioStream::process(), config, metrics);
    server
        .serve()
        .instrument(info_span!("session", %session_id))
        .await;

    info!("Agent shutting down");
    Ok(())
}

//! Portgate command-line client

use anyhow::{bail, Context, Result};
use clap::Parser;
use portgate::{ConnectOptions, ConnectionManager};
use portgate_proto::PortConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// A `local=target` forward given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
struct ForwardSpec {
    local: String,
    target: String,
}

fn parse_forward(value: &str) -> std::result::Result<ForwardSpec, String> {
    let (local, target) = value
        .split_once('=')
        .ok_or_else(|| format!("expected <local>=<target>, got {:?}", value))?;
    if local.is_empty() || target.is_empty() {
        return Err(format!("expected <local>=<target>, got {:?}", value));
    }
    Ok(ForwardSpec {
        local: local.to_string(),
        target: target.to_string(),
    })
}

#[derive(Debug, Parser)]
#[command(
    name = "portgate",
    version,
    about = "Forward local ports through a remote agent over SSH"
)]
struct Cli {
    /// SSH server as host[:port]
    #[arg(long)]
    host: String,

    /// Login name
    #[arg(long, short = 'u', default_value = "root")]
    user: String,

    /// Password; key or agent authentication is used when absent
    #[arg(long, env = "PORTGATE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Private key file
    #[arg(long, short = 'i')]
    key: Option<PathBuf>,

    /// Agent executable on the remote host
    #[arg(long, default_value = portgate_ssh::DEFAULT_AGENT_PATH)]
    agent_path: String,

    /// TCP connect timeout in seconds
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Forward <local>=<target>; repeatable. Defaults to every advertised target
    #[arg(short = 'L', long = "forward", value_parser = parse_forward)]
    forwards: Vec<ForwardSpec>,

    /// Only check that the host is reachable and accepts the credentials
    #[arg(long)]
    test: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn connect_options(&self) -> ConnectOptions {
        let mut options = ConnectOptions::new(&self.host, &self.user)
            .with_agent_path(&self.agent_path)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout));
        if let Some(password) = &self.password {
            options = options.with_password(password);
        }
        if let Some(key) = &self.key {
            options = options.with_key(key);
        }
        options
    }
}

/// Local address for an advertised target when no `-L` was given
fn default_local(port: &PortConfig) -> String {
    match port.local_port {
        Some(local_port) if port.is_static => format!("127.0.0.1:{}", local_port),
        _ => "127.0.0.1:0".to_string(),
    }
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

    let manager = ConnectionManager::new();

    if cli.test {
        let result = manager.test_connection(cli.connect_options()).await;
        match result.error {
            None => match result.banner {
                Some(banner) => println!("OK ({} ms, {})", result.latency_ms, banner),
                None => println!("OK ({} ms)", result.latency_ms),
            },
            Some(error) => bail!("{} ({} ms)", error, result.latency_ms),
        }
        return Ok(());
    }

    let response = manager.connect(cli.connect_options()).await;
    if !response.success {
        bail!(response.error.unwrap_or_else(|| "Connection failed".to_string()));
    }
    let handshake = response.config.context("Server sent no configuration")?;
    info!(
        "Connected to {} (server version {})",
        cli.host, handshake.version
    );

    let forwards: Vec<(String, String)> = if cli.forwards.is_empty() {
        handshake
            .allowed_ports
            .iter()
            .map(|port| (default_local(port), port.target.clone()))
            .collect()
    } else {
        cli.forwards
            .iter()
            .map(|spec| (spec.local.clone(), spec.target.clone()))
            .collect()
    };

    for port in &handshake.allowed_ports {
        let description = port.description.as_deref().unwrap_or("");
        println!("allowed: {:<16} {} {}", port.name, port.target, description);
    }

    for (local, target) in &forwards {
        match manager.start_forward(local, target).await {
            Ok(bound) => println!("forward: {} -> {}", bound, target),
            Err(e) => warn!("Cannot forward {} -> {}: {}", local, target, e.user_message()),
        }
    }
    if manager.forwards().is_empty() {
        manager.disconnect().await;
        bail!("No forwards could be started");
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Interrupted, disconnecting");
        }
        _ = manager.closed() => warn!("Session closed by the remote side"),
    }

    let traffic = manager.metrics();
    manager.disconnect().await;
    println!(
        "sent {} bytes, received {} bytes",
        traffic.bytes_sent, traffic.bytes_received
    );
    Ok(())
}

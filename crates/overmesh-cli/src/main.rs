//! Overmesh demonstration node
//!
//! Runs one instance in any of the three roles: a server that listens for
//! agents and viewers, or an agent/client that connects to a server and
//! probes it over the overlay.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};

use overmesh_core::future::ResponseFuture;
use overmesh_core::payload::{Ping, Pong};
use overmesh_runtime::{
    core_exelet, InstanceRole, ListenerEntry, LoopConfig, MemoryStore, NodeRuntime, RuntimeConfig,
    Store,
};

// ----------------------------------------------------------------------------
// Arguments
// ----------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "overmesh", about = "Overmesh demonstration node")]
struct Cli {
    /// Optional TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Permanent instance UUID; generated when omitted
    #[arg(long, global = true)]
    uuid: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a server instance
    Server {
        /// Listen address
        #[arg(long, default_value = "0.0.0.0:9100")]
        bind: String,
    },
    /// Run an agent instance
    Agent {
        /// Server addresses, tried in order
        #[arg(long = "server", required = true)]
        servers: Vec<String>,
    },
    /// Run a viewer client instance
    Client {
        /// Server addresses, tried in order
        #[arg(long = "server", required = true)]
        servers: Vec<String>,
    },
}

// ----------------------------------------------------------------------------
// File Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    runtime: RuntimeConfig,
    reconnect: LoopConfig,
}

impl FileConfig {
    fn load(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(FileConfig::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}

// ----------------------------------------------------------------------------
// Entry Point
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = FileConfig::load(cli.config.as_ref())?;

    match cli.command {
        Command::Server { bind } => run_server(bind, cli.uuid, config).await,
        Command::Agent { servers } => {
            run_peer(InstanceRole::Agent, servers, cli.uuid, config).await
        }
        Command::Client { servers } => {
            run_peer(InstanceRole::Client, servers, cli.uuid, config).await
        }
    }
}

// ----------------------------------------------------------------------------
// Roles
// ----------------------------------------------------------------------------

async fn run_server(bind: String, uuid: Option<String>, config: FileConfig) -> anyhow::Result<()> {
    let mut builder = NodeRuntime::builder(InstanceRole::Server)
        .config(config.runtime)
        .exelet(core_exelet());
    if let Some(uuid) = uuid {
        builder = builder.uuid(uuid);
    }
    let runtime = builder.build();

    let (address, port) = bind
        .rsplit_once(':')
        .context("bind address must be host:port")?;
    let listeners = MemoryStore::new();
    listeners.add(ListenerEntry {
        id: "default".into(),
        address: address.to_string(),
        port: port.parse().context("invalid port")?,
        enabled: true,
    });

    let bound = runtime
        .listen_configured(&listeners)
        .await
        .map_err(|error| anyhow::anyhow!("listen failed: {error}"))?;
    for (addr, _handle) in &bound {
        info!(%addr, cvid = %runtime.local_cvid(), "server listening");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

async fn run_peer(
    role: InstanceRole,
    servers: Vec<String>,
    uuid: Option<String>,
    config: FileConfig,
) -> anyhow::Result<()> {
    let mut builder = NodeRuntime::builder(role)
        .config(config.runtime)
        .exelet(core_exelet());
    if let Some(uuid) = uuid {
        builder = builder.uuid(uuid);
    }
    let runtime = builder.build();

    let reconnect = LoopConfig {
        targets: servers,
        ..config.reconnect
    };
    let connection = runtime
        .connect_loop(&reconnect)
        .await
        .map_err(|error| anyhow::anyhow!("no server reachable: {error}"))?;

    let identity = connection
        .identity()
        .context("connection closed before the session was recorded")?;
    info!(
        cvid = %identity.local_cvid,
        server = %identity.peer_cvid,
        server_uuid = %identity.peer_uuid,
        "session established"
    );

    let mut probe = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = probe.tick() => {
                let started = Instant::now();
                let response: ResponseFuture<Pong> = connection.request(Ping);
                match response.get().await {
                    Ok(_) => info!(rtt = ?started.elapsed(), "server answered ping"),
                    Err(error) => warn!(%error, "ping failed"),
                }
                if !connection.is_connected() {
                    warn!("connection lost");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                connection.close();
                break;
            }
        }
    }
    Ok(())
}

//! trellisd, the Trellis actor daemon.
//!
//! One binary runs any of the three actor roles; `actor.type` in the
//! config decides which message kinds are accepted and which policy
//! module loads. The kernel stays on a single task; the bus, timer,
//! provisioning pool, and metrics listener run around it.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use trellis_core::config::ActorConfig;
use trellis_core::graph::SubstrateGraph;
use trellis_core::store::SqliteStore;

use trellis_daemon::bus::InMemoryBus;
use trellis_daemon::metrics::{self, ActorMetrics};
use trellis_daemon::runtime::ActorRuntime;

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "trellisd", about = "Trellis actor daemon")]
struct Args {
    /// Path of the actor config file.
    #[arg(long, short, env = "TRELLIS_CONFIG", default_value = "trellis.toml")]
    config: String,

    /// Log filter, e.g. `info` or `trellis_core=debug`.
    #[arg(long, env = "TRELLIS_LOG", default_value = "info")]
    log: String,
}

fn load_graph(config: &ActorConfig) -> anyhow::Result<SubstrateGraph> {
    let path = &config.graphdb.model_path;
    if path.is_empty() {
        return Ok(SubstrateGraph::new(format!(
            "{}-model",
            config.actor.name
        )));
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read substrate model {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("cannot parse substrate model {path}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ActorConfig::load(&args.config)
        .with_context(|| format!("cannot load config {}", args.config))?;
    info!(
        actor = %config.actor.name,
        role = %config.actor.role,
        "starting"
    );

    let store = SqliteStore::open(&config.database.path).context("cannot open store")?;
    let graph = load_graph(&config)?;
    let bus = Arc::new(InMemoryBus::new(config.transport.message_max_bytes));
    let metrics = Arc::new(ActorMetrics::new()?);

    if config.prometheus.port != 0 {
        let exporter = Arc::clone(&metrics);
        let port = config.prometheus.port;
        tokio::spawn(async move {
            if let Err(err) = metrics::serve(exporter, port).await {
                tracing::error!(error = %err, "metrics listener failed");
            }
        });
    }

    let runtime = ActorRuntime::build(&config, store, graph, bus, metrics)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    runtime.run(shutdown_rx).await
}

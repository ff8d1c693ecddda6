use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{fs, net::TcpListener};
use tracing_subscriber::EnvFilter;

use nekorfc::{serve, spawn_sweeper, PeerRegistry, TrackerConfig, TrackerServer};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file, defaults are used if omitted
    config: Option<String>,
}

/// Starts a [TrackerServer] on [TrackerConfig::host] with [TrackerConfig::port], sweeping stale
/// peers every [TrackerConfig::sweep_interval_secs]
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config: TrackerConfig = match args.config {
        Some(path) => toml::from_str(
            &fs::read_to_string(&path)
                .await
                .with_context(|| format!("missing config file {path}"))?,
        )
        .context("failed to parse config file")?,
        None => TrackerConfig::default(),
    };

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind {0}:{1}", config.host, config.port))?;
    tracing::info!(addr = %listener.local_addr()?, ttl = config.ttl, "tracker listening");

    let registry = Arc::new(PeerRegistry::new(config.ttl));
    let sweeper = spawn_sweeper(&registry, Duration::from_secs(config.sweep_interval_secs));

    tokio::select! {
        _ = serve(listener, move |addr| TrackerServer::new(addr, &registry)) => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    sweeper.abort();

    Ok(())
}

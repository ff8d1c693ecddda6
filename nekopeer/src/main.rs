use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{fs, net::TcpListener};
use tracing_subscriber::EnvFilter;

use nekorfc::{serve, Node, NodeConfig, PeerServer};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file
    config: String,

    /// Exit once the script finishes instead of serving until interrupted
    #[arg(short, long, action)]
    exit: bool,
}

/// Serves the catalog from [NodeConfig] on [NodeConfig::port], then runs [NodeConfig::script]
/// against the tracker and other peers
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config: NodeConfig = toml::from_str(
        &fs::read_to_string(&args.config)
            .await
            .with_context(|| format!("missing config file {0}", args.config))?,
    )
    .context("failed to parse config file")?;

    let catalog = Arc::new(config.catalog().await.context("failed to load catalog")?);
    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind {0}:{1}", config.host, config.port))?;
    // register the port actually bound, in case 0 was asked for
    config.port = listener.local_addr()?.port();
    tracing::info!(addr = %listener.local_addr()?, rfcs = catalog.len(), "peer server listening");

    let server = tokio::spawn(serve(listener, move |addr| PeerServer::new(addr, &catalog)));

    let mut node = Node::new(config);
    let report = node.run_script().await?;
    for step in report.failures() {
        tracing::warn!(command = %step.command, error = step.error.as_deref().unwrap_or_default(), "step failed");
    }
    tracing::info!(
        steps = report.steps.len(),
        failed = report.failures().count(),
        known = node.known().count(),
        "script finished"
    );

    if !args.exit {
        tokio::signal::ctrl_c().await?;
    }
    server.abort();

    Ok(())
}

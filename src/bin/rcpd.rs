use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rcpd::cli::DaemonOpts;
use rcpd::config::FileConfig;
use rcpd::{Server, ServerConfig, ServerContext};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let file = match &opts.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let config = ServerConfig::from_sources(&opts, file)?;

    tracing::info!(
        root = %config.root.display(),
        bind = %config.bind_addr,
        io_timeout = ?config.io_timeout,
        strict_symlinks = config.strict_symlinks,
        "starting rcp daemon"
    );
    if config.bind_addr.starts_with("0.0.0.0") {
        tracing::warn!("binding to all interfaces; rcp is unauthenticated and unencrypted");
    }

    let ctx = ServerContext::from_config(config)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(true);
    })
    .context("Failed to install Ctrl-C handler")?;

    rt.block_on(async move {
        let server = Server::bind(ctx).await?;
        server
            .run_until(async move {
                let _ = stop_rx.changed().await;
            })
            .await
    })
}

//! TFTP server CLI: serves files under a root directory until killed.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// A TFTP (RFC 1350) server.
#[derive(Parser, Debug)]
#[command(name = "tftpd", version, about)]
struct Cli {
    /// UDP port to listen on.
    #[arg(long, default_value_t = 69)]
    port: u16,

    /// Directory to serve and receive files under.
    #[arg(long, default_value = "./tftp-root")]
    root: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.root)
        .with_context(|| format!("cannot create served directory {}", cli.root.display()))?;
    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("cannot canonicalize {}", cli.root.display()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    tftp::server::run(cli.port, root, shutdown_rx)
        .await
        .context("server exited with an error")?;

    Ok(())
}

//! TFTP client CLI: one shot get/put against a remote server.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use tftp::client;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum TransferDirection {
    Get,
    Put,
}

/// A TFTP (RFC 1350) client.
#[derive(Parser, Debug)]
#[command(name = "tftp", version, about)]
struct Cli {
    /// Whether to download (`get`) or upload (`put`).
    #[arg(long)]
    mode: TransferDirection,

    /// Server address to connect to, e.g. `192.0.2.1:69`.
    #[arg(long)]
    remote_address: String,

    /// Local file path: the download destination, or the upload source.
    #[arg(long)]
    host_path: PathBuf,

    /// Remote filename as known to the server.
    #[arg(long)]
    remote_path: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if cli.remote_path.is_empty() {
        return Err(anyhow!("--remote-path must not be empty"));
    }

    let server = resolve_server(&cli.remote_address)?;

    match cli.mode {
        TransferDirection::Get => client::get(server, &cli.remote_path, &cli.host_path)
            .await
            .with_context(|| format!("GET {} from {server}", cli.remote_path))?,
        TransferDirection::Put => client::put(server, &cli.host_path, &cli.remote_path)
            .await
            .with_context(|| format!("PUT {} to {server}", cli.remote_path))?,
    }

    Ok(())
}

fn resolve_server(remote_address: &str) -> Result<SocketAddr> {
    remote_address
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve {remote_address}"))?
        .next()
        .ok_or_else(|| anyhow!("{remote_address} resolved to no addresses"))
}

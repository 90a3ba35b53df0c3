//! The UDP-multiplexing TFTP server: listens on one well-known port,
//! demultiplexes incoming RRQ/WRQ packets, and forks each transfer onto
//! its own socket bound to a fresh TID.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::io::{FileSink, FileSource};
use crate::protocol::{MAX_PACKET_SIZE, Packet};
use crate::transfer::{Driver, ReceiverStart, run_receiver, run_sender};

/// Run the TFTP server: bind `port` and serve files rooted at `root`
/// until `shutdown` fires.
pub async fn run(port: u16, root: PathBuf, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = UdpSocket::bind(addr).await.map_err(Error::Transport)?;
    info!(%addr, root = %root.display(), "tftp server listening");

    let root = Arc::new(root);
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (n, peer) = result.map_err(Error::Transport)?;
                let packet = match Packet::parse(&buf[..n]) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(%peer, error = %e, "dropping malformed datagram");
                        continue;
                    }
                };
                dispatch(packet, peer, Arc::clone(&root));
            }
            _ = shutdown.changed() => {
                info!("tftp server shutting down");
                return Ok(());
            }
        }
    }
}

/// Fork a single request onto its own task. Each task owns its own
/// transfer socket from here on; the listener socket is never touched
/// again for this peer.
fn dispatch(packet: Packet, peer: SocketAddr, root: Arc<PathBuf>) {
    match packet {
        Packet::ReadRequest { filename, .. } => {
            tokio::spawn(async move {
                if let Err(e) = serve_rrq(peer, &filename, &root).await {
                    warn!(%peer, filename, error = %e, "RRQ failed");
                }
            });
        }
        Packet::WriteRequest { filename, .. } => {
            tokio::spawn(async move {
                if let Err(e) = serve_wrq(peer, &filename, &root).await {
                    warn!(%peer, filename, error = %e, "WRQ failed");
                }
            });
        }
        other => {
            warn!(%peer, packet = ?other, "unexpected packet on the listener socket");
        }
    }
}

async fn serve_rrq(peer: SocketAddr, filename: &str, root: &Path) -> Result<()> {
    let path = match sanitize_path(root, filename) {
        Ok(path) => path,
        Err(e) => {
            send_early_error(peer, 2, "Access violation").await;
            return Err(e);
        }
    };

    let source = match FileSource::open(&path).await {
        Ok(source) => source,
        Err(e) => {
            let (code, msg) = local_io_error_code(&e);
            send_early_error(peer, code, msg).await;
            return Err(e);
        }
    };

    info!(%peer, filename, "RRQ");
    let socket = bind_transfer_socket(peer).await?;
    let driver = Driver::established(socket, peer);
    run_sender(driver, source, None).await?;
    debug!(%peer, filename, "RRQ complete");
    Ok(())
}

async fn serve_wrq(peer: SocketAddr, filename: &str, root: &Path) -> Result<()> {
    let path = match sanitize_path(root, filename) {
        Ok(path) => path,
        Err(e) => {
            send_early_error(peer, 2, "Access violation").await;
            return Err(e);
        }
    };

    if path.exists() {
        send_early_error(peer, 6, "File already exists").await;
        return Err(Error::ProtocolViolation(format!(
            "{} already exists",
            path.display()
        )));
    }

    let sink = match FileSink::create(&path).await {
        Ok(sink) => sink,
        Err(e) => {
            let (code, msg) = local_io_error_code(&e);
            send_early_error(peer, code, msg).await;
            return Err(e);
        }
    };

    info!(%peer, filename, "WRQ");
    let socket = bind_transfer_socket(peer).await?;
    let driver = Driver::established(socket, peer);
    run_receiver(driver, sink, ReceiverStart::SendAck0).await?;
    debug!(%peer, filename, "WRQ complete");
    Ok(())
}

/// Send a one-shot ERROR datagram ahead of ever establishing a transfer
/// socket. ERROR packets are never acknowledged or retried, so this
/// fires once and moves on regardless of whether it lands.
async fn send_early_error(peer: SocketAddr, code: u16, msg: &str) {
    let Ok(socket) = UdpSocket::bind(("0.0.0.0", 0)).await else {
        return;
    };
    let packet = Packet::Error {
        code,
        msg: msg.to_string(),
    };
    let _ = socket.send_to(&packet.encode(), peer).await;
}

/// Map a filesystem failure to the RFC 1350 ERROR code and message a
/// waiting peer should be told, instead of being left to time out on its
/// own retry budget.
fn local_io_error_code(e: &Error) -> (u16, &'static str) {
    match e {
        Error::LocalIo(io_err) => match io_err.kind() {
            std::io::ErrorKind::NotFound => (1, "File not found"),
            std::io::ErrorKind::PermissionDenied => (2, "Access violation"),
            _ => (3, "Disk full or allocation exceeded"),
        },
        _ => (0, "Not defined"),
    }
}

/// Bind an unconnected, per-transfer UDP socket on an OS-assigned port.
/// The socket is never connected to `peer` — that is what lets a
/// foreign-TID datagram still reach the Driver so it can reply
/// ERROR(5) instead of the kernel silently dropping it.
async fn bind_transfer_socket(peer: SocketAddr) -> Result<UdpSocket> {
    let domain = if peer.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let raw = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(Error::Transport)?;
    raw.set_nonblocking(true).map_err(Error::Transport)?;

    let bind_addr: SocketAddr = if peer.is_ipv6() {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    raw.bind(&bind_addr.into()).map_err(Error::Transport)?;

    let std_socket: std::net::UdpSocket = raw.into();
    UdpSocket::from_std(std_socket).map_err(Error::Transport)
}

/// Ensure the requested filename stays inside the served directory.
/// Supports subdirectory paths (e.g. `ios/config/router.cfg`) while
/// rejecting any traversal attempt (`..`) or absolute paths.
pub(crate) fn sanitize_path(dir: &Path, filename: &str) -> Result<PathBuf> {
    let normalized = filename.replace('\\', "/");

    if normalized.starts_with('/') {
        return Err(Error::ProtocolViolation("absolute paths are not allowed".into()));
    }

    for component in normalized.split('/') {
        if component == ".." {
            return Err(Error::ProtocolViolation("path traversal is not allowed".into()));
        }
    }

    let clean: PathBuf = normalized
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();

    if clean.as_os_str().is_empty() {
        return Err(Error::ProtocolViolation("invalid filename".into()));
    }

    let candidate = dir.join(&clean);

    let canonical_dir = dir
        .canonicalize()
        .map_err(Error::LocalIo)?;

    if candidate.exists() {
        let canonical = candidate.canonicalize().map_err(Error::LocalIo)?;
        if !canonical.starts_with(&canonical_dir) {
            return Err(Error::ProtocolViolation("path escapes served directory".into()));
        }
        Ok(canonical)
    } else {
        let mut ancestor = candidate.parent();
        while let Some(a) = ancestor {
            if a.exists() {
                let canonical_ancestor = a.canonicalize().map_err(Error::LocalIo)?;
                if !canonical_ancestor.starts_with(&canonical_dir) {
                    return Err(Error::ProtocolViolation("path escapes served directory".into()));
                }
                return Ok(candidate);
            }
            ancestor = a.parent();
        }
        Err(Error::ProtocolViolation("path escapes served directory".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_simple_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"test").unwrap();
        let result = sanitize_path(dir.path(), "hello.txt").unwrap();
        assert!(result.ends_with("hello.txt"));
    }

    #[test]
    fn sanitize_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        std::fs::write(dir.path().join("sub/deep/file.cfg"), b"data").unwrap();
        let result = sanitize_path(dir.path(), "sub/deep/file.cfg").unwrap();
        assert!(result.ends_with("sub/deep/file.cfg"));
    }

    #[test]
    fn sanitize_rejects_dotdot() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sanitize_path(dir.path(), "../etc/passwd").is_err());
        assert!(sanitize_path(dir.path(), "sub/../../etc/passwd").is_err());
    }

    #[test]
    fn sanitize_rejects_absolute() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sanitize_path(dir.path(), "/etc/passwd").is_err());
    }

    #[test]
    fn sanitize_normalizes_backslashes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("ios")).unwrap();
        std::fs::write(dir.path().join("ios/config.cfg"), b"data").unwrap();
        let result = sanitize_path(dir.path(), "ios\\config.cfg").unwrap();
        assert!(result.ends_with("ios/config.cfg"));
    }

    #[test]
    fn sanitize_nonexistent_path_within_dir() {
        let dir = tempfile::tempdir().unwrap();
        let result = sanitize_path(dir.path(), "new_dir/file.bin").unwrap();
        assert!(result.ends_with("new_dir/file.bin"));
    }

    #[test]
    fn sanitize_rejects_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sanitize_path(dir.path(), "").is_err());
        assert!(sanitize_path(dir.path(), ".").is_err());
        assert!(sanitize_path(dir.path(), "..").is_err());
    }
}

//! The TFTP client: `get` pulls a remote file down, `put` pushes a local
//! file up. Each call opens a fresh unconnected UDP socket bound to an
//! ephemeral TID and drives it through the Transfer Engine until the
//! transfer finishes or fails.

use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::Path;

use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::io::{FileSink, FileSource};
use crate::protocol::{Mode, Packet};
use crate::transfer::{Driver, ReceiverStart, run_receiver, run_sender};

/// Ephemeral port range TIDs are drawn from (spec: 49152-65535).
const TID_RANGE: RangeInclusive<u16> = 49152..=65535;

/// Download `remote_filename` from `server` and write it to `local_path`.
#[instrument(skip(local_path), fields(remote_filename, local = %local_path.display()))]
pub async fn get(server: SocketAddr, remote_filename: &str, local_path: &Path) -> Result<()> {
    let socket = bind_ephemeral().await?;
    info!(%server, remote_filename, "starting GET");

    let driver = Driver::unestablished(socket, server);
    let sink = FileSink::create(local_path).await?;
    let request = Packet::ReadRequest {
        filename: remote_filename.to_string(),
        mode: Mode::Octet,
    };

    run_receiver(driver, sink, ReceiverStart::SendRequest(request)).await?;
    debug!("GET complete");
    Ok(())
}

/// Upload `local_path` to the server, stored remotely as `remote_filename`.
#[instrument(skip(local_path), fields(remote_filename, local = %local_path.display()))]
pub async fn put(server: SocketAddr, local_path: &Path, remote_filename: &str) -> Result<()> {
    let socket = bind_ephemeral().await?;
    info!(%server, remote_filename, "starting PUT");

    let driver = Driver::unestablished(socket, server);
    let source = FileSource::open(local_path).await?;
    let request = Packet::WriteRequest {
        filename: remote_filename.to_string(),
        mode: Mode::Octet,
    };

    run_sender(driver, source, Some(request)).await?;
    debug!("PUT complete");
    Ok(())
}

/// Bind an unconnected UDP socket to a randomly chosen TID in the
/// ephemeral range, retrying on collision. `socket2` is used for the
/// bind so a future caller can tune buffer sizes before handing the
/// socket to tokio.
async fn bind_ephemeral() -> Result<UdpSocket> {
    let mut rng = rand::thread_rng();
    for _ in 0..16 {
        let port = rng.gen_range(TID_RANGE);
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(Error::Transport)?;
        socket.set_nonblocking(true).map_err(Error::Transport)?;
        match socket.bind(&addr.into()) {
            Ok(()) => {
                let std_socket: std::net::UdpSocket = socket.into();
                return UdpSocket::from_std(std_socket).map_err(Error::Transport);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(Error::Transport(e)),
        }
    }
    Err(Error::Transport(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        "could not find a free TID after 16 attempts",
    )))
}

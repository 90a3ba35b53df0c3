//! The lock-step Transfer Engine: a `Driver` that owns one socket bound
//! to one local TID, plus the Sender and Receiver state machines built
//! on top of it.
//!
//! At most one datagram is ever "in flight" within a Transfer. The
//! Driver is the only thing that retransmits; the state machines above
//! it only decide *what* to send next and when a transfer is done.

use std::cmp::Ordering;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout};

use crate::error::{Error, Result};
use crate::io::{FileSink, FileSource};
use crate::protocol::{MAX_PACKET_SIZE, Packet};

/// Per-attempt retry timeout (spec: 5 seconds).
pub const RETRY_TIMEOUT: Duration = Duration::from_secs(5);
/// Maximum retransmission attempts per block before giving up (spec: 5).
pub const MAX_RETRIES: u32 = 5;

enum PeerState {
    /// No datagram has arrived yet; this is where the *first* outbound
    /// datagram goes (the server's well-known port, for a client).
    Unestablished(SocketAddr),
    /// The peer TID, fixed on first receipt.
    Established(SocketAddr),
}

impl PeerState {
    fn addr(&self) -> SocketAddr {
        match self {
            PeerState::Unestablished(a) | PeerState::Established(a) => *a,
        }
    }
}

/// Owns one socket bound to one local TID for the lifetime of a Transfer.
/// Applies the fixed retry/timeout policy and caches the last-sent
/// datagram for retransmission.
pub struct Driver {
    socket: UdpSocket,
    peer: PeerState,
    retry_timeout: Duration,
    max_retries: u32,
    retry_count: u32,
    last_sent: Vec<u8>,
    deadline: Option<Instant>,
}

impl Driver {
    /// The peer's TID is already known (the server dispatcher learns it
    /// from the incoming request's source address).
    pub fn established(socket: UdpSocket, peer: SocketAddr) -> Self {
        Self::with_policy(socket, PeerState::Established(peer), RETRY_TIMEOUT, MAX_RETRIES)
    }

    /// The peer's TID is not yet known; `target` is where the first
    /// outbound datagram goes (a client sending RRQ/WRQ to the server's
    /// well-known port). The peer is fixed to whichever address the
    /// first reply arrives from.
    pub fn unestablished(socket: UdpSocket, target: SocketAddr) -> Self {
        Self::with_policy(socket, PeerState::Unestablished(target), RETRY_TIMEOUT, MAX_RETRIES)
    }

    fn with_policy(
        socket: UdpSocket,
        peer: PeerState,
        retry_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            socket,
            peer,
            retry_timeout,
            max_retries,
            retry_count: 0,
            last_sent: Vec::new(),
            deadline: None,
        }
    }

    /// Override the retry timeout and budget. Production call sites never
    /// call this — it exists so tests can run the same state machines
    /// against a much shorter timeout without changing the protocol's
    /// actual retry policy.
    #[cfg(test)]
    pub fn with_test_policy(mut self, retry_timeout: Duration, max_retries: u32) -> Self {
        self.retry_timeout = retry_timeout;
        self.max_retries = max_retries;
        self
    }

    /// Honor an overall deadline in addition to the per-attempt timeout.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Encode and send `packet` to the current peer (or the initial
    /// target, if the peer hasn't been established yet). Resets the
    /// retry counter and refreshes the retransmission cache.
    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        let bytes = packet.encode();
        self.socket
            .send_to(&bytes, self.peer.addr())
            .await
            .map_err(Error::Transport)?;
        self.last_sent = bytes;
        self.retry_count = 0;
        Ok(())
    }

    /// Wait for the next packet from the peer. Handles timeouts
    /// (resending the cached datagram, up to the retry budget) and
    /// foreign-TID datagrams (replying ERROR(5) to the interloper and
    /// continuing to wait) transparently. An ERROR packet from the
    /// established peer surfaces as `Error::RemoteError`; anything else
    /// is returned to the caller's state machine unchanged.
    pub async fn recv(&mut self) -> Result<Packet> {
        loop {
            if let Some(deadline) = self.deadline
                && Instant::now() >= deadline
            {
                return Err(Error::DeadlineExceeded);
            }

            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            match timeout(self.attempt_timeout(), self.socket.recv_from(&mut buf)).await {
                Ok(Ok((n, from))) => match &self.peer {
                    PeerState::Unestablished(_) => {
                        self.peer = PeerState::Established(from);
                        if let Some(pkt) = self.dispatch_received(&buf[..n], from)? {
                            return Ok(pkt);
                        }
                    }
                    PeerState::Established(addr) if from != *addr => {
                        let err = Packet::Error {
                            code: 5,
                            msg: "Unknown transfer ID".into(),
                        };
                        let _ = self.socket.send_to(&err.encode(), from).await;
                        continue;
                    }
                    PeerState::Established(_) => {
                        if let Some(pkt) = self.dispatch_received(&buf[..n], from)? {
                            return Ok(pkt);
                        }
                    }
                },
                Ok(Err(e)) => return Err(Error::Transport(e)),
                Err(_elapsed) => {
                    self.retry_count += 1;
                    if self.retry_count > self.max_retries {
                        return Err(Error::RetriesExhausted);
                    }
                    self.socket
                        .send_to(&self.last_sent, self.peer.addr())
                        .await
                        .map_err(Error::Transport)?;
                }
            }
        }
    }

    /// Parse a datagram already confirmed to be from the established
    /// peer. A malformed datagram is dropped (never fatal, never
    /// consumes retry budget); a well-formed ERROR becomes
    /// `Error::RemoteError`; anything else is returned to the caller.
    fn dispatch_received(&self, bytes: &[u8], _from: SocketAddr) -> Result<Option<Packet>> {
        match Packet::parse(bytes) {
            Ok(Packet::Error { code, msg }) => Err(Error::RemoteError { code, msg }),
            Ok(packet) => Ok(Some(packet)),
            Err(_) => Ok(None),
        }
    }

    fn attempt_timeout(&self) -> Duration {
        match self.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                remaining.min(self.retry_timeout)
            }
            None => self.retry_timeout,
        }
    }
}

/// Cyclic ordering of TFTP block numbers: `got` compares `Less` than
/// `want` when `got` is a stale (already-acknowledged) block number,
/// even across a 16-bit wraparound.
fn cyclic_cmp(want: u16, got: u16) -> Ordering {
    if got == want {
        Ordering::Equal
    } else if (want.wrapping_sub(got) as i16) > 0 {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

/// Runs the Sender state machine (spec §4.3.1): used by a PUT client and
/// an RRQ server. `initial_request`, when present, is a WRQ sent before
/// entering `AwaitInitialAck` (the client PUT case); when absent the
/// peer TID is already established and transmission starts directly at
/// `SendBlock(1)` (the server RRQ case).
pub async fn run_sender(
    mut driver: Driver,
    mut source: FileSource,
    initial_request: Option<Packet>,
) -> Result<()> {
    if let Some(request) = initial_request {
        driver.send(&request).await?;
        loop {
            match driver.recv().await? {
                Packet::Ack { block_num: 0 } => break,
                Packet::Ack { .. } => continue,
                other => {
                    return Err(Error::ProtocolViolation(format!(
                        "expected ACK 0 to establish transfer, got {other:?}"
                    )));
                }
            }
        }
    }

    let mut block_num: u16 = 1;
    loop {
        let payload = source.block(block_num as u32).await?;
        let is_final = payload.len() < crate::protocol::BLOCK_SIZE;
        driver.send(&Packet::Data { block_num, payload }).await?;

        loop {
            match driver.recv().await? {
                Packet::Ack { block_num: bn } => match cyclic_cmp(block_num, bn) {
                    Ordering::Equal => break,
                    // Stale ACK: the sorcerer's-apprentice case. Never
                    // retransmit on this — just keep waiting for the
                    // real one.
                    Ordering::Less => continue,
                    Ordering::Greater => {
                        return Err(Error::ProtocolViolation(format!(
                            "ACK {bn} is ahead of the block just sent ({block_num})"
                        )));
                    }
                },
                other => {
                    return Err(Error::ProtocolViolation(format!(
                        "unexpected packet while awaiting ACK {block_num}: {other:?}"
                    )));
                }
            }
        }

        if is_final {
            return Ok(());
        }
        block_num = block_num.wrapping_add(1);
    }
}

/// How a Receiver transfer begins (spec §4.3.2's `SendInitial`).
pub enum ReceiverStart {
    /// Client GET: send this RRQ to the server's well-known port. The
    /// peer TID is learned from the first DATA packet's source.
    SendRequest(Packet),
    /// Server WRQ: the peer TID is already the WRQ's source address;
    /// acknowledge block 0 to kick off the transfer.
    SendAck0,
}

/// Runs the Receiver state machine (spec §4.3.2): used by a GET client
/// and a WRQ server.
pub async fn run_receiver(mut driver: Driver, mut sink: FileSink, start: ReceiverStart) -> Result<()> {
    match run_receiver_inner(&mut driver, &mut sink, start).await {
        Ok(()) => sink.commit().await,
        Err(e) => {
            sink.abort().await;
            Err(e)
        }
    }
}

async fn run_receiver_inner(driver: &mut Driver, sink: &mut FileSink, start: ReceiverStart) -> Result<()> {
    match start {
        ReceiverStart::SendRequest(req) => driver.send(&req).await?,
        ReceiverStart::SendAck0 => driver.send(&Packet::Ack { block_num: 0 }).await?,
    }

    let mut expected: u16 = 1;
    loop {
        match driver.recv().await? {
            Packet::Data { block_num, payload } if block_num == expected => {
                let is_final = payload.len() < crate::protocol::BLOCK_SIZE;
                sink.accept(expected as u32, &payload).await?;
                driver.send(&Packet::Ack { block_num: expected }).await?;
                if is_final {
                    return Ok(());
                }
                expected = expected.wrapping_add(1);
            }
            Packet::Data { block_num, .. } if block_num == expected.wrapping_sub(1) => {
                // Duplicate of the block we already committed: re-ACK
                // without appending, per the idempotence property.
                driver.send(&Packet::Ack { block_num }).await?;
            }
            Packet::Data { .. } => {
                // Outside the one-block window either direction: ignore.
            }
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unexpected packet while awaiting block {expected}: {other:?}"
                )));
            }
        }
    }
}

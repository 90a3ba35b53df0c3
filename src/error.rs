//! Crate-wide error taxonomy.
//!
//! Each variant corresponds to one of the error kinds named in the
//! protocol design: a fixed set of failure modes a Transfer Engine, a
//! Client, or a Server Dispatcher can surface, rather than an open-ended
//! string.

use std::net::SocketAddr;

use crate::protocol::ParseError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Socket bind/read/write failure unrelated to the protocol itself.
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// A single retry attempt expired; recovered internally until the
    /// retry budget is exhausted.
    #[error("timed out waiting for a reply")]
    Timeout,

    /// The retry budget (5 attempts) was exhausted without a reply.
    #[error("gave up after exhausting the retry budget")]
    RetriesExhausted,

    /// An overall caller-supplied deadline expired.
    #[error("overall deadline exceeded")]
    DeadlineExceeded,

    /// A received datagram failed to parse as a TFTP packet.
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] ParseError),

    /// A datagram arrived from an address other than the established peer.
    #[error("datagram from unknown transfer ID: {0}")]
    ForeignTid(SocketAddr),

    /// The peer sent an ERROR packet; the transfer aborts with it verbatim.
    #[error("remote error {code}: {msg}")]
    RemoteError { code: u16, msg: String },

    /// A filesystem operation failed.
    #[error("local I/O error: {0}")]
    LocalIo(#[source] std::io::Error),

    /// A protocol invariant was violated by the peer (e.g. an ACK for a
    /// block that hasn't been sent yet).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// CLI argument validation failed; no I/O has happened yet.
    #[error("usage error: {0}")]
    UsageError(String),
}

//! A TFTP (RFC 1350) client and server library: a wire codec, a
//! lock-step transfer engine, file-backed source/sink adapters, and the
//! client and server built on top of them.

pub mod client;
pub mod error;
pub mod io;
pub mod protocol;
pub mod server;
pub mod transfer;

pub use error::{Error, Result};
pub use protocol::{Mode, OpCode, Packet};

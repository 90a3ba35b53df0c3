//! The TFTP wire codec (RFC 1350).
//!
//! Pure functions only: encoding a [`Packet`] to bytes and parsing bytes
//! back into one never touches a socket or the filesystem. `netascii` is
//! accepted as a mode but never translated — DATA payloads pass through
//! unchanged regardless of mode.

use std::fmt;

const OPCODE_RRQ: u16 = 1;
const OPCODE_WRQ: u16 = 2;
const OPCODE_DATA: u16 = 3;
const OPCODE_ACK: u16 = 4;
const OPCODE_ERROR: u16 = 5;

/// Default and only block size this crate negotiates (no RFC 2348 `blksize`).
pub const BLOCK_SIZE: usize = 512;

/// Largest datagram the codec will ever parse as DATA/ACK/ERROR: a 4-byte
/// header plus one full block.
pub const MAX_PACKET_SIZE: usize = 4 + BLOCK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OpCode {
    ReadRequest = OPCODE_RRQ,
    WriteRequest = OPCODE_WRQ,
    Data = OPCODE_DATA,
    Ack = OPCODE_ACK,
    Error = OPCODE_ERROR,
}

impl OpCode {
    fn from_u16(v: u16) -> Option<Self> {
        match v {
            OPCODE_RRQ => Some(OpCode::ReadRequest),
            OPCODE_WRQ => Some(OpCode::WriteRequest),
            OPCODE_DATA => Some(OpCode::Data),
            OPCODE_ACK => Some(OpCode::Ack),
            OPCODE_ERROR => Some(OpCode::Error),
            _ => None,
        }
    }
}

/// Transfer mode, compared case-insensitively on parse and always emitted
/// lowercase. `Mail` is accepted (RFC 1350 names it) but otherwise inert —
/// this crate treats every mode as `octet` for transfer purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Netascii,
    Octet,
    Mail,
}

impl Mode {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Some(Mode::Netascii),
            "octet" => Some(Mode::Octet),
            "mail" => Some(Mode::Mail),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Mode::Netascii => "netascii",
            Mode::Octet => "octet",
            Mode::Mail => "mail",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully parsed TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReadRequest { filename: String, mode: Mode },
    WriteRequest { filename: String, mode: Mode },
    Data { block_num: u16, payload: Vec<u8> },
    Ack { block_num: u16 },
    Error { code: u16, msg: String },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("datagram too short to contain an opcode")]
    Truncated,
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("malformed request: {0}")]
    MalformedRequest(&'static str),
    #[error("invalid mode {0:?}")]
    InvalidMode(String),
    #[error("malformed error packet: {0}")]
    MalformedError(&'static str),
    #[error("ACK packet must be exactly 4 bytes, got {0}")]
    BadAckLength(usize),
    #[error("DATA packet must be 4..={max} bytes, got {got}", max = MAX_PACKET_SIZE)]
    BadDataLength(usize),
}

impl Packet {
    /// Encode the packet to its exact wire layout.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::ReadRequest { filename, mode } => {
                encode_request(OPCODE_RRQ, filename, *mode)
            }
            Packet::WriteRequest { filename, mode } => {
                encode_request(OPCODE_WRQ, filename, *mode)
            }
            Packet::Data { block_num, payload } => {
                let mut buf = Vec::with_capacity(4 + payload.len());
                buf.extend_from_slice(&OPCODE_DATA.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf.extend_from_slice(payload);
                buf
            }
            Packet::Ack { block_num } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&OPCODE_ACK.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf
            }
            Packet::Error { code, msg } => {
                let mut buf = Vec::with_capacity(5 + msg.len());
                buf.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(msg.as_bytes());
                buf.push(0);
                buf
            }
        }
    }

    /// Parse a single datagram into a `Packet`. Never panics or reads out
    /// of bounds regardless of input.
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < 2 {
            return Err(ParseError::Truncated);
        }
        let raw_opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let opcode = OpCode::from_u16(raw_opcode).ok_or(ParseError::UnknownOpcode(raw_opcode))?;
        match opcode {
            OpCode::ReadRequest => parse_request(buf, true),
            OpCode::WriteRequest => parse_request(buf, false),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }
}

fn encode_request(opcode: u16, filename: &str, mode: Mode) -> Vec<u8> {
    let mode = mode.as_str();
    let mut buf = Vec::with_capacity(5 + filename.len() + mode.len());
    buf.extend_from_slice(&opcode.to_be_bytes());
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0);
    buf.extend_from_slice(mode.as_bytes());
    buf.push(0);
    buf
}

/// Parse RRQ/WRQ: opcode(2) | filename | 0x00 | mode | 0x00
fn parse_request(buf: &[u8], is_read: bool) -> Result<Packet, ParseError> {
    let payload = &buf[2..];

    let name_end = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or(ParseError::MalformedRequest("missing filename delimiter"))?;
    let filename_bytes = &payload[..name_end];
    if filename_bytes.is_empty() {
        return Err(ParseError::MalformedRequest("empty filename"));
    }

    let rest = &payload[name_end + 1..];
    let mode_end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(ParseError::MalformedRequest("missing mode delimiter"))?;
    let mode_bytes = &rest[..mode_end];
    if mode_bytes.is_empty() {
        return Err(ParseError::MalformedRequest("empty mode"));
    }

    let filename = String::from_utf8_lossy(filename_bytes).into_owned();
    let mode_str = String::from_utf8_lossy(mode_bytes).into_owned();
    let mode = Mode::parse(&mode_str).ok_or(ParseError::InvalidMode(mode_str))?;

    Ok(if is_read {
        Packet::ReadRequest { filename, mode }
    } else {
        Packet::WriteRequest { filename, mode }
    })
}

/// Parse ACK: opcode(2) | block(2), exactly 4 bytes.
fn parse_ack(buf: &[u8]) -> Result<Packet, ParseError> {
    if buf.len() != 4 {
        return Err(ParseError::BadAckLength(buf.len()));
    }
    let block_num = u16::from_be_bytes([buf[2], buf[3]]);
    Ok(Packet::Ack { block_num })
}

/// Parse DATA: opcode(2) | block(2) | payload(0..=512), 4..=516 bytes total.
fn parse_data(buf: &[u8]) -> Result<Packet, ParseError> {
    if buf.len() < 4 || buf.len() > MAX_PACKET_SIZE {
        return Err(ParseError::BadDataLength(buf.len()));
    }
    let block_num = u16::from_be_bytes([buf[2], buf[3]]);
    let payload = buf[4..].to_vec();
    Ok(Packet::Data { block_num, payload })
}

/// Parse ERROR: opcode(2) | code(2) | msg | 0x00, at least 5 bytes.
fn parse_error(buf: &[u8]) -> Result<Packet, ParseError> {
    if buf.len() < 5 {
        return Err(ParseError::MalformedError("packet shorter than 5 bytes"));
    }
    let code = u16::from_be_bytes([buf[2], buf[3]]);
    let msg_bytes = &buf[4..];
    let end = msg_bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or(ParseError::MalformedError("missing terminating 0x00"))?;
    let msg = String::from_utf8_lossy(&msg_bytes[..end]).into_owned();
    Ok(Packet::Error { code, msg })
}

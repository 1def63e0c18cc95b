//! UAP wire codec and logical clock.
//!
//! Every UAP datagram carries a fixed 20-byte big-endian header followed by
//! an optional UTF-8 payload. The codec is pure: encoding and decoding hold
//! no socket or session state, so both endpoints share this crate.
//!
//! # UTF-8 handling
//!
//! [`Packet::decode`] is strict and rejects payloads with invalid byte
//! sequences; the server uses it and drops undecodable datagrams without a
//! reply. [`Packet::decode_lossy`] substitutes U+FFFD instead, for the
//! permissive client side.

use bytes::{Buf, BufMut};
use std::fmt;

/// Leading two bytes of every valid datagram.
pub const MAGIC: u16 = 0xC461;
/// The protocol version this codec speaks.
pub const VERSION: u8 = 1;
/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 20;

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// The four session commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Hello = 0,
    Data = 1,
    Alive = 2,
    Goodbye = 3,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Command::Hello => write!(f, "HELLO"),
            Command::Data => write!(f, "DATA"),
            Command::Alive => write!(f, "ALIVE"),
            Command::Goodbye => write!(f, "GOODBYE"),
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::Hello),
            1 => Ok(Command::Data),
            2 => Ok(Command::Alive),
            3 => Ok(Command::Goodbye),
            other => Err(DecodeError::BadCommand(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// DecodeError
// ---------------------------------------------------------------------------

/// Reasons a datagram fails to decode. Receivers drop such datagrams
/// silently rather than replying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("datagram shorter than the {HEADER_LEN}-byte header")]
    Truncated,
    #[error("bad magic {0:#06x}")]
    BadMagic(u16),
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("unknown command {0}")]
    BadCommand(u8),
    #[error("payload is not valid UTF-8")]
    BadPayload,
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// One UAP message: header fields plus the payload text.
///
/// The payload is non-empty only for `DATA`; control packets encode as the
/// bare 20-byte header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: Command,
    pub seq: u32,
    pub session_id: u32,
    pub clock: u64,
    pub payload: String,
}

impl Packet {
    /// A payload-free packet (`HELLO`, `ALIVE`, `GOODBYE`).
    pub fn control(command: Command, seq: u32, session_id: u32, clock: u64) -> Packet {
        Packet {
            command,
            seq,
            session_id,
            clock,
            payload: String::new(),
        }
    }

    /// A `DATA` packet carrying one line of text.
    pub fn data(seq: u32, session_id: u32, clock: u64, payload: &str) -> Packet {
        Packet {
            command: Command::Data,
            seq,
            session_id,
            clock,
            payload: payload.to_owned(),
        }
    }

    /// Serialize to wire bytes: header then payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u16(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.command as u8);
        buf.put_u32(self.seq);
        buf.put_u32(self.session_id);
        buf.put_u64(self.clock);
        buf.put_slice(self.payload.as_bytes());
        buf
    }

    /// Strict decode: header checks plus UTF-8 validation of the payload.
    pub fn decode(datagram: &[u8]) -> Result<Packet, DecodeError> {
        let (command, seq, session_id, clock, payload) = decode_header(datagram)?;
        let payload = std::str::from_utf8(payload)
            .map_err(|_| DecodeError::BadPayload)?
            .to_owned();
        Ok(Packet {
            command,
            seq,
            session_id,
            clock,
            payload,
        })
    }

    /// Decode with invalid payload sequences replaced by U+FFFD.
    pub fn decode_lossy(datagram: &[u8]) -> Result<Packet, DecodeError> {
        let (command, seq, session_id, clock, payload) = decode_header(datagram)?;
        Ok(Packet {
            command,
            seq,
            session_id,
            clock,
            payload: String::from_utf8_lossy(payload).into_owned(),
        })
    }
}

fn decode_header(datagram: &[u8]) -> Result<(Command, u32, u32, u64, &[u8]), DecodeError> {
    if datagram.len() < HEADER_LEN {
        return Err(DecodeError::Truncated);
    }
    let (mut header, payload) = datagram.split_at(HEADER_LEN);
    let magic = header.get_u16();
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let version = header.get_u8();
    if version != VERSION {
        return Err(DecodeError::BadVersion(version));
    }
    let command = Command::try_from(header.get_u8())?;
    let seq = header.get_u32();
    let session_id = header.get_u32();
    let clock = header.get_u64();
    Ok((command, seq, session_id, clock, payload))
}

// ---------------------------------------------------------------------------
// Logical clock
// ---------------------------------------------------------------------------

/// Lamport counter kept by every endpoint.
///
/// Send rule: [`tick`](LogicalClock::tick) before stamping an outgoing
/// packet. Receive rule: [`observe`](LogicalClock::observe) the remote
/// stamp, advancing to `max(local, remote) + 1`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LogicalClock(u64);

impl LogicalClock {
    pub fn new() -> LogicalClock {
        LogicalClock(0)
    }

    /// Advance by one local event and return the new value.
    pub fn tick(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }

    /// Merge a remote stamp: `local = max(local, remote) + 1`.
    pub fn observe(&mut self, remote: u64) -> u64 {
        self.0 = self.0.max(remote) + 1;
        self.0
    }

    pub fn current(&self) -> u64 {
        self.0
    }
}

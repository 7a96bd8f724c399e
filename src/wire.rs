//! Bitcoin wire protocol codec.
//!
//! Implements the minimal message set the crawler needs: `version`, `verack`,
//! `getaddr` and `addr`. Every message is framed as
//!
//! ```text
//! 4 bytes   network magic
//! 12 bytes  ASCII command name, null padded
//! 4 bytes   payload length (LE)
//! 4 bytes   checksum = SHA256(SHA256(payload))[..4]   (version >= 209 only)
//! n bytes   payload
//! ```
//!
//! All integer fields are little-endian; ports inside addresses are
//! big-endian. Decoding distinguishes two failure modes:
//!
//! - [`DecodeError::Truncated`] — the buffer ends mid-field. Not a protocol
//!   violation: the stream reader keeps the bytes and waits for more.
//! - [`DecodeError::Malformed`] — the bytes can never become a valid message.
//!   The probe client treats this as a bannable violation.

use std::fmt;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};

use crate::netaddr::Endpoint;

/// Network magic marking the start of every message (mainnet).
pub const MAGIC: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];

/// Protocol version the crawler announces.
pub const PROTOCOL_VERSION: i32 = 70015;

/// Serialization version at which header checksums became mandatory.
pub const CHECKSUM_VERSION: i32 = 209;

/// Version at which addr entries carry a timestamp.
pub const ADDR_TIME_VERSION: i32 = 31402;

/// Version at which the sender address / nonce / subversion fields exist.
pub const FIELDS_VERSION: i32 = 106;

/// Hard cap on a declared payload length; larger is a protocol violation.
pub const MAX_PAYLOAD: u32 = 0x0200_0000;

/// Sanity cap on var-length strings (subversion is tiny in practice).
const MAX_STRING: u64 = 4096;

/// Cap on entries accepted from a single `addr` payload.
pub const MAX_ADDR_PER_MESSAGE: u64 = 1000;

/// Size of the header with checksum.
pub const HEADER_SIZE: usize = 24;

/// Size of the pre-209 header, which has no checksum field.
pub const LEGACY_HEADER_SIZE: usize = 20;

/// Header size in effect for a negotiated serialization version.
pub fn header_size(serial_version: i32) -> usize {
    if serial_version >= CHECKSUM_VERSION {
        HEADER_SIZE
    } else {
        LEGACY_HEADER_SIZE
    }
}

/// Decode failure taxonomy; see module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Ran out of bytes mid-field; retry once more data arrives.
    Truncated,
    /// Structurally invalid data; the peer is violating the protocol.
    Malformed(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "truncated message"),
            DecodeError::Malformed(why) => write!(f, "malformed message: {why}"),
        }
    }
}

impl std::error::Error for DecodeError {}

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// First four bytes of the double-SHA256 of the payload.
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = sha256d(payload);
    [hash[0], hash[1], hash[2], hash[3]]
}

// ============================================================================
// Reader
// ============================================================================

/// Cursor over a byte slice with truncation-aware primitive reads.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_u16_be(&mut self) -> Result<u16, DecodeError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DecodeError> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    pub fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    /// Bitcoin compact size.
    pub fn read_var_int(&mut self) -> Result<u64, DecodeError> {
        let first = self.read_u8()?;
        match first {
            0xfd => Ok(self.read_u16_le()? as u64),
            0xfe => Ok(self.read_u32_le()? as u64),
            0xff => Ok(self.read_u64_le()?),
            n => Ok(n as u64),
        }
    }

    /// Length-prefixed string; tolerates non-UTF8 by lossy conversion but
    /// rejects absurd lengths outright.
    pub fn read_var_str(&mut self) -> Result<String, DecodeError> {
        let len = self.read_var_int()?;
        if len > MAX_STRING {
            return Err(DecodeError::Malformed("string too long"));
        }
        let bytes = self.take(len as usize)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

// ============================================================================
// Message header
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: String,
    pub payload_len: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    /// Decode a header framed for `serial_version`: 24 bytes with checksum
    /// from 209 on, the legacy 20-byte checksum-less form below that. A
    /// wrong magic here is a violation, not a framing search.
    pub fn decode(r: &mut Reader<'_>, serial_version: i32) -> Result<Self, DecodeError> {
        let magic = r.read_bytes::<4>()?;
        let raw_command = r.read_bytes::<12>()?;
        let payload_len = r.read_u32_le()?;
        let checksum = if serial_version >= CHECKSUM_VERSION {
            r.read_bytes::<4>()?
        } else {
            [0u8; 4]
        };

        if magic != MAGIC {
            return Err(DecodeError::Malformed("bad magic"));
        }
        let end = raw_command
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(raw_command.len());
        // Null padding must run to the end of the field.
        if raw_command[end..].iter().any(|&b| b != 0) {
            return Err(DecodeError::Malformed("command not null padded"));
        }
        let command = std::str::from_utf8(&raw_command[..end])
            .map_err(|_| DecodeError::Malformed("command not ascii"))?;
        if !command.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(DecodeError::Malformed("command not ascii"));
        }
        if payload_len > MAX_PAYLOAD {
            return Err(DecodeError::Malformed("oversized payload"));
        }
        Ok(Self {
            magic,
            command: command.to_owned(),
            payload_len,
            checksum,
        })
    }
}

// ============================================================================
// Payload types
// ============================================================================

/// An address as gossiped on the wire: last-seen time, services, endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenAddress {
    pub timestamp: u32,
    pub services: u64,
    pub endpoint: Endpoint,
}

fn write_net_address(out: &mut Vec<u8>, services: u64, endpoint: &Endpoint) {
    out.extend_from_slice(&services.to_le_bytes());
    out.extend_from_slice(&endpoint.wire_bytes());
    out.extend_from_slice(&endpoint.port().to_be_bytes());
}

fn read_net_address(r: &mut Reader<'_>) -> Result<(u64, Endpoint), DecodeError> {
    let services = r.read_u64_le()?;
    let ip = r.read_bytes::<16>()?;
    let port = r.read_u16_be()?;
    Ok((services, Endpoint::from_wire_bytes(ip, port)))
}

/// The fields of a `version` message we care about. Trailing fields are
/// absent on peers older than the cutoffs that introduced them; absence is
/// valid, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub subversion: String,
    pub start_height: i32,
}

impl VersionMessage {
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let mut version = r.read_i32_le()?;
        let services = r.read_u64_le()?;
        let timestamp = r.read_i64_le()?;
        let (_addr_recv_services, _addr_recv) = read_net_address(r)?;
        // Historical quirk: 10300 announced itself in a broken scheme.
        if version == 10300 {
            version = 300;
        }

        let mut nonce = 1u64;
        let mut subversion = String::new();
        let mut start_height = 0i32;
        if version >= FIELDS_VERSION && !r.is_empty() {
            let (_from_services, _addr_from) = read_net_address(r)?;
            nonce = r.read_u64_le()?;
        }
        if version >= FIELDS_VERSION && !r.is_empty() {
            subversion = r.read_var_str()?;
        }
        if version >= CHECKSUM_VERSION && !r.is_empty() {
            start_height = r.read_i32_le()?;
        }

        Ok(Self {
            version,
            services,
            timestamp,
            nonce,
            subversion,
            start_height,
        })
    }
}

/// Decode an `addr` payload into raw entries. `serial_version` is the
/// negotiated stream version; timestamps only exist from 31402 on.
pub fn decode_addr(r: &mut Reader<'_>, serial_version: i32) -> Result<Vec<SeenAddress>, DecodeError> {
    let count = r.read_var_int()?;
    if count > MAX_ADDR_PER_MESSAGE {
        return Err(DecodeError::Malformed("addr count too large"));
    }
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let timestamp = if serial_version >= ADDR_TIME_VERSION {
            r.read_u32_le()?
        } else {
            0
        };
        let (services, endpoint) = read_net_address(r)?;
        entries.push(SeenAddress {
            timestamp,
            services,
            endpoint,
        });
    }
    Ok(entries)
}

// ============================================================================
// Message building
// ============================================================================

/// Frame a payload into a complete message. Peers below [`CHECKSUM_VERSION`]
/// get the legacy 20-byte header without a checksum field.
pub fn build_message(command: &str, payload: &[u8], serial_version: i32) -> Vec<u8> {
    debug_assert!(command.len() <= 12, "command too long");
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&MAGIC);
    let mut cmd = [0u8; 12];
    cmd[..command.len()].copy_from_slice(command.as_bytes());
    out.extend_from_slice(&cmd);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    if serial_version >= CHECKSUM_VERSION {
        out.extend_from_slice(&checksum(payload));
    }
    out.extend_from_slice(payload);
    out
}

/// Build the `version` payload announcing ourselves to `to`.
pub fn build_version_payload(
    to: &Endpoint,
    their_services: u64,
    nonce: u64,
    user_agent: &str,
    best_height: i32,
    timestamp: i64,
) -> Vec<u8> {
    let mut p = Vec::with_capacity(96 + user_agent.len());
    p.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    p.extend_from_slice(&0u64.to_le_bytes()); // we advertise no services
    p.extend_from_slice(&timestamp.to_le_bytes());
    write_net_address(&mut p, their_services, to);
    let me = Endpoint::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
    write_net_address(&mut p, 0, &me);
    p.extend_from_slice(&nonce.to_le_bytes());
    write_var_str(&mut p, user_agent);
    p.extend_from_slice(&best_height.to_le_bytes());
    p
}

pub fn write_var_int(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

fn write_var_str(out: &mut Vec<u8>, s: &str) {
    write_var_int(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

/// Encode an `addr` payload (used by the fake peer in tests and kept next to
/// the decoder so the two evolve together).
pub fn build_addr_payload(entries: &[SeenAddress], serial_version: i32) -> Vec<u8> {
    let mut p = Vec::new();
    write_var_int(&mut p, entries.len() as u64);
    for entry in entries {
        if serial_version >= ADDR_TIME_VERSION {
            p.extend_from_slice(&entry.timestamp.to_le_bytes());
        }
        write_net_address(&mut p, entry.services, &entry.endpoint);
    }
    p
}

//! Header Codec
//!
//! Responsibilities:
//! - Decode the handshake header carried in the first WebSocket frames
//! - Authenticate the client identifier against the active identity
//! - Extract the requested command and destination
//! - Provide the per-session body codec (response header, body framing)
//!
//! Decoding is sans-IO: the session feeds an accumulating buffer and the
//! codec answers with a decision, `NeedMoreData`, or a rejection. A header
//! split across any number of frames decodes exactly like a single frame.

pub mod vless;
pub mod vmess;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{Address, Result};
use crate::identity::Identity;

/// Address type tags shared by both framings
pub mod address_type {
    /// IPv4 address (4 bytes)
    pub const IPV4: u8 = 0x01;
    /// Domain name (length + ASCII)
    pub const DOMAIN: u8 = 0x02;
    /// IPv6 address (16 bytes)
    pub const IPV6: u8 = 0x03;
}

// ============================================================================
// Framing
// ============================================================================

/// Tunnel framing, selected once when the identity is resolved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Plain VLESS header, verbatim body
    #[default]
    Vless,
    /// VMess AEAD header, chunked body
    Vmess,
}

impl Framing {
    /// Decode a handshake from the accumulated buffer
    pub fn decode(&self, buf: &[u8], identity: &Identity) -> std::result::Result<Decoded, HeaderError> {
        match self {
            Framing::Vless => vless::decode(buf, identity),
            Framing::Vmess => vmess::decode(buf, identity),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Framing::Vless => "vless",
            Framing::Vmess => "vmess",
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Framing {
    type Err = HeaderError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vless" => Ok(Framing::Vless),
            "vmess" => Ok(Framing::Vmess),
            _ => Err(HeaderError::Malformed("unknown framing")),
        }
    }
}

// ============================================================================
// Header types
// ============================================================================

/// Requested command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// TCP connection (CONNECT)
    Tcp = 0x01,
    /// UDP packet relay (rejected)
    Udp = 0x02,
    /// Multiplexed connection (rejected)
    Mux = 0x03,
}

impl Command {
    pub fn from_byte(b: u8) -> std::result::Result<Self, HeaderError> {
        match b {
            0x01 => Ok(Self::Tcp),
            0x02 => Ok(Self::Udp),
            0x03 => Ok(Self::Mux),
            _ => Err(HeaderError::UnsupportedCommand(b)),
        }
    }

    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
            Self::Mux => write!(f, "MUX"),
        }
    }
}

/// Parsed handshake header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeHeader {
    /// Protocol version byte as sent by the client
    pub version: u8,
    /// Client identifier (already verified against the identity)
    pub client_id: [u8; 16],
    /// Extra instruction segment (VLESS addons), kept opaque
    pub instruction: Vec<u8>,
    /// Requested command
    pub command: Command,
    /// Destination host and port
    pub destination: Address,
}

/// A successfully decoded handshake
pub struct Handshake {
    pub header: HandshakeHeader,
    /// Offset in the buffer where payload bytes begin
    pub payload_offset: usize,
    /// Body codec for the rest of the session
    pub codec: TunnelCodec,
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("header", &self.header)
            .field("payload_offset", &self.payload_offset)
            .finish_non_exhaustive()
    }
}

/// Decoder decision
#[derive(Debug)]
pub enum Decoded {
    /// Keep the buffer and wait for more frames
    NeedMoreData,
    /// Header complete
    Complete(Handshake),
}

/// Handshake rejection reasons.
///
/// Logged locally only; the client sees a protocol-error close either way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    #[error("client identifier mismatch")]
    IdentityMismatch,

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("invalid address type {0:#04x}")]
    InvalidAddressType(u8),

    #[error("invalid port 0")]
    InvalidPort,

    #[error("invalid domain name")]
    InvalidDomain,

    #[error("unsupported security {0:#04x}")]
    UnsupportedSecurity(u8),

    #[error("unsupported option {0:#04x}")]
    UnsupportedOption(u8),

    #[error("malformed header: {0}")]
    Malformed(&'static str),
}

// ============================================================================
// Body codec
// ============================================================================

/// Per-session body codec produced by a successful handshake.
///
/// Splits into an opener (client to destination) and a sealer (destination
/// to client) so the two relay directions can run concurrently.
pub struct TunnelCodec {
    opener: BodyOpener,
    sealer: BodySealer,
}

impl TunnelCodec {
    pub(crate) fn new(opener: BodyOpener, sealer: BodySealer) -> Self {
        Self { opener, sealer }
    }

    /// See [`BodyOpener::open`]
    pub fn open(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<bool> {
        self.opener.open(data, out)
    }

    /// See [`BodySealer::seal`]
    pub fn seal(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.sealer.seal(data, out)
    }

    pub fn response_sent(&self) -> bool {
        self.sealer.response_sent()
    }

    pub fn split(self) -> (BodyOpener, BodySealer) {
        (self.opener, self.sealer)
    }
}

/// Client-to-destination half of the body codec
pub enum BodyOpener {
    /// Body bytes are the payload
    Passthrough,
    /// VMess chunk stream
    Vmess(vmess::body::ChunkReader),
}

impl BodyOpener {
    /// Convert client bytes to plaintext, appending to `out`.
    ///
    /// Returns `true` once the client signalled end of stream.
    pub fn open(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<bool> {
        match self {
            BodyOpener::Passthrough => {
                out.extend_from_slice(data);
                Ok(false)
            }
            BodyOpener::Vmess(reader) => reader.feed(data, out),
        }
    }
}

/// Destination-to-client half of the body codec
pub enum BodySealer {
    Vless(vless::VlessCodec),
    Vmess(Box<vmess::VmessSealer>),
}

impl BodySealer {
    /// Convert plaintext to client bytes, appending to `out`.
    ///
    /// The first call also emits the response header, ahead of the payload.
    pub fn seal(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        match self {
            BodySealer::Vless(codec) => {
                codec.seal(data, out);
                Ok(())
            }
            BodySealer::Vmess(sealer) => sealer.seal(data, out),
        }
    }

    /// Bytes announcing end of stream to the client, if the framing has any
    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            BodySealer::Vless(_) => Ok(()),
            BodySealer::Vmess(sealer) => sealer.finish(out),
        }
    }

    /// Whether the response header has been emitted
    pub fn response_sent(&self) -> bool {
        match self {
            BodySealer::Vless(codec) => codec.response_sent(),
            BodySealer::Vmess(sealer) => sealer.response_sent(),
        }
    }
}

// ============================================================================
// Decoding helpers
// ============================================================================

/// Bounds-checked reader over a byte slice. `None` means "not enough bytes".
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let bytes = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    pub(crate) fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    pub(crate) fn u16(&mut self) -> Option<u16> {
        self.array::<2>().map(u16::from_be_bytes)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Some(out)
    }
}

/// Read `port(2) | addr_type(1) | addr`.
///
/// `Ok(None)` when the buffer ends before the address does.
pub(crate) fn read_destination(
    cur: &mut Cursor<'_>,
) -> std::result::Result<Option<Address>, HeaderError> {
    let Some(port) = cur.u16() else { return Ok(None) };
    let Some(atyp) = cur.u8() else { return Ok(None) };

    let address = match atyp {
        address_type::IPV4 => {
            let Some(octets) = cur.array::<4>() else { return Ok(None) };
            Address::ip_port(IpAddr::V4(Ipv4Addr::from(octets)), port)
        }
        address_type::DOMAIN => {
            let Some(len) = cur.u8() else { return Ok(None) };
            if len == 0 {
                return Err(HeaderError::InvalidDomain);
            }
            let Some(raw) = cur.take(len as usize) else { return Ok(None) };
            if !raw.iter().all(|b| b.is_ascii_graphic()) {
                return Err(HeaderError::InvalidDomain);
            }
            // ASCII checked above
            let domain = String::from_utf8_lossy(raw).into_owned();
            Address::Domain(domain, port)
        }
        address_type::IPV6 => {
            let Some(octets) = cur.array::<16>() else { return Ok(None) };
            Address::ip_port(IpAddr::V6(Ipv6Addr::from(octets)), port)
        }
        other => return Err(HeaderError::InvalidAddressType(other)),
    };

    if port == 0 {
        return Err(HeaderError::InvalidPort);
    }
    Ok(Some(address))
}

/// Append `port(2) | addr_type(1) | addr`
pub(crate) fn write_destination(
    destination: &Address,
    out: &mut Vec<u8>,
) -> std::result::Result<(), HeaderError> {
    out.extend_from_slice(&destination.port().to_be_bytes());
    match destination {
        Address::Socket(addr) => match addr.ip() {
            IpAddr::V4(ip) => {
                out.push(address_type::IPV4);
                out.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                out.push(address_type::IPV6);
                out.extend_from_slice(&ip.octets());
            }
        },
        Address::Domain(domain, _) => {
            if domain.is_empty() || domain.len() > 255 {
                return Err(HeaderError::InvalidDomain);
            }
            out.push(address_type::DOMAIN);
            out.push(domain.len() as u8);
            out.extend_from_slice(domain.as_bytes());
        }
    }
    Ok(())
}

//! VMess framing (AEAD header, alter_id = 0)
//!
//! Inner request header, after AEAD opening:
//!
//! ```text
//! +-----+--------+---------+-----------+--------+------------------+----------+
//! | VER | IV(16) | KEY(16) | RESP_AUTH | OPTION | PAD<<4 | SECURITY | RESERVED |
//! +-----+--------+---------+-----------+--------+------------------+----------+
//! | CMD | PORT(2) | ATYP | ADDR | PADDING | FNV1A(4) |
//! +-----+---------+------+------+---------+----------+
//! ```
//!
//! The client identifier never appears on the wire. A header is attributed
//! to the identity when its auth ID opens under the identity's command key.

pub mod aead;
pub mod body;

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use tracing::debug;
use uuid::Uuid;

use crate::common::{Address, Result};
use crate::identity::Identity;

use self::aead::{AUTH_ID_LEN, NONCE_LEN, REQUEST_PREFIX_LEN, SEALED_LEN_LEN, TAG_LEN};
use self::body::{BodyParams, ChunkReader, ChunkWriter};
use super::{
    read_destination, write_destination, BodyOpener, BodySealer, Command, Cursor, Decoded,
    Handshake, HandshakeHeader, HeaderError, TunnelCodec,
};

/// Inner header version
pub const VERSION: u8 = 1;

/// Accepted clock drift between client and server, in seconds
pub const MAX_TIME_DRIFT: i64 = 120;

/// Largest inner header accepted
const MAX_HEADER_LEN: usize = 2048;

const CMD_KEY_SALT: &[u8] = b"c48619fe-8f02-49e0-b9e9-edf763e17e21";

/// Request option bits
pub mod option {
    pub const CHUNK_STREAM: u8 = 0x01;
    pub const CONNECTION_REUSE: u8 = 0x02;
    pub const CHUNK_MASKING: u8 = 0x04;
    pub const GLOBAL_PADDING: u8 = 0x08;
    pub const AUTHENTICATED_LENGTH: u8 = 0x10;
}

/// Body security
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    Aes128Gcm,
    Chacha20Poly1305,
    None,
}

impl Security {
    pub fn from_byte(b: u8) -> std::result::Result<Self, HeaderError> {
        match b {
            0x03 => Ok(Security::Aes128Gcm),
            0x04 => Ok(Security::Chacha20Poly1305),
            // "zero" is sent as none by current clients; accept both
            0x05 | 0x06 => Ok(Security::None),
            other => Err(HeaderError::UnsupportedSecurity(other)),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Security::Aes128Gcm => 0x03,
            Security::Chacha20Poly1305 => 0x04,
            Security::None => 0x05,
        }
    }
}

/// Derive the command key: `MD5(uuid || salt)`
pub fn cmd_key(id: &Uuid) -> [u8; 16] {
    let mut ctx = md5::Context::new();
    ctx.consume(id.as_bytes());
    ctx.consume(CMD_KEY_SALT);
    ctx.compute().0
}

/// FNV-1a 32-bit
fn fnv1a(data: &[u8]) -> u32 {
    data.iter().fold(0x811c_9dc5u32, |hash, b| {
        (hash ^ *b as u32).wrapping_mul(0x0100_0193)
    })
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

// ============================================================================
// Request
// ============================================================================

/// Decoded (or to-be-encoded) inner request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub body_iv: [u8; 16],
    pub body_key: [u8; 16],
    pub response_auth: u8,
    pub options: u8,
    pub padding_len: u8,
    pub security: Security,
    pub command: Command,
    pub destination: Address,
}

impl Request {
    /// New TCP request with fresh random key material
    pub fn new(destination: Address, security: Security, options: u8) -> Self {
        let mut rng = rand::thread_rng();
        let mut body_iv = [0u8; 16];
        let mut body_key = [0u8; 16];
        rng.fill_bytes(&mut body_iv);
        rng.fill_bytes(&mut body_key);
        Self {
            body_iv,
            body_key,
            response_auth: (rng.next_u32() & 0xff) as u8,
            options,
            padding_len: (rng.next_u32() % 16) as u8,
            security,
            command: Command::Tcp,
            destination,
        }
    }

    /// Encode the plaintext inner header, checksum included
    fn encode_inner(&self) -> std::result::Result<Vec<u8>, HeaderError> {
        let mut out = Vec::with_capacity(64);
        out.push(VERSION);
        out.extend_from_slice(&self.body_iv);
        out.extend_from_slice(&self.body_key);
        out.push(self.response_auth);
        out.push(self.options);
        out.push((self.padding_len << 4) | self.security.to_byte());
        out.push(0);
        out.push(self.command.as_byte());
        write_destination(&self.destination, &mut out)?;

        let start = out.len();
        out.resize(start + self.padding_len as usize, 0);
        rand::thread_rng().fill_bytes(&mut out[start..]);

        let hash = fnv1a(&out);
        out.extend_from_slice(&hash.to_be_bytes());
        Ok(out)
    }

    /// Seal the request header for the wire (client direction)
    pub fn encode(&self, cmd_key: &[u8; 16], timestamp: i64) -> Result<Vec<u8>> {
        let inner = self.encode_inner()?;
        aead::seal_request_header(cmd_key, &inner, timestamp)
    }

    /// Body parameters for the client-to-server direction
    pub fn request_body(&self) -> BodyParams {
        self.body_params(self.body_key, self.body_iv)
    }

    /// Body parameters for the server-to-client direction
    pub fn response_body(&self) -> BodyParams {
        self.body_params(
            aead::response_material(&self.body_key),
            aead::response_material(&self.body_iv),
        )
    }

    fn body_params(&self, key: [u8; 16], iv: [u8; 16]) -> BodyParams {
        BodyParams {
            security: self.security,
            key,
            iv,
            chunked: self.options & option::CHUNK_STREAM != 0,
            masking: self.options & option::CHUNK_MASKING != 0,
            padding: self.options & option::GLOBAL_PADDING != 0,
        }
    }

    fn parse(inner: &[u8]) -> std::result::Result<Self, HeaderError> {
        const TRUNCATED: HeaderError = HeaderError::Malformed("truncated inner header");

        let mut cur = Cursor::new(inner);
        let version = cur.u8().ok_or(TRUNCATED)?;
        if version != VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }
        let body_iv = cur.array::<16>().ok_or(TRUNCATED)?;
        let body_key = cur.array::<16>().ok_or(TRUNCATED)?;
        let response_auth = cur.u8().ok_or(TRUNCATED)?;
        let options = cur.u8().ok_or(TRUNCATED)?;
        let pad_security = cur.u8().ok_or(TRUNCATED)?;
        let _reserved = cur.u8().ok_or(TRUNCATED)?;
        let command = Command::from_byte(cur.u8().ok_or(TRUNCATED)?)?;
        let destination = read_destination(&mut cur)?.ok_or(TRUNCATED)?;

        let padding_len = pad_security >> 4;
        cur.take(padding_len as usize).ok_or(TRUNCATED)?;

        let checked = cur.position();
        let expected = cur.array::<4>().map(u32::from_be_bytes).ok_or(TRUNCATED)?;
        if fnv1a(&inner[..checked]) != expected {
            return Err(HeaderError::Malformed("header checksum mismatch"));
        }

        let security = Security::from_byte(pad_security & 0x0f)?;
        if options & option::AUTHENTICATED_LENGTH != 0 {
            return Err(HeaderError::UnsupportedOption(option::AUTHENTICATED_LENGTH));
        }
        if options & option::CHUNK_STREAM == 0 && security != Security::None {
            return Err(HeaderError::UnsupportedOption(options));
        }

        Ok(Self {
            body_iv,
            body_key,
            response_auth,
            options,
            padding_len,
            security,
            command,
            destination,
        })
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a VMess handshake using the current clock
pub fn decode(buf: &[u8], identity: &Identity) -> std::result::Result<Decoded, HeaderError> {
    decode_at(buf, identity, unix_now())
}

/// Decode a VMess handshake as of `now` (unix seconds)
pub fn decode_at(
    buf: &[u8],
    identity: &Identity,
    now: i64,
) -> std::result::Result<Decoded, HeaderError> {
    if buf.len() < REQUEST_PREFIX_LEN {
        return Ok(Decoded::NeedMoreData);
    }
    let key = identity.cmd_key();

    let mut auth_id = [0u8; AUTH_ID_LEN];
    auth_id.copy_from_slice(&buf[..AUTH_ID_LEN]);
    let timestamp =
        aead::open_auth_id(key, &auth_id).map_err(|_| HeaderError::IdentityMismatch)?;
    if (now - timestamp).abs() > MAX_TIME_DRIFT {
        debug!("VMess auth ID outside time window: drift={}s", now - timestamp);
        return Err(HeaderError::IdentityMismatch);
    }

    let sealed_len = &buf[AUTH_ID_LEN..AUTH_ID_LEN + SEALED_LEN_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&buf[AUTH_ID_LEN + SEALED_LEN_LEN..REQUEST_PREFIX_LEN]);

    let header_len = aead::open_header_length(key, &auth_id, &nonce, sealed_len)
        .map_err(|_| HeaderError::IdentityMismatch)? as usize;
    if header_len > MAX_HEADER_LEN {
        return Err(HeaderError::Malformed("header too large"));
    }

    let end = REQUEST_PREFIX_LEN + header_len + TAG_LEN;
    if buf.len() < end {
        return Ok(Decoded::NeedMoreData);
    }

    let inner = aead::open_header_payload(key, &auth_id, &nonce, &buf[REQUEST_PREFIX_LEN..end])
        .map_err(|_| HeaderError::Malformed("header authentication failed"))?;
    let request = Request::parse(&inner)?;
    if request.command != Command::Tcp {
        return Err(HeaderError::UnsupportedCommand(request.command.as_byte()));
    }

    debug!(
        "VMess header: security={:?}, options={:#04x}, dest={}",
        request.security, request.options, request.destination
    );

    let codec = codec(&request).map_err(|_| HeaderError::Malformed("body setup"))?;
    let header = HandshakeHeader {
        version: VERSION,
        client_id: *identity.id_bytes(),
        instruction: Vec::new(),
        command: request.command,
        destination: request.destination,
    };

    Ok(Decoded::Complete(Handshake {
        header,
        payload_offset: end,
        codec,
    }))
}

// ============================================================================
// Body codec
// ============================================================================

fn codec(request: &Request) -> Result<TunnelCodec> {
    let response = request.response_body();
    let response_header = aead::seal_response_header(
        &response.key,
        &response.iv,
        &[request.response_auth, 0, 0, 0],
    )?;
    let sealer = VmessSealer {
        writer: ChunkWriter::new(&response)?,
        response_header: Some(response_header),
    };
    Ok(TunnelCodec::new(
        BodyOpener::Vmess(ChunkReader::new(&request.request_body())?),
        BodySealer::Vmess(Box::new(sealer)),
    ))
}

/// Server-to-client half of a VMess body
pub struct VmessSealer {
    writer: ChunkWriter,
    response_header: Option<Vec<u8>>,
}

impl VmessSealer {
    pub fn seal(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.flush_header(out);
        self.writer.write(data, out)
    }

    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        self.flush_header(out);
        self.writer.finish(out)
    }

    pub fn response_sent(&self) -> bool {
        self.response_header.is_none()
    }

    fn flush_header(&mut self, out: &mut Vec<u8>) {
        if let Some(header) = self.response_header.take() {
            out.extend_from_slice(&header);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Framing;

    const NOW: i64 = 1_760_000_000;

    fn identity() -> Identity {
        let id = Uuid::parse_str("d342d11e-d424-4583-b36e-524ab1f0afa4").unwrap();
        Identity::new(id, Framing::Vmess)
    }

    fn request() -> Request {
        Request::new(
            Address::domain("example.com", 443),
            Security::Aes128Gcm,
            option::CHUNK_STREAM | option::CHUNK_MASKING | option::GLOBAL_PADDING,
        )
    }

    fn complete(decoded: Decoded) -> Handshake {
        match decoded {
            Decoded::Complete(h) => h,
            Decoded::NeedMoreData => panic!("expected complete header"),
        }
    }

    #[test]
    fn test_cmd_key_matches_md5_of_uuid_and_salt() {
        let id = identity().id();
        let mut data = id.as_bytes().to_vec();
        data.extend_from_slice(CMD_KEY_SALT);
        assert_eq!(cmd_key(&id), md5::compute(&data).0);
    }

    #[test]
    fn test_fnv1a_known_value() {
        assert_eq!(fnv1a(b""), 0x811c9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c292c);
    }

    #[test]
    fn test_decode_request_and_payload_offset() {
        let identity = identity();
        let req = request();
        let mut wire = req.encode(identity.cmd_key(), NOW).unwrap();
        let header_len = wire.len();
        wire.extend_from_slice(b"early");

        let handshake = complete(decode_at(&wire, &identity, NOW + 30).unwrap());
        assert_eq!(handshake.header.destination, Address::domain("example.com", 443));
        assert_eq!(handshake.header.command, Command::Tcp);
        assert_eq!(handshake.payload_offset, header_len);
    }

    #[test]
    fn test_decode_split_delivery_needs_more_data() {
        let identity = identity();
        let wire = request().encode(identity.cmd_key(), NOW).unwrap();
        for cut in [0, 1, 15, 41, 42, wire.len() - 1] {
            assert!(
                matches!(decode_at(&wire[..cut], &identity, NOW), Ok(Decoded::NeedMoreData)),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_decode_wrong_identity_or_stale_clock() {
        let identity = identity();
        let other = Identity::new(Uuid::new_v4(), Framing::Vmess);
        let wire = request().encode(other.cmd_key(), NOW).unwrap();
        assert_eq!(
            decode_at(&wire, &identity, NOW).unwrap_err(),
            HeaderError::IdentityMismatch
        );

        let wire = request().encode(identity.cmd_key(), NOW).unwrap();
        assert_eq!(
            decode_at(&wire, &identity, NOW + MAX_TIME_DRIFT + 1).unwrap_err(),
            HeaderError::IdentityMismatch
        );
    }

    #[test]
    fn test_decode_rejects_udp_and_legacy_security() {
        let identity = identity();

        let mut udp = request();
        udp.command = Command::Udp;
        let wire = udp.encode(identity.cmd_key(), NOW).unwrap();
        assert_eq!(
            decode_at(&wire, &identity, NOW).unwrap_err(),
            HeaderError::UnsupportedCommand(0x02)
        );

        let mut raw_aead = request();
        raw_aead.options = 0;
        let wire = raw_aead.encode(identity.cmd_key(), NOW).unwrap();
        assert!(matches!(
            decode_at(&wire, &identity, NOW).unwrap_err(),
            HeaderError::UnsupportedOption(_)
        ));
    }

    #[test]
    fn test_codec_response_header_then_chunks() {
        let identity = identity();
        let req = request();
        let wire = req.encode(identity.cmd_key(), NOW).unwrap();
        let mut codec = complete(decode_at(&wire, &identity, NOW).unwrap()).codec;

        // Client -> server
        let mut client_writer = ChunkWriter::new(&req.request_body()).unwrap();
        let mut upstream = Vec::new();
        client_writer.write(b"GET / HTTP/1.1\r\n\r\n", &mut upstream).unwrap();
        let mut plain = Vec::new();
        assert!(!codec.open(&upstream, &mut plain).unwrap());
        assert_eq!(plain, b"GET / HTTP/1.1\r\n\r\n");

        // Server -> client: header on the first seal only
        assert!(!codec.response_sent());
        let mut downstream = Vec::new();
        codec.seal(b"HTTP/1.1 200 OK", &mut downstream).unwrap();
        codec.seal(b"\r\n\r\n", &mut downstream).unwrap();
        assert!(codec.response_sent());

        let resp = req.response_body();
        let (header, used) = aead::open_response_header(&resp.key, &resp.iv, &downstream)
            .unwrap()
            .unwrap();
        assert_eq!(header, vec![req.response_auth, 0, 0, 0]);

        let mut client_reader = ChunkReader::new(&resp).unwrap();
        let mut received = Vec::new();
        client_reader.feed(&downstream[used..], &mut received).unwrap();
        assert_eq!(received, b"HTTP/1.1 200 OK\r\n\r\n");
    }
}

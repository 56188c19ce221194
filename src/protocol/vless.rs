//! VLESS framing
//!
//! Request header:
//!
//! ```text
//! +---------+--------+----------+--------+-----+---------+------+------+
//! | VERSION |  UUID  | ADDONS_L | ADDONS | CMD | PORT(2) | ATYP | ADDR |
//! +---------+--------+----------+--------+-----+---------+------+------+
//! |    1    |   16   |    1     |   N    |  1  |    2    |  1   | var  |
//! +---------+--------+----------+--------+-----+---------+------+------+
//! ```
//!
//! Response header is `VERSION | 0x00`, sent once ahead of the first
//! downstream bytes. The body is carried verbatim in both directions.

use subtle::ConstantTimeEq;

use crate::identity::Identity;

use super::{
    read_destination, write_destination, BodyOpener, BodySealer, Command, Cursor, Decoded,
    Handshake, HandshakeHeader, HeaderError, TunnelCodec,
};

/// Only supported version
pub const VERSION: u8 = 0;

/// Smallest possible header: one-byte domain, no addons
pub const MIN_HEADER_LEN: usize = 1 + 16 + 1 + 1 + 2 + 1 + 1 + 1;

/// Decode a VLESS request header from the accumulated buffer
pub fn decode(buf: &[u8], identity: &Identity) -> Result<Decoded, HeaderError> {
    if buf.len() < MIN_HEADER_LEN {
        return Ok(Decoded::NeedMoreData);
    }
    let mut cur = Cursor::new(buf);

    // Fixed prefix is present, these reads cannot fail
    let version = cur.u8().unwrap_or_default();
    if version != VERSION {
        return Err(HeaderError::UnsupportedVersion(version));
    }

    let client_id = cur.array::<16>().unwrap_or_default();
    if !bool::from(client_id.ct_eq(identity.id_bytes())) {
        return Err(HeaderError::IdentityMismatch);
    }

    let addons_len = cur.u8().unwrap_or_default() as usize;
    let Some(instruction) = cur.take(addons_len) else {
        return Ok(Decoded::NeedMoreData);
    };

    let Some(command) = cur.u8() else {
        return Ok(Decoded::NeedMoreData);
    };
    let command = Command::from_byte(command)?;
    if command != Command::Tcp {
        return Err(HeaderError::UnsupportedCommand(command.as_byte()));
    }

    let Some(destination) = read_destination(&mut cur)? else {
        return Ok(Decoded::NeedMoreData);
    };

    Ok(Decoded::Complete(Handshake {
        header: HandshakeHeader {
            version,
            client_id,
            instruction: instruction.to_vec(),
            command,
            destination,
        },
        payload_offset: cur.position(),
        codec: TunnelCodec::new(
            BodyOpener::Passthrough,
            BodySealer::Vless(VlessCodec::new(version)),
        ),
    }))
}

/// Encode a request header (client direction)
pub fn encode_request(header: &HandshakeHeader) -> Result<Vec<u8>, HeaderError> {
    let addons_len = u8::try_from(header.instruction.len())
        .map_err(|_| HeaderError::Malformed("addons too long"))?;

    let mut out = Vec::with_capacity(MIN_HEADER_LEN + header.instruction.len() + 16);
    out.push(header.version);
    out.extend_from_slice(&header.client_id);
    out.push(addons_len);
    out.extend_from_slice(&header.instruction);
    out.push(header.command.as_byte());
    write_destination(&header.destination, &mut out)?;
    Ok(out)
}

/// Response header for a request of `version`
pub fn encode_response(version: u8) -> [u8; 2] {
    [version, 0]
}

/// VLESS body codec: passthrough plus a one-time response header
#[derive(Debug)]
pub struct VlessCodec {
    pending_response: Option<[u8; 2]>,
}

impl VlessCodec {
    pub fn new(version: u8) -> Self {
        Self {
            pending_response: Some(encode_response(version)),
        }
    }

    pub fn seal(&mut self, data: &[u8], out: &mut Vec<u8>) {
        if let Some(header) = self.pending_response.take() {
            out.extend_from_slice(&header);
        }
        out.extend_from_slice(data);
    }

    pub fn response_sent(&self) -> bool {
        self.pending_response.is_none()
    }
}

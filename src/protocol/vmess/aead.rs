//! VMess AEAD header sealing
//!
//! Request header on the wire:
//!
//! ```text
//! auth_id(16) | sealed_len(2+16) | nonce(8) | sealed_header(len+16)
//! ```
//!
//! The response header is `sealed_len(2+16) | sealed_payload(len+16)`,
//! keyed from the response body key and IV.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit as BlockKeyInit};
use aes::Aes128;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
use crc32fast::Hasher as Crc32Hasher;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const KDF_SALT: &[u8] = b"VMess AEAD KDF";
const SALT_AUTH_ID_KEY: &[u8] = b"AES Auth ID Encryption";
const SALT_HEADER_KEY: &[u8] = b"VMess Header AEAD Key";
const SALT_HEADER_IV: &[u8] = b"VMess Header AEAD Nonce";
const SALT_HEADER_LEN_KEY: &[u8] = b"VMess Header AEAD Key_Length";
const SALT_HEADER_LEN_IV: &[u8] = b"VMess Header AEAD Nonce_Length";
const SALT_RESP_LEN_KEY: &[u8] = b"AEAD Resp Header Len Key";
const SALT_RESP_LEN_IV: &[u8] = b"AEAD Resp Header Len IV";
const SALT_RESP_KEY: &[u8] = b"AEAD Resp Header Key";
const SALT_RESP_IV: &[u8] = b"AEAD Resp Header IV";

/// Authentication tag length of every AEAD seal
pub const TAG_LEN: usize = 16;
/// Sealed 2-byte length field
pub const SEALED_LEN_LEN: usize = 2 + TAG_LEN;
/// Connection nonce length
pub const NONCE_LEN: usize = 8;
/// Auth ID length
pub const AUTH_ID_LEN: usize = 16;
/// Bytes in front of the sealed header payload
pub const REQUEST_PREFIX_LEN: usize = AUTH_ID_LEN + SEALED_LEN_LEN + NONCE_LEN;

const HMAC_BLOCK: usize = 64;

// ============================================================================
// KDF
// ============================================================================

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Nested HMAC-SHA256 key derivation.
///
/// With no path this is `HMAC(KDF_SALT, key)`. Each path element wraps
/// the previous HMAC as the hash function of a new HMAC keyed by that
/// element, so the last element is the outermost layer.
pub fn kdf(key: &[u8], path: &[&[u8]]) -> [u8; 32] {
    let Some((outer, inner_path)) = path.split_last() else {
        return hmac_sha256(KDF_SALT, key);
    };

    let mut block_key = [0u8; HMAC_BLOCK];
    if outer.len() > HMAC_BLOCK {
        block_key[..32].copy_from_slice(&Sha256::digest(outer));
    } else {
        block_key[..outer.len()].copy_from_slice(outer);
    }

    let mut inner = Vec::with_capacity(HMAC_BLOCK + key.len());
    inner.extend(block_key.iter().map(|b| b ^ 0x36));
    inner.extend_from_slice(key);
    let inner_hash = kdf(&inner, inner_path);

    let mut outer_msg = Vec::with_capacity(HMAC_BLOCK + inner_hash.len());
    outer_msg.extend(block_key.iter().map(|b| b ^ 0x5c));
    outer_msg.extend_from_slice(&inner_hash);
    kdf(&outer_msg, inner_path)
}

/// First 16 bytes of [`kdf`]
pub fn kdf16(key: &[u8], path: &[&[u8]]) -> [u8; 16] {
    let full = kdf(key, path);
    let mut out = [0u8; 16];
    out.copy_from_slice(&full[..16]);
    out
}

// ============================================================================
// AES-128-GCM helpers
// ============================================================================

fn gcm_seal(key: &[u8; 16], iv: &[u8], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes128Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?;
    cipher
        .encrypt(Nonce::from_slice(&iv[..12]), Payload { msg, aad })
        .map_err(|_| Error::Crypto("Encryption failed".into()))
}

fn gcm_open(key: &[u8; 16], iv: &[u8], msg: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes128Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?;
    cipher
        .decrypt(Nonce::from_slice(&iv[..12]), Payload { msg, aad })
        .map_err(|_| Error::Crypto("Authentication failed".into()))
}

fn read_len(plain: &[u8]) -> Result<u16> {
    match plain {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(Error::Crypto("Invalid sealed length".into())),
    }
}

// ============================================================================
// Auth ID
// ============================================================================

fn auth_id_cipher(cmd_key: &[u8; 16]) -> Result<Aes128> {
    let key = kdf16(cmd_key, &[SALT_AUTH_ID_KEY]);
    Aes128::new_from_slice(&key).map_err(|e| Error::Crypto(format!("Invalid key: {}", e)))
}

/// Build an auth ID: `AES(timestamp(8) | random(4) | crc32(4))`
pub fn create_auth_id(cmd_key: &[u8; 16], timestamp: i64) -> Result<[u8; 16]> {
    let mut block = [0u8; AUTH_ID_LEN];
    block[..8].copy_from_slice(&timestamp.to_be_bytes());
    rand::thread_rng().fill_bytes(&mut block[8..12]);

    let mut crc = Crc32Hasher::new();
    crc.update(&block[..12]);
    block[12..].copy_from_slice(&crc.finalize().to_be_bytes());

    auth_id_cipher(cmd_key)?.encrypt_block(aes::Block::from_mut_slice(&mut block));
    Ok(block)
}

/// Decrypt an auth ID and return its timestamp if the checksum holds
pub fn open_auth_id(cmd_key: &[u8; 16], auth_id: &[u8; 16]) -> Result<i64> {
    let mut block = *auth_id;
    auth_id_cipher(cmd_key)?.decrypt_block(aes::Block::from_mut_slice(&mut block));

    let mut crc = Crc32Hasher::new();
    crc.update(&block[..12]);
    let expected = crc.finalize().to_be_bytes();
    if block[12..] != expected {
        return Err(Error::Crypto("Auth ID checksum mismatch".into()));
    }

    let mut ts = [0u8; 8];
    ts.copy_from_slice(&block[..8]);
    Ok(i64::from_be_bytes(ts))
}

// ============================================================================
// Request header
// ============================================================================

/// Open the sealed request header length
pub fn open_header_length(
    cmd_key: &[u8; 16],
    auth_id: &[u8; 16],
    nonce: &[u8; 8],
    sealed: &[u8],
) -> Result<u16> {
    let key = kdf16(cmd_key, &[SALT_HEADER_LEN_KEY, auth_id, nonce]);
    let iv = kdf(cmd_key, &[SALT_HEADER_LEN_IV, auth_id, nonce]);
    read_len(&gcm_open(&key, &iv, sealed, auth_id)?)
}

/// Open the sealed request header payload
pub fn open_header_payload(
    cmd_key: &[u8; 16],
    auth_id: &[u8; 16],
    nonce: &[u8; 8],
    sealed: &[u8],
) -> Result<Vec<u8>> {
    let key = kdf16(cmd_key, &[SALT_HEADER_KEY, auth_id, nonce]);
    let iv = kdf(cmd_key, &[SALT_HEADER_IV, auth_id, nonce]);
    gcm_open(&key, &iv, sealed, auth_id)
}

/// Seal a plaintext request header (client direction)
pub fn seal_request_header(cmd_key: &[u8; 16], header: &[u8], timestamp: i64) -> Result<Vec<u8>> {
    let len = u16::try_from(header.len())
        .map_err(|_| Error::Crypto("Request header too large".into()))?;
    let auth_id = create_auth_id(cmd_key, timestamp)?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let len_key = kdf16(cmd_key, &[SALT_HEADER_LEN_KEY, &auth_id, &nonce]);
    let len_iv = kdf(cmd_key, &[SALT_HEADER_LEN_IV, &auth_id, &nonce]);
    let sealed_len = gcm_seal(&len_key, &len_iv, &len.to_be_bytes(), &auth_id)?;

    let key = kdf16(cmd_key, &[SALT_HEADER_KEY, &auth_id, &nonce]);
    let iv = kdf(cmd_key, &[SALT_HEADER_IV, &auth_id, &nonce]);
    let sealed = gcm_seal(&key, &iv, header, &auth_id)?;

    let mut out = Vec::with_capacity(REQUEST_PREFIX_LEN + sealed.len());
    out.extend_from_slice(&auth_id);
    out.extend_from_slice(&sealed_len);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

// ============================================================================
// Response header
// ============================================================================

/// Derive the response body key or IV from the request one
pub fn response_material(request: &[u8; 16]) -> [u8; 16] {
    let digest = Sha256::digest(request);
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// Seal the response header (server direction)
pub fn seal_response_header(resp_key: &[u8; 16], resp_iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    let len = data.len() as u16;

    let len_key = kdf16(resp_key, &[SALT_RESP_LEN_KEY]);
    let len_iv = kdf(resp_iv, &[SALT_RESP_LEN_IV]);
    let mut out = gcm_seal(&len_key, &len_iv, &len.to_be_bytes(), &[])?;

    let key = kdf16(resp_key, &[SALT_RESP_KEY]);
    let iv = kdf(resp_iv, &[SALT_RESP_IV]);
    out.extend_from_slice(&gcm_seal(&key, &iv, data, &[])?);
    Ok(out)
}

/// Open a sealed response header, returning the plaintext and bytes consumed.
///
/// `Ok(None)` when `buf` does not yet hold the whole header.
pub fn open_response_header(
    resp_key: &[u8; 16],
    resp_iv: &[u8; 16],
    buf: &[u8],
) -> Result<Option<(Vec<u8>, usize)>> {
    if buf.len() < SEALED_LEN_LEN {
        return Ok(None);
    }
    let len_key = kdf16(resp_key, &[SALT_RESP_LEN_KEY]);
    let len_iv = kdf(resp_iv, &[SALT_RESP_LEN_IV]);
    let len = read_len(&gcm_open(&len_key, &len_iv, &buf[..SEALED_LEN_LEN], &[])?)? as usize;

    let end = SEALED_LEN_LEN + len + TAG_LEN;
    if buf.len() < end {
        return Ok(None);
    }
    let key = kdf16(resp_key, &[SALT_RESP_KEY]);
    let iv = kdf(resp_iv, &[SALT_RESP_IV]);
    let plain = gcm_open(&key, &iv, &buf[SEALED_LEN_LEN..end], &[])?;
    Ok(Some((plain, end)))
}

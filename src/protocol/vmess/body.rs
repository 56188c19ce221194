//! VMess body chunks
//!
//! With the chunk-stream option each chunk is `size(2) | sealed | padding`.
//! `size` covers the sealed bytes plus padding and is XOR-masked with a
//! SHAKE128 stream seeded by the body IV when masking is negotiated. The
//! padding length is drawn from the same stream, before the mask.
//!
//! An empty sealed chunk (or size 0 for plain security) ends the stream.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
use bytes::{Buf, BytesMut};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake128;

use crate::error::{Error, Result};

use super::Security;

/// Largest plaintext carried by one outbound chunk
pub const MAX_CHUNK_PAYLOAD: usize = 16 * 1024 - 1;

const TAG_LEN: usize = 16;

// ============================================================================
// Chunk cipher
// ============================================================================

enum ChunkCipher {
    Aes128Gcm(Box<Aes128Gcm>),
    ChaCha20(Box<ChaCha20Poly1305>),
    Plain,
}

impl ChunkCipher {
    fn new(security: Security, key: &[u8; 16]) -> Result<Self> {
        let cipher = match security {
            Security::Aes128Gcm => ChunkCipher::Aes128Gcm(Box::new(
                Aes128Gcm::new_from_slice(key)
                    .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?,
            )),
            Security::Chacha20Poly1305 => ChunkCipher::ChaCha20(Box::new(
                ChaCha20Poly1305::new_from_slice(&chacha_key(key))
                    .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?,
            )),
            Security::None => ChunkCipher::Plain,
        };
        Ok(cipher)
    }

    fn overhead(&self) -> usize {
        match self {
            ChunkCipher::Plain => 0,
            _ => TAG_LEN,
        }
    }

    fn seal(&self, nonce: &[u8; 12], data: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            ChunkCipher::Aes128Gcm(c) => c.encrypt(nonce, data),
            ChunkCipher::ChaCha20(c) => c.encrypt(nonce, data),
            ChunkCipher::Plain => return Ok(data.to_vec()),
        }
        .map_err(|_| Error::Crypto("Chunk encryption failed".into()))
    }

    fn open(&self, nonce: &[u8; 12], data: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            ChunkCipher::Aes128Gcm(c) => c.decrypt(nonce, data),
            ChunkCipher::ChaCha20(c) => c.decrypt(nonce, data),
            ChunkCipher::Plain => return Ok(data.to_vec()),
        }
        .map_err(|_| Error::Crypto("Chunk authentication failed".into()))
    }
}

/// ChaCha20 key: `md5(key) | md5(md5(key))`
fn chacha_key(key: &[u8; 16]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let first = md5::compute(key);
    out[..16].copy_from_slice(&first.0);
    out[16..].copy_from_slice(&md5::compute(first.0).0);
    out
}

// ============================================================================
// Per-direction state
// ============================================================================

struct ShakeMask {
    reader: Box<dyn XofReader + Send>,
}

impl ShakeMask {
    fn new(iv: &[u8; 16]) -> Self {
        let mut shake = Shake128::default();
        shake.update(iv);
        Self {
            reader: Box::new(shake.finalize_xof()),
        }
    }

    fn next_u16(&mut self) -> u16 {
        let mut buf = [0u8; 2];
        self.reader.read(&mut buf);
        u16::from_be_bytes(buf)
    }
}

/// Options and key material for one direction of the body
#[derive(Debug, Clone, Copy)]
pub struct BodyParams {
    pub security: Security,
    pub key: [u8; 16],
    pub iv: [u8; 16],
    /// Chunk-stream framing (otherwise the body is raw)
    pub chunked: bool,
    /// Size masking
    pub masking: bool,
    /// Random padding (only with masking)
    pub padding: bool,
}

struct Direction {
    cipher: ChunkCipher,
    iv: [u8; 16],
    count: u16,
    shake: Option<ShakeMask>,
    padding: bool,
}

impl Direction {
    fn new(params: &BodyParams) -> Result<Self> {
        Ok(Self {
            cipher: ChunkCipher::new(params.security, &params.key)?,
            iv: params.iv,
            count: 0,
            shake: params.masking.then(|| ShakeMask::new(&params.iv)),
            padding: params.padding && params.masking,
        })
    }

    fn next_nonce(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..2].copy_from_slice(&self.count.to_be_bytes());
        nonce[2..].copy_from_slice(&self.iv[2..12]);
        self.count = self.count.wrapping_add(1);
        nonce
    }

    /// Padding length then size mask, in stream order
    fn next_size_params(&mut self) -> (usize, u16) {
        match self.shake.as_mut() {
            Some(shake) => {
                let padding = if self.padding { (shake.next_u16() % 64) as usize } else { 0 };
                (padding, shake.next_u16())
            }
            None => (0, 0),
        }
    }
}

// ============================================================================
// Reader (client -> server)
// ============================================================================

/// Incremental chunk decoder
pub struct ChunkReader {
    dir: Option<Direction>,
    buf: BytesMut,
    /// Decoded size and padding of the chunk being collected
    pending: Option<(usize, usize)>,
    eof: bool,
}

impl ChunkReader {
    pub fn new(params: &BodyParams) -> Result<Self> {
        Ok(Self {
            dir: if params.chunked { Some(Direction::new(params)?) } else { None },
            buf: BytesMut::new(),
            pending: None,
            eof: false,
        })
    }

    /// Feed wire bytes, appending any complete plaintext to `out`.
    ///
    /// Returns `true` once the end-of-stream chunk has been read; bytes
    /// after it are ignored.
    pub fn feed(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<bool> {
        if self.eof {
            return Ok(true);
        }
        let Some(dir) = self.dir.as_mut() else {
            out.extend_from_slice(data);
            return Ok(false);
        };
        self.buf.extend_from_slice(data);

        loop {
            let (size, padding) = match self.pending {
                Some(pending) => pending,
                None => {
                    if self.buf.len() < 2 {
                        return Ok(false);
                    }
                    let masked = self.buf.get_u16();
                    let (padding, mask) = dir.next_size_params();
                    let size = (masked ^ mask) as usize;
                    self.pending = Some((size, padding));
                    (size, padding)
                }
            };

            if size == 0 {
                self.eof = true;
                return Ok(true);
            }
            if size < padding + dir.cipher.overhead() {
                return Err(Error::Crypto(format!("Chunk size {} too small", size)));
            }
            if self.buf.len() < size {
                return Ok(false);
            }

            let chunk = self.buf.split_to(size);
            self.pending = None;
            let nonce = dir.next_nonce();
            let plain = dir.cipher.open(&nonce, &chunk[..size - padding])?;
            if plain.is_empty() {
                self.eof = true;
                return Ok(true);
            }
            out.extend_from_slice(&plain);
        }
    }
}

// ============================================================================
// Writer (server -> client)
// ============================================================================

/// Chunk encoder
pub struct ChunkWriter {
    dir: Option<Direction>,
}

impl ChunkWriter {
    pub fn new(params: &BodyParams) -> Result<Self> {
        Ok(Self {
            dir: if params.chunked { Some(Direction::new(params)?) } else { None },
        })
    }

    /// Encode plaintext into one or more chunks appended to `out`
    pub fn write(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if self.dir.is_none() {
            out.extend_from_slice(data);
            return Ok(());
        }
        for piece in data.chunks(MAX_CHUNK_PAYLOAD) {
            self.write_chunk(piece, out)?;
        }
        Ok(())
    }

    /// Append the end-of-stream chunk
    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<()> {
        match self.dir.as_ref().map(|d| d.cipher.overhead()) {
            None => Ok(()),
            Some(0) => {
                if let Some(dir) = self.dir.as_mut() {
                    let (_, mask) = dir.next_size_params();
                    out.extend_from_slice(&mask.to_be_bytes());
                }
                Ok(())
            }
            Some(_) => self.write_chunk(&[], out),
        }
    }

    fn write_chunk(&mut self, piece: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let Some(dir) = self.dir.as_mut() else {
            return Ok(());
        };
        let (padding, mask) = dir.next_size_params();
        let nonce = dir.next_nonce();
        let sealed = dir.cipher.seal(&nonce, piece)?;

        let size = (sealed.len() + padding) as u16;
        out.extend_from_slice(&(size ^ mask).to_be_bytes());
        out.extend_from_slice(&sealed);
        if padding > 0 {
            let start = out.len();
            out.resize(start + padding, 0);
            rand::thread_rng().fill_bytes(&mut out[start..]);
        }
        Ok(())
    }
}

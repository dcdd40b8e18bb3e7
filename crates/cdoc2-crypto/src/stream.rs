//! Streaming payload encryption: STREAM (BE32) over ChaCha20-Poly1305
//!
//! Wire layout of the payload section:
//! ```text
//! [7 bytes: nonce prefix]
//! [segment 0: 64 KiB ciphertext][16-byte tag]
//! ...
//! [last segment: 0..=64 KiB ciphertext][16-byte tag]   (last-block flag set)
//! ```
//! Every segment is authenticated with the same AAD
//! (`"CDOC20payload" || header || header_hmac`), so the payload cannot be
//! moved under a different header. Reordering, dropping, or appending
//! segments fails authentication because the segment counter and the
//! last-block flag are part of each nonce.

use std::io::{self, Read, Write};

use cdoc2_core::{Cdoc2Error, Cdoc2Result};
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::stream::{DecryptorBE32, EncryptorBE32};
use chacha20poly1305::aead::{KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;

use crate::keys::ContentEncryptionKey;
use crate::TAG_SIZE;

/// Nonce prefix length for STREAM BE32 over a 12-byte-nonce AEAD.
pub const NONCE_PREFIX_LEN: usize = 7;

/// Plaintext bytes per segment.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Ciphertext bytes per full segment.
pub const SEGMENT_LEN: usize = CHUNK_SIZE + TAG_SIZE;

const PAYLOAD_AAD_PREFIX: &[u8] = b"CDOC20payload";

/// Additional data bound to every payload segment.
pub fn payload_aad(header: &[u8], header_hmac: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(PAYLOAD_AAD_PREFIX.len() + header.len() + header_hmac.len());
    aad.extend_from_slice(PAYLOAD_AAD_PREFIX);
    aad.extend_from_slice(header);
    aad.extend_from_slice(header_hmac);
    aad
}

fn cipher(cek: &ContentEncryptionKey) -> Cdoc2Result<ChaCha20Poly1305> {
    ChaCha20Poly1305::new_from_slice(cek.as_bytes())
        .map_err(|e| Cdoc2Error::Crypto(format!("content encryption key rejected: {e}")))
}

/// Encrypts everything written to it and forwards the ciphertext to `inner`.
///
/// `finish` must be called to seal the last segment; dropping the writer
/// without it leaves a payload that will never verify.
pub struct EncryptingWriter<W: Write> {
    inner: W,
    encryptor: Option<EncryptorBE32<ChaCha20Poly1305>>,
    aad: Vec<u8>,
    buffer: Vec<u8>,
    segments: u64,
}

impl<W: Write> EncryptingWriter<W> {
    /// Write a fresh nonce prefix to `inner` and start a new stream.
    pub fn new(mut inner: W, cek: &ContentEncryptionKey, aad: Vec<u8>) -> Cdoc2Result<Self> {
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        rand::rngs::OsRng.fill_bytes(&mut prefix);
        inner.write_all(&prefix)?;

        let encryptor =
            EncryptorBE32::from_aead(cipher(cek)?, GenericArray::from_slice(&prefix));

        Ok(Self {
            inner,
            encryptor: Some(encryptor),
            aad,
            buffer: Vec::with_capacity(CHUNK_SIZE),
            segments: 0,
        })
    }

    /// Seal the buffered tail as the last segment and hand back the sink.
    pub fn finish(mut self) -> Cdoc2Result<W> {
        let encryptor = self
            .encryptor
            .take()
            .ok_or_else(|| Cdoc2Error::Crypto("payload stream already finished".into()))?;

        let sealed = encryptor
            .encrypt_last(Payload {
                msg: &self.buffer,
                aad: &self.aad,
            })
            .map_err(|_| Cdoc2Error::Crypto("payload encryption failed".into()))?;
        self.inner.write_all(&sealed)?;
        self.inner.flush()?;
        self.buffer.clear();

        tracing::debug!(segments = self.segments + 1, "payload stream sealed");
        Ok(self.inner)
    }

    /// Encrypt a full buffer as a non-final segment.
    fn seal_segment(&mut self) -> io::Result<()> {
        let encryptor = self.encryptor.as_mut().ok_or_else(|| {
            Cdoc2Error::Crypto("payload stream already finished".into()).into_io()
        })?;

        let sealed = encryptor
            .encrypt_next(Payload {
                msg: &self.buffer,
                aad: &self.aad,
            })
            .map_err(|_| Cdoc2Error::Crypto("payload encryption failed".into()).into_io())?;
        self.inner.write_all(&sealed)?;
        self.buffer.clear();
        self.segments += 1;
        Ok(())
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut input = buf;
        while !input.is_empty() {
            // A full segment is only sealed once more data is known to follow,
            // so the tail always goes out with the last-block flag.
            if self.buffer.len() == CHUNK_SIZE {
                self.seal_segment()?;
            }
            let take = (CHUNK_SIZE - self.buffer.len()).min(input.len());
            self.buffer.extend_from_slice(&input[..take]);
            input = &input[take..];
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypts and authenticates a payload stream segment by segment.
///
/// Plaintext handed out before the final segment is verified is
/// unauthenticated; consumers must not commit anything until
/// [`DecryptingReader::is_verified`] returns true.
pub struct DecryptingReader<R: Read> {
    inner: R,
    decryptor: Option<DecryptorBE32<ChaCha20Poly1305>>,
    aad: Vec<u8>,
    ciphertext: Vec<u8>,
    plaintext: Vec<u8>,
    pos: usize,
    eof: bool,
    segments: u64,
    verified: bool,
    failure: Option<String>,
}

impl<R: Read> DecryptingReader<R> {
    /// Read the nonce prefix from `inner` and prepare to decrypt.
    pub fn new(mut inner: R, cek: &ContentEncryptionKey, aad: Vec<u8>) -> Cdoc2Result<Self> {
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        inner.read_exact(&mut prefix).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Cdoc2Error::Integrity("payload truncated before nonce prefix".into())
            } else {
                Cdoc2Error::Io(e)
            }
        })?;

        let decryptor =
            DecryptorBE32::from_aead(cipher(cek)?, GenericArray::from_slice(&prefix));

        Ok(Self {
            inner,
            decryptor: Some(decryptor),
            aad,
            ciphertext: Vec::with_capacity(SEGMENT_LEN + 1),
            plaintext: Vec::new(),
            pos: 0,
            eof: false,
            segments: 0,
            verified: false,
            failure: None,
        })
    }

    /// True once the last segment has authenticated.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// The authentication failure, if one has been hit.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn fail(&mut self, msg: String) -> io::Error {
        tracing::warn!(segment = self.segments, "{msg}");
        self.decryptor = None;
        self.plaintext.clear();
        self.pos = 0;
        self.failure = Some(msg.clone());
        Cdoc2Error::Integrity(msg).into_io()
    }

    /// Buffer ciphertext until a full segment plus one byte is available
    /// (so the segment is known not to be last) or the source ends.
    fn fill_ciphertext(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; 8192];
        while !self.eof && self.ciphertext.len() <= SEGMENT_LEN {
            let want = (SEGMENT_LEN + 1 - self.ciphertext.len()).min(chunk.len());
            match self.inner.read(&mut chunk[..want]) {
                Ok(0) => self.eof = true,
                Ok(n) => self.ciphertext.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn open_next_segment(&mut self) -> io::Result<()> {
        self.fill_ciphertext()?;

        if self.ciphertext.len() > SEGMENT_LEN {
            let segment: Vec<u8> = self.ciphertext.drain(..SEGMENT_LEN).collect();
            let opened = match self.decryptor.as_mut() {
                Some(decryptor) => decryptor.decrypt_next(Payload {
                    msg: &segment,
                    aad: &self.aad,
                }),
                None => return Ok(()),
            };
            match opened {
                Ok(plain) => {
                    self.plaintext = plain;
                    self.pos = 0;
                    self.segments += 1;
                    Ok(())
                }
                Err(_) => Err(self.fail(format!(
                    "payload authentication failed at segment {}",
                    self.segments
                ))),
            }
        } else {
            if self.ciphertext.len() < TAG_SIZE {
                return Err(self.fail("payload truncated".into()));
            }
            let Some(decryptor) = self.decryptor.take() else {
                return Ok(());
            };
            let segment = std::mem::take(&mut self.ciphertext);
            match decryptor.decrypt_last(Payload {
                msg: &segment,
                aad: &self.aad,
            }) {
                Ok(plain) => {
                    self.plaintext = plain;
                    self.pos = 0;
                    self.segments += 1;
                    self.verified = true;
                    tracing::debug!(segments = self.segments, "payload stream verified");
                    Ok(())
                }
                Err(_) => Err(self.fail(format!(
                    "payload authentication failed at final segment {}",
                    self.segments
                ))),
            }
        }
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.plaintext.len() {
                let n = (self.plaintext.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&self.plaintext[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if let Some(msg) = &self.failure {
                return Err(Cdoc2Error::Integrity(msg.clone()).into_io());
            }
            if self.decryptor.is_none() {
                return Ok(0);
            }
            self.open_next_segment()?;
        }
    }
}

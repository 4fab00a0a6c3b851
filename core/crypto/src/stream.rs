//! Chunked AES-256-GCM stream encryption for container bodies.
//!
//! # Format
//! After the [`FileHeader`], the body is a sequence of chunks
//! `[nonce 12][plain len i32 LE][ciphertext][tag 16]` covering exactly
//! `original_length` plaintext bytes, terminated by the footer `ENDFFLOCK`.
//! Each chunk is authenticated independently under a fresh random nonce.

use std::io::{ErrorKind, Read, Write};

use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::aead::{Cipher, NONCE_SIZE, TAG_SIZE};
use crate::header::FileHeader;
use crate::keys::FileKey;
use crate::random::SecureCrypto;
use fflocker_common::{Error, Result};

/// Default plaintext chunk size (4 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Largest chunk length accepted when decrypting (64 MiB).
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Container footer magic.
pub const FOOTER: &[u8; 9] = b"ENDFFLOCK";

/// Stream encrypt/decrypt engine for container files.
#[derive(Debug, Clone)]
pub struct FileCipher {
    chunk_size: usize,
}

impl FileCipher {
    /// Create a cipher with the default chunk size.
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Set custom chunk size, clamped to `1..=MAX_CHUNK_SIZE`.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    /// Current chunk size.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Write `header`, then encrypt everything `reader` yields.
    ///
    /// Cancellation is checked before every chunk.
    ///
    /// # Errors
    /// - [`Error::Cancelled`] if `cancel` fires
    /// - [`Error::Integrity`] if the source length differs from `header.original_length`
    /// - I/O errors from reader/writer
    pub fn encrypt_stream<R: Read, W: Write>(
        &self,
        mut reader: R,
        mut writer: W,
        key: &FileKey,
        header: &FileHeader,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let cipher = Cipher::new(key.as_bytes());
        let crypto = SecureCrypto::new();

        header.write_to(&mut writer)?;

        let mut buffer = Zeroizing::new(vec![0u8; self.chunk_size]);
        let mut total = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let n = read_full(&mut reader, &mut buffer)?;
            if n == 0 {
                break;
            }

            let nonce = crypto.nonce();
            let tag = cipher.seal_in_place(&nonce, &mut buffer[..n])?;

            writer.write_all(&nonce)?;
            writer.write_all(&(n as i32).to_le_bytes())?;
            writer.write_all(&buffer[..n])?;
            writer.write_all(&tag)?;
            total += n as u64;

            if n < buffer.len() {
                break;
            }
        }

        if total != header.original_length as u64 {
            return Err(Error::Integrity(format!(
                "source yielded {} bytes, header records {}",
                total, header.original_length
            )));
        }

        writer.write_all(FOOTER)?;
        writer.flush()?;
        Ok(total)
    }

    /// Decrypt the body following an already-parsed header.
    ///
    /// Each chunk is verified before any of its plaintext is written, so a
    /// failed chunk produces no output.
    ///
    /// # Errors
    /// - [`Error::Authentication`] if any chunk fails verification
    /// - [`Error::Integrity`] on truncation, bad chunk length or footer mismatch
    /// - [`Error::Cancelled`] if `cancel` fires
    pub fn decrypt_stream<R: Read, W: Write>(
        &self,
        mut reader: R,
        mut writer: W,
        key: &FileKey,
        original_length: u64,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let cipher = Cipher::new(key.as_bytes());
        let mut buffer = Zeroizing::new(Vec::new());
        let mut written = 0u64;

        while written < original_length {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let mut nonce = [0u8; NONCE_SIZE];
            read_body(&mut reader, &mut nonce, "chunk nonce")?;

            let mut len = [0u8; 4];
            read_body(&mut reader, &mut len, "chunk length")?;
            let len = i32::from_le_bytes(len);
            if len <= 0 || len as usize > MAX_CHUNK_SIZE {
                return Err(Error::Integrity(format!("invalid chunk length: {}", len)));
            }
            let len = len as usize;

            buffer.resize(len, 0);
            read_body(&mut reader, &mut buffer[..], "chunk ciphertext")?;

            let mut tag = [0u8; TAG_SIZE];
            read_body(&mut reader, &mut tag, "chunk tag")?;

            cipher.open_in_place(&nonce, &mut buffer[..], &tag)?;

            let to_write = (len as u64).min(original_length - written) as usize;
            writer.write_all(&buffer[..to_write])?;
            written += to_write as u64;
        }

        let mut footer = [0u8; FOOTER.len()];
        read_body(&mut reader, &mut footer, "footer")?;
        if &footer != FOOTER {
            return Err(Error::Integrity(
                "container is corrupt or truncated: footer is invalid".to_string(),
            ));
        }

        writer.flush()?;
        Ok(written)
    }
}

impl Default for FileCipher {
    fn default() -> Self {
        Self::new()
    }
}

/// Read until `buf` is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Read exactly `buf.len()` body bytes; a short read is an integrity error.
fn read_body<R: Read>(reader: &mut R, buf: &mut [u8], field: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => Error::Integrity(format!("container truncated at {}", field)),
        _ => Error::Io(e),
    })
}

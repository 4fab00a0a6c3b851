//! Authenticated encryption using AES-256-GCM.
//!
//! The container format stores nonce, ciphertext and tag as separate
//! fields, so this module works with detached tags throughout. No
//! associated data is bound.

use aes_gcm::{
    aead::{generic_array::GenericArray, AeadInPlace, KeyInit},
    Aes256Gcm,
};

use crate::keys::KEY_LENGTH;
use fflocker_common::{Error, Result};

/// Nonce size for AES-GCM (12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// AES-256-GCM instance keyed once and reused across chunks.
pub struct Cipher {
    inner: Aes256Gcm,
}

impl Cipher {
    /// Key a new cipher.
    pub fn new(key: &[u8; KEY_LENGTH]) -> Self {
        Self {
            inner: Aes256Gcm::new(GenericArray::from_slice(key)),
        }
    }

    /// Encrypt `buffer` in place and return the detached tag.
    ///
    /// # Security
    /// - Caller is responsible for nonce uniqueness under this key
    pub fn seal_in_place(&self, nonce: &[u8; NONCE_SIZE], buffer: &mut [u8]) -> Result<[u8; TAG_SIZE]> {
        let tag = self
            .inner
            .encrypt_in_place_detached(GenericArray::from_slice(nonce), &[], buffer)
            .map_err(|e| Error::InvalidInput(format!("Encryption failed: {}", e)))?;

        let mut out = [0u8; TAG_SIZE];
        out.copy_from_slice(&tag);
        Ok(out)
    }

    /// Verify `tag` and decrypt `buffer` in place.
    ///
    /// On failure the buffer content is unspecified and must be discarded.
    ///
    /// # Errors
    /// - [`Error::Authentication`] if the tag does not verify
    pub fn open_in_place(
        &self,
        nonce: &[u8; NONCE_SIZE],
        buffer: &mut [u8],
        tag: &[u8; TAG_SIZE],
    ) -> Result<()> {
        self.inner
            .decrypt_in_place_detached(
                GenericArray::from_slice(nonce),
                &[],
                buffer,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| Error::Authentication("AEAD tag verification failed".to_string()))
    }
}

/// Encrypt `plaintext`, returning ciphertext of equal length and the tag.
pub fn seal(
    key: &[u8; KEY_LENGTH],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_SIZE])> {
    let mut buffer = plaintext.to_vec();
    let tag = Cipher::new(key).seal_in_place(nonce, &mut buffer)?;
    Ok((buffer, tag))
}

/// Decrypt `ciphertext` with its detached `tag`.
///
/// # Errors
/// - [`Error::Authentication`] on wrong key or tampered input
pub fn open(
    key: &[u8; KEY_LENGTH],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    tag: &[u8; TAG_SIZE],
) -> Result<Vec<u8>> {
    let mut buffer = ciphertext.to_vec();
    Cipher::new(key).open_in_place(nonce, &mut buffer, tag)?;
    Ok(buffer)
}

//! Access to the process-wide CSPRNG.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::aead::NONCE_SIZE;
use crate::keys::Salt;

/// Fill `buffer` from the operating system CSPRNG.
pub fn fill(buffer: &mut [u8]) {
    OsRng.fill_bytes(buffer);
}

/// CSPRNG wrapper used for salts, nonces and obfuscated file names.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecureCrypto;

impl SecureCrypto {
    /// Create a new handle to the system CSPRNG.
    pub fn new() -> Self {
        Self
    }

    /// Fill `buffer` with random bytes.
    pub fn fill(&self, buffer: &mut [u8]) {
        fill(buffer);
    }

    /// URL-safe random text of exactly `len` characters.
    ///
    /// Used as the obfuscated on-disk name of a container.
    pub fn secure_filename(&self, len: usize) -> String {
        let mut bytes = vec![0u8; len];
        fill(&mut bytes);
        let mut encoded = URL_SAFE_NO_PAD.encode(&bytes);
        // len random bytes always encode to at least len characters.
        encoded.truncate(len);
        encoded
    }

    /// 32 fresh random bytes for a FileSalt.
    pub fn file_salt(&self) -> Salt {
        Salt::generate()
    }

    /// A fresh 96-bit AEAD nonce.
    pub fn nonce(&self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        fill(&mut nonce);
        nonce
    }
}

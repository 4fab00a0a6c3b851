//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use fflocker_common::{Error, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of global and per-file salts in bytes.
pub const SALT_LENGTH: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Master key of one locked item.
///
/// Derived from the password and the item's GlobalSalt, or recovered
/// through a biometric unwrap. Never persisted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LENGTH],
}

impl MasterKey {
    /// Create a master key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Create a master key from a slice.
    ///
    /// # Errors
    /// - Returns error if the slice is not KEY_LENGTH bytes
    pub fn from_slice(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LENGTH {
            return Err(Error::InvalidInput(format!(
                "Invalid key length: expected {}, got {}",
                KEY_LENGTH,
                key.len()
            )));
        }
        let mut bytes = [0u8; KEY_LENGTH];
        bytes.copy_from_slice(key);
        Ok(Self { key: bytes })
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Derive the content key of one file.
    ///
    /// `FileKey = HMAC-SHA256(master, relative_path || file_salt)`. The
    /// relative path is the UTF-8 string stored in the container header, so
    /// the key is recomputed on unlock from the decrypted path.
    pub fn derive_file_key(&self, relative_path: &str, file_salt: &Salt) -> Result<FileKey> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
            .map_err(|e| Error::Derivation(format!("file key derivation failed: {}", e)))?;
        mac.update(relative_path.as_bytes());
        mac.update(file_salt.as_bytes());

        let mut derived = [0u8; KEY_LENGTH];
        derived.copy_from_slice(&mac.finalize().into_bytes());
        Ok(FileKey::from_bytes(derived))
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

/// Key for encrypting file contents.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FileKey {
    key: [u8; KEY_LENGTH],
}

impl FileKey {
    /// Create a file key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileKey([REDACTED])")
    }
}

/// 32-byte salt: the per-item GlobalSalt or a per-file FileSalt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt(pub [u8; SALT_LENGTH]);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        let mut salt = [0u8; SALT_LENGTH];
        crate::random::fill(&mut salt);
        Self(salt)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_file_key_deterministic() {
        let master = MasterKey::from_bytes([1u8; KEY_LENGTH]);
        let salt = Salt::from_bytes([9u8; SALT_LENGTH]);

        let key1 = master.derive_file_key("docs/a.txt", &salt).unwrap();
        let key2 = master.derive_file_key("docs/a.txt", &salt).unwrap();
        assert_eq!(key1.as_bytes(), key2.as_bytes());

        let other_path = master.derive_file_key("docs/b.txt", &salt).unwrap();
        assert_ne!(key1.as_bytes(), other_path.as_bytes());

        let other_salt = master
            .derive_file_key("docs/a.txt", &Salt::from_bytes([8u8; SALT_LENGTH]))
            .unwrap();
        assert_ne!(key1.as_bytes(), other_salt.as_bytes());
    }

    #[test]
    fn test_derive_file_key_is_hmac_sha256() {
        let master = MasterKey::from_bytes([0x0bu8; KEY_LENGTH]);
        let salt = Salt::from_bytes([0u8; SALT_LENGTH]);
        let key = master.derive_file_key("a", &salt).unwrap();

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&[0x0bu8; KEY_LENGTH]).unwrap();
        mac.update(b"a");
        mac.update(&[0u8; SALT_LENGTH]);
        assert_eq!(key.as_bytes().as_slice(), mac.finalize().into_bytes().as_slice());
    }

    #[test]
    fn test_master_key_from_slice_length() {
        assert!(MasterKey::from_slice(&[0u8; 16]).is_err());
        assert!(MasterKey::from_slice(&[0u8; KEY_LENGTH]).is_ok());
    }

    #[test]
    fn test_debug_is_redacted() {
        let master = MasterKey::from_bytes([0xAAu8; KEY_LENGTH]);
        assert_eq!(format!("{:?}", master), "MasterKey([REDACTED])");
    }

    #[test]
    fn test_salt_generate() {
        let salt1 = Salt::generate();
        let salt2 = Salt::generate();

        // Random salts should be different
        assert_ne!(salt1.as_bytes(), salt2.as_bytes());
    }
}

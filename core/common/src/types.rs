//! Common types used throughout FFLocker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use zeroize::Zeroize;

use crate::{Error, Result};

/// Owner of secret byte storage.
///
/// The bytes are overwritten with zeros when the buffer is released or
/// dropped. Any access after release returns [`Error::State`].
pub struct SecureBuffer {
    data: Option<Vec<u8>>,
}

impl SecureBuffer {
    /// Allocate a zero-filled buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            data: Some(vec![0u8; len]),
        }
    }

    /// Take ownership of existing secret bytes.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data: Some(data) }
    }

    /// Take ownership of a secret string, typically a password.
    pub fn from_string(secret: String) -> Self {
        Self::from_vec(secret.into_bytes())
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        self.data
            .as_deref()
            .ok_or_else(|| Error::State("secure buffer already released".to_string()))
    }

    /// Get a mutable reference to the inner bytes.
    pub fn as_mut_bytes(&mut self) -> Result<&mut [u8]> {
        self.data
            .as_deref_mut()
            .ok_or_else(|| Error::State("secure buffer already released".to_string()))
    }

    /// Get the length.
    pub fn len(&self) -> Result<usize> {
        self.as_bytes().map(<[u8]>::len)
    }

    /// Check if empty.
    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|len| len == 0)
    }

    /// Zero and drop the contents. Idempotent.
    pub fn release(&mut self) {
        if let Some(mut data) = self.data.take() {
            data.zeroize();
        }
    }

    /// Whether [`release`](Self::release) has run.
    pub fn is_released(&self) -> bool {
        self.data.is_none()
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            Some(data) => write!(f, "SecureBuffer([REDACTED; {} bytes])", data.len()),
            None => write!(f, "SecureBuffer(released)"),
        }
    }
}

/// Registry entry mapping an original item to its locked form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedItemRecord {
    /// Path of the item before locking.
    pub original_path: PathBuf,
    /// Path of the container (file) or marked folder after locking.
    pub locked_path: PathBuf,
    /// Whether the item is a folder.
    pub is_folder: bool,
    /// When the item was locked.
    pub locked_at: DateTime<Utc>,
}

impl LockedItemRecord {
    /// Create a record stamped with the current time.
    pub fn new(original_path: impl Into<PathBuf>, locked_path: impl Into<PathBuf>, is_folder: bool) -> Self {
        Self {
            original_path: original_path.into(),
            locked_path: locked_path.into(),
            is_folder,
            locked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_buffer_access() {
        let mut buffer = SecureBuffer::new(4);
        buffer.as_mut_bytes().unwrap().copy_from_slice(b"abcd");
        assert_eq!(buffer.as_bytes().unwrap(), b"abcd");
        assert_eq!(buffer.len().unwrap(), 4);
    }

    #[test]
    fn test_secure_buffer_release_is_state_error() {
        let mut buffer = SecureBuffer::from_string("hunter2".to_string());
        buffer.release();

        assert!(buffer.is_released());
        assert!(matches!(buffer.as_bytes(), Err(Error::State(_))));
        assert!(matches!(buffer.as_mut_bytes(), Err(Error::State(_))));

        // A second release is a no-op.
        buffer.release();
    }

    #[test]
    fn test_secure_buffer_debug_redacts() {
        let buffer = SecureBuffer::from_vec(b"secret".to_vec());
        let rendered = format!("{:?}", buffer);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("6 bytes"));
    }

    #[test]
    fn test_record_serialization() {
        let record = LockedItemRecord::new("/home/a/docs", "/home/a/docs_LOCKED", true);
        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: LockedItemRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, record);
    }
}

//! Container header codec.
//!
//! # Format
//! ```text
//! magic "FFLOCKER" (8) | version (1) | global salt (32) | file salt (32)
//! path nonce (12) | path len u16 | encrypted path (len) | path tag (16)
//! original length i64 | biometric flag (1) | [key len u16 | wrapped key]
//! ```
//! Integers are little-endian. The wrapped-key fields are present only when
//! the biometric flag is 1.

use std::io::{ErrorKind, Read, Write};

use crate::aead::{self, NONCE_SIZE, TAG_SIZE};
use crate::keys::{MasterKey, Salt, SALT_LENGTH};
use crate::random::SecureCrypto;
use fflocker_common::{Error, Result};

/// Header magic bytes.
pub const MAGIC: &[u8; 8] = b"FFLOCKER";

/// Container format version.
pub const FORMAT_VERSION: u8 = 1;

/// Per-file container header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Salt of the password derivation, identical across one item.
    pub global_salt: Salt,
    /// Salt of this file's key derivation.
    pub file_salt: Salt,
    /// Nonce used to encrypt the relative path.
    pub path_nonce: [u8; NONCE_SIZE],
    /// Relative path encrypted under the master key.
    pub encrypted_path: Vec<u8>,
    /// Tag of the encrypted path.
    pub path_tag: [u8; TAG_SIZE],
    /// Plaintext length of the file.
    pub original_length: i64,
    /// Master key wrapped under the biometric key, if enabled.
    pub biometric_key: Option<Vec<u8>>,
}

impl FileHeader {
    /// Build a header, encrypting `relative_path` under the master key.
    ///
    /// The path is sealed with the master key rather than the file key so
    /// that unlock can recover it before the file key exists.
    pub fn seal(
        master_key: &MasterKey,
        global_salt: Salt,
        file_salt: Salt,
        relative_path: &str,
        original_length: i64,
    ) -> Result<Self> {
        let path_bytes = relative_path.as_bytes();
        if path_bytes.len() > u16::MAX as usize {
            return Err(Error::InvalidInput(format!(
                "relative path is {} bytes, limit is {}",
                path_bytes.len(),
                u16::MAX
            )));
        }

        let path_nonce = SecureCrypto::new().nonce();
        let (encrypted_path, path_tag) = aead::seal(master_key.as_bytes(), &path_nonce, path_bytes)?;

        Ok(Self {
            global_salt,
            file_salt,
            path_nonce,
            encrypted_path,
            path_tag,
            original_length,
            biometric_key: None,
        })
    }

    /// Attach a wrapped master key for biometric unlock.
    pub fn with_biometric_key(mut self, wrapped: Vec<u8>) -> Self {
        self.biometric_key = Some(wrapped);
        self
    }

    /// Whether the biometric flag is set.
    pub fn is_biometric(&self) -> bool {
        self.biometric_key.is_some()
    }

    /// Recover the relative path.
    ///
    /// # Errors
    /// - [`Error::Authentication`] if `master_key` is wrong or the header was altered
    /// - [`Error::Format`] if the decrypted path is not UTF-8
    pub fn open_path(&self, master_key: &MasterKey) -> Result<String> {
        let bytes = aead::open(
            master_key.as_bytes(),
            &self.path_nonce,
            &self.encrypted_path,
            &self.path_tag,
        )?;
        String::from_utf8(bytes)
            .map_err(|_| Error::Format("relative path is not valid UTF-8".to_string()))
    }

    /// Number of bytes [`write_to`](Self::write_to) produces.
    pub fn encoded_len(&self) -> usize {
        let biometric = self
            .biometric_key
            .as_ref()
            .map(|key| 2 + key.len())
            .unwrap_or(0);
        MAGIC.len()
            + 1
            + SALT_LENGTH * 2
            + NONCE_SIZE
            + 2
            + self.encrypted_path.len()
            + TAG_SIZE
            + 8
            + 1
            + biometric
    }

    /// Serialize the header.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let path_len = u16::try_from(self.encrypted_path.len())
            .map_err(|_| Error::InvalidInput("encrypted path too long".to_string()))?;

        writer.write_all(MAGIC)?;
        writer.write_all(&[FORMAT_VERSION])?;
        writer.write_all(self.global_salt.as_bytes())?;
        writer.write_all(self.file_salt.as_bytes())?;
        writer.write_all(&self.path_nonce)?;
        writer.write_all(&path_len.to_le_bytes())?;
        writer.write_all(&self.encrypted_path)?;
        writer.write_all(&self.path_tag)?;
        writer.write_all(&self.original_length.to_le_bytes())?;

        match &self.biometric_key {
            Some(key) => {
                let key_len = u16::try_from(key.len())
                    .map_err(|_| Error::InvalidInput("wrapped key too long".to_string()))?;
                writer.write_all(&[1])?;
                writer.write_all(&key_len.to_le_bytes())?;
                writer.write_all(key)?;
            }
            None => writer.write_all(&[0])?,
        }

        Ok(())
    }

    /// Parse and validate a header.
    ///
    /// # Errors
    /// - [`Error::Format`] on bad magic, unsupported version or a short read
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 8];
        read_field(reader, &mut magic, "magic")?;
        if &magic != MAGIC {
            return Err(Error::Format("not a valid locker file".to_string()));
        }

        let mut version = [0u8; 1];
        read_field(reader, &mut version, "version")?;
        if version[0] != FORMAT_VERSION {
            return Err(Error::Format(format!("unsupported version: {}", version[0])));
        }

        let mut global_salt = [0u8; SALT_LENGTH];
        read_field(reader, &mut global_salt, "global salt")?;
        let mut file_salt = [0u8; SALT_LENGTH];
        read_field(reader, &mut file_salt, "file salt")?;
        let mut path_nonce = [0u8; NONCE_SIZE];
        read_field(reader, &mut path_nonce, "path nonce")?;

        let mut len = [0u8; 2];
        read_field(reader, &mut len, "path length")?;
        let mut encrypted_path = vec![0u8; u16::from_le_bytes(len) as usize];
        read_field(reader, &mut encrypted_path, "encrypted path")?;

        let mut path_tag = [0u8; TAG_SIZE];
        read_field(reader, &mut path_tag, "path tag")?;

        let mut original_length = [0u8; 8];
        read_field(reader, &mut original_length, "original length")?;
        let original_length = i64::from_le_bytes(original_length);
        if original_length < 0 {
            return Err(Error::Format(format!(
                "negative original length: {}",
                original_length
            )));
        }

        let mut flag = [0u8; 1];
        read_field(reader, &mut flag, "biometric flag")?;
        let biometric_key = if flag[0] == 1 {
            read_field(reader, &mut len, "wrapped key length")?;
            let mut key = vec![0u8; u16::from_le_bytes(len) as usize];
            read_field(reader, &mut key, "wrapped key")?;
            Some(key)
        } else {
            None
        };

        Ok(Self {
            global_salt: Salt::from_bytes(global_salt),
            file_salt: Salt::from_bytes(file_salt),
            path_nonce,
            encrypted_path,
            path_tag,
            original_length,
            biometric_key,
        })
    }
}

/// Read exactly `buf.len()` bytes; a short read is a format error.
fn read_field<R: Read>(reader: &mut R, buf: &mut [u8], field: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => Error::Format(format!("truncated header at {}", field)),
        _ => Error::Io(e),
    })
}

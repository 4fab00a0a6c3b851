//! Locker configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::shred::DeletionPolicy;
use fflocker_common::{Error, Result};
use fflocker_crypto::{KdfParams, DEFAULT_CHUNK_SIZE};

/// Extension of container files.
pub const LOCKED_EXTENSION: &str = "ffl";

/// Suffix of temporary outputs before commit.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Suffix appended to a locked folder's name.
pub const FOLDER_MARKER: &str = "_USE_FOR_FOLDER_UNLOCK_DO_NOT_DELETE";

/// Default length of obfuscated container names.
pub const SECURE_NAME_LENGTH: usize = 32;

/// Engine configuration.
///
/// Every field has a default, so a partial JSON document is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockerConfig {
    /// Plaintext chunk size of the stream cipher.
    pub chunk_size: usize,
    /// Number of files processed concurrently.
    pub max_parallelism: usize,
    /// Characters in an obfuscated container name.
    pub secure_name_length: usize,
    /// Argon2id parameters.
    pub kdf: KdfParams,
    /// Secure deletion behaviour.
    pub deletion: DeletionPolicy,
}

impl LockerConfig {
    /// Override the worker pool size.
    pub fn with_parallelism(mut self, workers: usize) -> Self {
        self.max_parallelism = workers;
        self
    }

    /// Override the KDF parameters.
    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    /// Override the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Effective worker count, never zero.
    pub fn parallelism(&self) -> usize {
        self.max_parallelism.max(1)
    }

    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidInput(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidInput(format!("invalid configuration: {}", e)))
    }
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_parallelism: num_cpus::get(),
            secure_name_length: SECURE_NAME_LENGTH,
            kdf: KdfParams::default(),
            deletion: DeletionPolicy::default(),
        }
    }
}

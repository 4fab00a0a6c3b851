//! Key derivation using Argon2id.
//!
//! One derivation per locked item: the password and the item's GlobalSalt
//! produce the master key that every container of the item shares.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};

use crate::keys::{MasterKey, Salt, KEY_LENGTH};
use fflocker_common::{Error, Result, SecureBuffer};

/// Parameters for Argon2id key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB (e.g., 65536 = 64 MiB).
    pub memory_cost: u32,
    /// Number of iterations.
    pub time_cost: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl KdfParams {
    /// Parameters used for locking: 4 iterations, 64 MiB, one lane per core.
    ///
    /// The lane count is part of the derivation, so an item locked on a
    /// machine with a different core count needs the same `parallelism`
    /// configured explicitly to unlock.
    pub fn standard() -> Self {
        Self {
            memory_cost: 65536, // 64 MiB
            time_cost: 4,
            parallelism: num_cpus::get().max(1) as u32,
        }
    }

    /// Cheap parameters for tests and constrained environments.
    pub fn minimal() -> Self {
        Self {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::standard()
    }
}

/// Stretch `password` and `salt` into `length` bytes of key material.
///
/// Deterministic given identical inputs.
///
/// # Errors
/// - [`Error::Derivation`] if the Argon2id primitive rejects its inputs
pub fn derive(password: &[u8], salt: &[u8], length: usize, params: &KdfParams) -> Result<SecureBuffer> {
    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(length),
    )
    .map_err(|e| Error::Derivation(format!("invalid KDF parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut output = SecureBuffer::new(length);
    argon2
        .hash_password_into(password, salt, output.as_mut_bytes()?)
        .map_err(|e| Error::Derivation(e.to_string()))?;

    Ok(output)
}

/// Derive the 256-bit master key for an item from its GlobalSalt.
pub fn derive_key(password: &[u8], salt: &Salt, params: &KdfParams) -> Result<MasterKey> {
    let derived = derive(password, salt.as_bytes(), KEY_LENGTH, params)?;
    MasterKey::from_slice(derived.as_bytes()?)
}

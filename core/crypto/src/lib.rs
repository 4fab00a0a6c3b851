//! Cryptographic primitives for FFLocker.
//!
//! This module provides:
//! - Key derivation using Argon2id
//! - Per-file keys via HMAC-SHA256 over the master key
//! - Authenticated encryption using AES-256-GCM
//! - The container header codec and chunked stream cipher
//! - Biometric wrapping of the master key
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged

pub mod aead;
pub mod biometric;
pub mod header;
pub mod kdf;
pub mod keys;
pub mod random;
pub mod stream;

pub use biometric::{BiometricKey, BiometricSigner, BIOMETRIC_CHALLENGE};
pub use header::{FileHeader, FORMAT_VERSION, MAGIC};
pub use kdf::{derive, derive_key, KdfParams};
pub use keys::{FileKey, MasterKey, Salt, KEY_LENGTH};
pub use random::SecureCrypto;
pub use stream::{FileCipher, DEFAULT_CHUNK_SIZE, FOOTER};

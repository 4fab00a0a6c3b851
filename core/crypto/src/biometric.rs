//! Master key wrapping under a biometric-derived key.
//!
//! The platform signer signs a fixed challenge after biometric approval;
//! `K_bio = SHA-256(signature)`. The wrapped key stored in the header is
//! `MasterKey XOR K_bio`. The wrap carries no authentication of its own: a
//! wrong signature yields a wrong master key, which is detected later when
//! the header path fails to decrypt.

use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::keys::{MasterKey, KEY_LENGTH};
use fflocker_common::{Error, Result};

/// Challenge signed by the platform authenticator. Changing it makes
/// existing biometric-wrapped keys unrecoverable.
pub const BIOMETRIC_CHALLENGE: &[u8] = b"FFLockerHelloChallenge";

/// Platform capability that signs a challenge after biometric approval.
///
/// The signature must be deterministic for a given credential and
/// challenge.
pub trait BiometricSigner: Send + Sync {
    /// Sign `challenge`; fails if the user declines or the platform errors.
    fn sign(&self, challenge: &[u8]) -> Result<Vec<u8>>;
}

/// Key derived from a biometric signature.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BiometricKey {
    key: [u8; KEY_LENGTH],
}

impl BiometricKey {
    /// Hash a signature into a key.
    pub fn from_signature(signature: &[u8]) -> Self {
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&Sha256::digest(signature));
        Self { key }
    }

    /// Create from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Ask `signer` to sign the fixed challenge and derive the key.
    pub fn request(signer: &dyn BiometricSigner) -> Result<Self> {
        let mut signature = signer.sign(BIOMETRIC_CHALLENGE)?;
        let key = Self::from_signature(&signature);
        signature.zeroize();
        Ok(key)
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for BiometricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BiometricKey([REDACTED])")
    }
}

/// `MasterKey XOR K_bio`, the value stored in the header.
pub fn wrap(master_key: &MasterKey, biometric_key: &BiometricKey) -> Vec<u8> {
    master_key
        .as_bytes()
        .iter()
        .zip(biometric_key.as_bytes())
        .map(|(m, b)| m ^ b)
        .collect()
}

/// Recover the master key from a wrapped key.
///
/// # Errors
/// - [`Error::Format`] if the wrapped key is not KEY_LENGTH bytes
pub fn unwrap(wrapped: &[u8], biometric_key: &BiometricKey) -> Result<MasterKey> {
    if wrapped.len() != KEY_LENGTH {
        return Err(Error::Format(format!(
            "wrapped key is {} bytes, expected {}",
            wrapped.len(),
            KEY_LENGTH
        )));
    }

    let mut key = [0u8; KEY_LENGTH];
    for (out, (w, b)) in key.iter_mut().zip(wrapped.iter().zip(biometric_key.as_bytes())) {
        *out = w ^ b;
    }
    let master = MasterKey::from_bytes(key);
    key.zeroize();
    Ok(master)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct FixedSigner(Vec<u8>);

    impl BiometricSigner for FixedSigner {
        fn sign(&self, challenge: &[u8]) -> Result<Vec<u8>> {
            let mut signature = self.0.clone();
            signature.extend_from_slice(challenge);
            Ok(signature)
        }
    }

    struct DecliningSigner;

    impl BiometricSigner for DecliningSigner {
        fn sign(&self, _challenge: &[u8]) -> Result<Vec<u8>> {
            Err(Error::PermissionDenied("user declined".to_string()))
        }
    }

    #[test]
    fn test_request_hashes_signature_over_challenge() {
        let signer = FixedSigner(b"credential".to_vec());
        let key = BiometricKey::request(&signer).unwrap();

        let mut expected = b"credential".to_vec();
        expected.extend_from_slice(BIOMETRIC_CHALLENGE);
        assert_eq!(key.as_bytes(), BiometricKey::from_signature(&expected).as_bytes());

        // Same credential, same key.
        assert_eq!(key.as_bytes(), BiometricKey::request(&signer).unwrap().as_bytes());
    }

    #[test]
    fn test_declined_signature_propagates() {
        assert!(matches!(
            BiometricKey::request(&DecliningSigner),
            Err(Error::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_unwrap_rejects_bad_length() {
        let bio = BiometricKey::from_bytes([1u8; KEY_LENGTH]);
        assert!(matches!(unwrap(&[0u8; 16], &bio), Err(Error::Format(_))));
    }

    #[test]
    fn test_wrong_biometric_key_gives_different_master() {
        let master = MasterKey::from_bytes([3u8; KEY_LENGTH]);
        let wrapped = wrap(&master, &BiometricKey::from_bytes([1u8; KEY_LENGTH]));
        let recovered = unwrap(&wrapped, &BiometricKey::from_bytes([2u8; KEY_LENGTH])).unwrap();
        assert_ne!(recovered.as_bytes(), master.as_bytes());
    }

    proptest! {
        #[test]
        fn prop_wrap_unwrap_roundtrip(
            master in proptest::array::uniform32(any::<u8>()),
            bio in proptest::array::uniform32(any::<u8>()),
        ) {
            let master = MasterKey::from_bytes(master);
            let bio = BiometricKey::from_bytes(bio);
            let wrapped = wrap(&master, &bio);
            prop_assert_eq!(wrapped.len(), KEY_LENGTH);
            let recovered = unwrap(&wrapped, &bio).unwrap();
            prop_assert_eq!(recovered.as_bytes(), master.as_bytes());
        }
    }
}

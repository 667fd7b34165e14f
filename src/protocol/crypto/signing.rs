use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use super::{CryptoError, lengths};

/// Long-term Ed25519 identity of a receiver or sender
pub struct Ed25519KeyPair {
    key: SigningKey,
}

impl Ed25519KeyPair {
    /// Fresh random identity
    #[must_use]
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Identity from a stored 32-byte seed
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    /// Verifying half
    #[must_use]
    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey(self.key.verifying_key())
    }

    /// Sign `message`
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        Ed25519Signature(self.key.sign(message))
    }
}

impl fmt::Debug for Ed25519KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ed25519KeyPair").field(&self.public_key()).finish()
    }
}

/// Ed25519 verifying key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ed25519PublicKey(VerifyingKey);

impl Ed25519PublicKey {
    /// Parse a 32-byte encoded point
    ///
    /// # Errors
    ///
    /// Returns `InvalidKeyLength` for the wrong size and
    /// `InvalidPublicKey` when the bytes are not a curve point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: &[u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: lengths::ED25519_PUBLIC_KEY,
            actual: bytes.len(),
        })?;
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Encoded point
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Check `signature` over `message`
    ///
    /// # Errors
    ///
    /// Returns `InvalidSignature` on mismatch.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<(), CryptoError> {
        self.0
            .verify(message, &signature.0)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519PublicKey({})", crate::discovery::txt::to_hex(self.as_bytes()))
    }
}

/// Detached Ed25519 signature
#[derive(Debug, Clone, Copy)]
pub struct Ed25519Signature(Signature);

impl Ed25519Signature {
    /// Parse 64 signature bytes
    ///
    /// # Errors
    ///
    /// Returns `InvalidKeyLength` for the wrong size.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: &[u8; 64] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: lengths::ED25519_SIGNATURE,
            actual: bytes.len(),
        })?;
        Ok(Self(Signature::from_bytes(bytes)))
    }

    /// Encoded signature
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }
}

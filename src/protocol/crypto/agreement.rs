use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use super::{CryptoError, lengths};

/// One-shot X25519 key pair for a single pair-verify exchange
///
/// The secret is consumed by [`agree`](Self::agree), so a key pair can
/// never be reused across sessions.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: X25519PublicKey,
}

impl EphemeralKeyPair {
    /// Fresh random key pair
    #[must_use]
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519PublicKey(PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Public half sent to the peer
    #[must_use]
    pub fn public_key(&self) -> X25519PublicKey {
        self.public
    }

    /// Diffie-Hellman with the peer's public key
    ///
    /// # Errors
    ///
    /// Returns `WeakSharedSecret` for low-order peer points.
    pub fn agree(self, peer: &X25519PublicKey) -> Result<SharedSecret, CryptoError> {
        let shared = self.secret.diffie_hellman(&peer.0);
        if !shared.was_contributory() {
            return Err(CryptoError::WeakSharedSecret);
        }
        Ok(SharedSecret(Zeroizing::new(shared.to_bytes())))
    }
}

/// X25519 public key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X25519PublicKey(PublicKey);

impl X25519PublicKey {
    /// Parse 32 key bytes
    ///
    /// # Errors
    ///
    /// Returns `InvalidKeyLength` for the wrong size.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: lengths::X25519_PUBLIC_KEY,
            actual: bytes.len(),
        })?;
        Ok(Self(PublicKey::from(bytes)))
    }

    /// Key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

/// Agreed secret, wiped on drop
pub struct SharedSecret(Zeroizing<[u8; 32]>);

impl SharedSecret {
    /// Secret bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

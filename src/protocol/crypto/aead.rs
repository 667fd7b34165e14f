use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};

use super::{CryptoError, lengths};

/// Nonce for packet `counter`: four zero bytes then the counter, little-endian
#[must_use]
pub fn counter_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// ChaCha20-Poly1305 keyed for one stream
///
/// Every packet is sealed under the nonce derived from its counter, with
/// caller-supplied associated data authenticated alongside.
pub struct PacketCipher {
    aead: ChaCha20Poly1305,
}

impl PacketCipher {
    /// Cipher for a 32-byte stream key
    ///
    /// The key is read in place; no copy of it outlives this call.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKeyLength` if the cipher rejects the key size.
    pub fn new(key: &[u8; 32]) -> Result<Self, CryptoError> {
        let aead = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
            expected: lengths::CHACHA_KEY,
            actual: key.len(),
        })?;
        Ok(Self { aead })
    }

    /// Encrypt `plaintext`, returning ciphertext followed by the tag
    ///
    /// # Errors
    ///
    /// Returns `EncryptionFailed` if the input exceeds the AEAD limits.
    pub fn seal(&self, counter: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = counter_nonce(counter);
        self.aead
            .encrypt(
                &Nonce::from(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    /// Verify the tag and decrypt
    ///
    /// # Errors
    ///
    /// Returns `DecryptionFailed` when the input is shorter than a tag or
    /// fails verification.
    pub fn open(&self, counter: u64, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < lengths::AEAD_TAG {
            return Err(CryptoError::DecryptionFailed(format!(
                "{} bytes cannot hold a tag",
                sealed.len()
            )));
        }
        let nonce = counter_nonce(counter);
        self.aead
            .decrypt(&Nonce::from(nonce), Payload { msg: sealed, aad })
            .map_err(|_| CryptoError::DecryptionFailed("tag mismatch".into()))
    }
}

//! Media payload decryption
//!
//! Payloads are sealed with ChaCha20-Poly1305. The nonce is the
//! extended sequence number and the RTP header is authenticated as
//! associated data, so a packet cannot be replayed under another
//! sequence number or have its header rewritten.

use thiserror::Error;

use crate::protocol::crypto::{CryptoError, PacketCipher, lengths};
use crate::session::keys::StreamKey;

/// Errors occurring during payload decryption
#[derive(Debug, Error)]
pub enum DecryptionError {
    /// Payload is too short to contain the authentication tag
    #[error("payload too short ({0} bytes) for auth tag")]
    PayloadTooShort(usize),

    /// Tag verification failed
    #[error("authentication failed: corrupted or tampered packet")]
    AuthenticationFailed,
}

/// Decrypts the payloads of one stream
pub struct StreamDecryptor {
    cipher: PacketCipher,
}

impl StreamDecryptor {
    /// Create a decryptor for a derived stream key
    ///
    /// # Errors
    ///
    /// Returns `CryptoError` if the cipher cannot be keyed.
    pub fn new(key: &StreamKey) -> Result<Self, CryptoError> {
        Ok(Self {
            cipher: PacketCipher::new(key.as_bytes())?,
        })
    }

    /// Verify and decrypt one payload
    ///
    /// # Errors
    ///
    /// Returns `PayloadTooShort` or `AuthenticationFailed`.
    pub fn open(
        &self,
        extended_sequence: u64,
        header: &[u8],
        sealed: &[u8],
    ) -> Result<Vec<u8>, DecryptionError> {
        if sealed.len() < lengths::AEAD_TAG {
            return Err(DecryptionError::PayloadTooShort(sealed.len()));
        }
        self.cipher
            .open(extended_sequence, header, sealed)
            .map_err(|_| DecryptionError::AuthenticationFailed)
    }
}

/// Seal a payload the way a sender does; the inverse of [`StreamDecryptor::open`]
///
/// # Errors
///
/// Returns `CryptoError` if the payload exceeds the AEAD limits.
pub fn seal(
    key: &[u8; 32],
    extended_sequence: u64,
    header: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    PacketCipher::new(key)?.seal(extended_sequence, header, plaintext)
}

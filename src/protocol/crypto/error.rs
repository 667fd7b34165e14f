use thiserror::Error;

/// Cryptographic operation errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key, nonce or signature had the wrong size
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Required length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// Signature bytes malformed or verification failed
    #[error("invalid signature")]
    InvalidSignature,

    /// AEAD tag mismatch or malformed ciphertext
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// AEAD encryption failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// HKDF output length out of range
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Point is not a valid curve point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Diffie-Hellman produced the all-zero secret
    #[error("non-contributory key exchange")]
    WeakSharedSecret,
}

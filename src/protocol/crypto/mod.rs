//! Cryptographic building blocks for pairing and the media channels
//!
//! Thin wrappers over the RustCrypto and dalek crates that fix the
//! parameters the receiver uses: Ed25519 identities, ephemeral X25519
//! agreement, the AES-CTR cipher protecting pair-verify signatures,
//! HKDF-SHA512 key derivation and the ChaCha20-Poly1305 packet AEAD.

mod aead;
mod agreement;
mod error;
mod kdf;
mod signature_cipher;
mod signing;
#[cfg(test)]
mod tests;

pub use self::aead::{PacketCipher, counter_nonce};
pub use self::agreement::{EphemeralKeyPair, SharedSecret, X25519PublicKey};
pub use self::error::CryptoError;
pub use self::kdf::{derive_key, hash_truncated};
pub use self::signature_cipher::SignatureCipher;
pub use self::signing::{Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature};

/// Wire sizes of keys, signatures and tags
pub mod lengths {
    /// Ed25519 public key
    pub const ED25519_PUBLIC_KEY: usize = 32;
    /// Ed25519 signature
    pub const ED25519_SIGNATURE: usize = 64;
    /// X25519 public key
    pub const X25519_PUBLIC_KEY: usize = 32;
    /// ChaCha20-Poly1305 key
    pub const CHACHA_KEY: usize = 32;
    /// Poly1305 tag appended to every sealed payload
    pub const AEAD_TAG: usize = 16;
}

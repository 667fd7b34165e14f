use hkdf::Hkdf;
use sha2::{Digest, Sha512};

use super::CryptoError;

/// HKDF-SHA512 extract-and-expand to a 32-byte key
///
/// # Errors
///
/// Returns `KeyDerivationFailed` if expansion is refused.
pub fn derive_key(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut okm = [0u8; 32];
    Hkdf::<Sha512>::new(Some(salt), ikm)
        .expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(okm)
}

/// First 16 bytes of `SHA-512(label || secret)`
#[must_use]
pub fn hash_truncated(label: &[u8], secret: &[u8]) -> [u8; 16] {
    let digest = Sha512::new().chain_update(label).chain_update(secret).finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};

use super::kdf::hash_truncated;

const KEY_LABEL: &[u8] = b"Pair-Verify-AES-Key";
const IV_LABEL: &[u8] = b"Pair-Verify-AES-IV";

/// AES-128-CTR keystream hiding pair-verify signatures
///
/// Key and IV come from the X25519 secret. Both sides encrypt with the
/// same keystream, so the second signature is sealed after skipping the
/// bytes the first one consumed.
pub struct SignatureCipher {
    ctr: ctr::Ctr128BE<Aes128>,
}

impl SignatureCipher {
    /// Keystream for a pair-verify exchange
    #[must_use]
    pub fn new(shared_secret: &[u8; 32]) -> Self {
        let key = hash_truncated(KEY_LABEL, shared_secret);
        let iv = hash_truncated(IV_LABEL, shared_secret);
        Self {
            ctr: ctr::Ctr128BE::<Aes128>::new(&key.into(), &iv.into()),
        }
    }

    /// Advance the keystream by `bytes` without using it
    pub fn skip(&mut self, bytes: u64) {
        let position: u64 = self.ctr.current_pos();
        self.ctr.seek(position + bytes);
    }

    /// XOR `data` with the next keystream bytes
    #[must_use]
    pub fn apply(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.ctr.apply_keystream(&mut out);
        out
    }
}

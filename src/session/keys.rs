//! Session key storage and per-stream key derivation

use std::fmt;
use std::sync::Mutex;

use thiserror::Error;
use zeroize::Zeroizing;

use crate::protocol::crypto::{CryptoError, derive_key};
use crate::sink::StreamKind;

const STREAM_SALT: &[u8] = b"MirrorStream-Salt";
const VIDEO_KEY_INFO: &[u8] = b"MirrorStream-Video-Key";
const AUDIO_KEY_INFO: &[u8] = b"MirrorStream-Audio-Key";

/// Key vault errors
#[derive(Debug, Error)]
pub enum KeyError {
    /// The session secret was already installed
    #[error("session key already installed")]
    AlreadyInstalled,

    /// No secret has been installed yet
    #[error("session key not installed")]
    NotInstalled,

    /// The session ended and its keys were wiped
    #[error("session keys wiped")]
    Wiped,

    /// HKDF failed
    #[error(transparent)]
    Derivation(#[from] CryptoError),
}

/// A 32-byte ChaCha20-Poly1305 key for one stream, wiped on drop
#[derive(Clone)]
pub struct StreamKey(Zeroizing<[u8; 32]>);

impl StreamKey {
    /// Key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamKey(<redacted>)")
    }
}

enum VaultState {
    Empty,
    Installed(Zeroizing<[u8; 32]>),
    Wiped,
}

/// Holds a session's pair-verify secret
///
/// The secret is installed once after pair-verify and wiped when the
/// session ends. Stream keys are derived on demand and never stored here.
pub struct KeyVault {
    state: Mutex<VaultState>,
}

impl KeyVault {
    /// Create an empty vault
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VaultState::Empty),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VaultState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Install the session secret
    ///
    /// # Errors
    ///
    /// Returns `AlreadyInstalled` on a second call and `Wiped` after the
    /// session ended.
    pub fn install(&self, secret: Zeroizing<[u8; 32]>) -> Result<(), KeyError> {
        let mut state = self.lock();
        match *state {
            VaultState::Empty => {
                *state = VaultState::Installed(secret);
                Ok(())
            }
            VaultState::Installed(_) => Err(KeyError::AlreadyInstalled),
            VaultState::Wiped => Err(KeyError::Wiped),
        }
    }

    /// Whether a secret is installed and not yet wiped
    #[must_use]
    pub fn is_installed(&self) -> bool {
        matches!(*self.lock(), VaultState::Installed(_))
    }

    /// Whether the vault has been wiped
    #[must_use]
    pub fn is_wiped(&self) -> bool {
        matches!(*self.lock(), VaultState::Wiped)
    }

    /// Derive the key for one stream
    ///
    /// # Errors
    ///
    /// Returns `NotInstalled` before pair-verify and `Wiped` after the
    /// session ended.
    pub fn stream_key(
        &self,
        kind: StreamKind,
        stream_connection_id: u64,
    ) -> Result<StreamKey, KeyError> {
        let state = self.lock();
        let secret = match &*state {
            VaultState::Installed(secret) => secret,
            VaultState::Empty => return Err(KeyError::NotInstalled),
            VaultState::Wiped => return Err(KeyError::Wiped),
        };
        let key = derive_stream_key(secret, kind, stream_connection_id)?;
        Ok(StreamKey(key))
    }

    /// Zeroize the secret; later derivations fail
    pub fn wipe(&self) {
        // Dropping the Zeroizing wrapper clears the bytes
        *self.lock() = VaultState::Wiped;
    }
}

impl Default for KeyVault {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.lock() {
            VaultState::Empty => "empty",
            VaultState::Installed(_) => "installed",
            VaultState::Wiped => "wiped",
        };
        f.debug_struct("KeyVault").field("state", &state).finish()
    }
}

/// HKDF-SHA512 stream key derivation shared by receiver and test sender
///
/// # Errors
///
/// Propagates HKDF failures.
pub fn derive_stream_key(
    secret: &[u8; 32],
    kind: StreamKind,
    stream_connection_id: u64,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut salt = Vec::with_capacity(STREAM_SALT.len() + 8);
    salt.extend_from_slice(STREAM_SALT);
    salt.extend_from_slice(&stream_connection_id.to_be_bytes());

    let info = match kind {
        StreamKind::Video => VIDEO_KEY_INFO,
        StreamKind::Audio => AUDIO_KEY_INFO,
    };
    derive_key(&salt, secret, info).map(Zeroizing::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(byte: u8) -> Zeroizing<[u8; 32]> {
        Zeroizing::new([byte; 32])
    }

    #[test]
    fn test_install_once() {
        let vault = KeyVault::new();
        vault.install(secret(1)).unwrap();
        assert!(matches!(vault.install(secret(2)), Err(KeyError::AlreadyInstalled)));
        assert!(vault.is_installed());
    }

    #[test]
    fn test_stream_keys_are_separated() {
        let vault = KeyVault::new();
        vault.install(secret(7)).unwrap();

        let video = vault.stream_key(StreamKind::Video, 42).unwrap();
        let audio = vault.stream_key(StreamKind::Audio, 42).unwrap();
        let other = vault.stream_key(StreamKind::Video, 43).unwrap();

        assert_ne!(video.as_bytes(), audio.as_bytes());
        assert_ne!(video.as_bytes(), other.as_bytes());
        assert_eq!(
            video.as_bytes(),
            vault.stream_key(StreamKind::Video, 42).unwrap().as_bytes()
        );
    }

    #[test]
    fn test_wipe_blocks_derivation() {
        let vault = KeyVault::new();
        assert!(matches!(
            vault.stream_key(StreamKind::Video, 1),
            Err(KeyError::NotInstalled)
        ));

        vault.install(secret(3)).unwrap();
        vault.wipe();
        assert!(vault.is_wiped());
        assert!(matches!(vault.stream_key(StreamKind::Video, 1), Err(KeyError::Wiped)));
        assert!(matches!(vault.install(secret(3)), Err(KeyError::Wiped)));
    }

    #[test]
    fn test_debug_redacts() {
        let vault = KeyVault::new();
        vault.install(secret(9)).unwrap();
        let key = vault.stream_key(StreamKind::Audio, 5).unwrap();
        assert_eq!(format!("{key:?}"), "StreamKey(<redacted>)");
        assert!(format!("{vault:?}").contains("installed"));
    }
}

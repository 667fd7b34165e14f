use std::io;
use thiserror::Error;

use crate::discovery::DiscoveryError;
use crate::pipeline::audio::AudioDecodeError;
use crate::pipeline::video::VideoDecodeError;
use crate::protocol::crypto::CryptoError;
use crate::protocol::plist::PlistError;
use crate::protocol::rtsp::ParseError;
use crate::session::keys::KeyError;
use crate::session::pairing::PairingError;
use crate::session::state::StateError;
use crate::transport::TransportError;

/// Errors that can occur while receiving a mirroring session
#[derive(Debug, Error)]
pub enum MirrorError {
    // ===== Session errors =====
    /// Malformed or unsupported parameters during negotiation
    #[error("negotiation failed: {message}")]
    Negotiation {
        /// Description of the failure
        message: String,
    },

    /// Pairing or key agreement failed
    #[error("authentication failed: {message}")]
    Authentication {
        /// Description of the failure
        message: String,
    },

    /// Media packet failed authentication
    #[error("integrity check failed: {message}")]
    Integrity {
        /// Description of the failure
        message: String,
    },

    /// Elementary stream could not be decoded
    #[error("decode failed: {message}")]
    Decode {
        /// Description of the failure
        message: String,
    },

    /// Connection or framing failure on a session socket
    #[error("transport error: {message}")]
    Transport {
        /// Description of the failure
        message: String,
        /// The underlying source of the error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    // ===== Receiver errors =====
    /// Service advertisement failed
    #[error("discovery failed: {message}")]
    Discovery {
        /// Description of the failure
        message: String,
        /// The underlying source of the error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Another session is already active
    #[error("receiver busy: a session is already active")]
    SessionBusy,

    /// Operation not valid in current state
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of why the state is invalid
        message: String,
        /// The current state
        current_state: String,
    },

    /// Invalid configuration
    #[error("invalid configuration: {name} - {message}")]
    InvalidConfig {
        /// Name of the setting
        name: String,
        /// Description of the error
        message: String,
    },

    // ===== I/O errors =====
    /// Network I/O error
    #[error("network error: {0}")]
    NetworkError(#[from] io::Error),
}

impl MirrorError {
    /// Whether this error ends the session it occurred in
    ///
    /// Integrity and transport errors only end a session once the error
    /// budget is exhausted; that decision belongs to the caller.
    #[must_use]
    pub fn terminates_session(&self) -> bool {
        matches!(
            self,
            Self::Negotiation { .. } | Self::Authentication { .. } | Self::InvalidState { .. }
        )
    }

    /// Check if the receiver can continue after this error
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Negotiation { .. }
            | Self::Authentication { .. }
            | Self::Integrity { .. }
            | Self::Decode { .. }
            | Self::Transport { .. }
            | Self::Discovery { .. }
            | Self::SessionBusy
            | Self::InvalidState { .. } => true,
            Self::InvalidConfig { .. } | Self::NetworkError(_) => false,
        }
    }

    /// Short category name used in logs and events
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Negotiation { .. } => "negotiation",
            Self::Authentication { .. } => "authentication",
            Self::Integrity { .. } => "integrity",
            Self::Decode { .. } => "decode",
            Self::Transport { .. } => "transport",
            Self::Discovery { .. } => "discovery",
            Self::SessionBusy => "busy",
            Self::InvalidState { .. } => "state",
            Self::InvalidConfig { .. } => "config",
            Self::NetworkError(_) => "network",
        }
    }

    pub(crate) fn negotiation(message: impl Into<String>) -> Self {
        Self::Negotiation {
            message: message.into(),
        }
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }
}

impl From<PairingError> for MirrorError {
    fn from(err: PairingError) -> Self {
        Self::Authentication {
            message: err.to_string(),
        }
    }
}

impl From<KeyError> for MirrorError {
    fn from(err: KeyError) -> Self {
        Self::Authentication {
            message: err.to_string(),
        }
    }
}

impl From<CryptoError> for MirrorError {
    fn from(err: CryptoError) -> Self {
        Self::Authentication {
            message: err.to_string(),
        }
    }
}

impl From<PlistError> for MirrorError {
    fn from(err: PlistError) -> Self {
        Self::Negotiation {
            message: format!("malformed plist body: {err}"),
        }
    }
}

impl From<ParseError> for MirrorError {
    fn from(err: ParseError) -> Self {
        Self::Transport {
            message: "malformed control message".to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<StateError> for MirrorError {
    fn from(err: StateError) -> Self {
        Self::InvalidState {
            message: err.to_string(),
            current_state: err.from_state().to_string(),
        }
    }
}

impl From<TransportError> for MirrorError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Decryption(e) => Self::Integrity {
                message: e.to_string(),
            },
            TransportError::ThresholdExceeded { last, .. } if last.is_integrity() => {
                Self::Integrity {
                    message: format!("error threshold exceeded: {last}"),
                }
            }
            other => Self::Transport {
                message: other.to_string(),
                source: None,
            },
        }
    }
}

impl From<VideoDecodeError> for MirrorError {
    fn from(err: VideoDecodeError) -> Self {
        Self::Decode {
            message: err.to_string(),
        }
    }
}

impl From<AudioDecodeError> for MirrorError {
    fn from(err: AudioDecodeError) -> Self {
        Self::Decode {
            message: err.to_string(),
        }
    }
}

impl From<DiscoveryError> for MirrorError {
    fn from(err: DiscoveryError) -> Self {
        Self::Discovery {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Result type alias for mirroring operations
pub type Result<T> = std::result::Result<T, MirrorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MirrorError::Negotiation {
            message: "unsupported codec".to_string(),
        };
        assert_eq!(err.to_string(), "negotiation failed: unsupported codec");
    }

    #[test]
    fn test_session_termination_classification() {
        assert!(MirrorError::negotiation("bad").terminates_session());
        assert!(
            MirrorError::Authentication {
                message: "bad signature".into()
            }
            .terminates_session()
        );
        assert!(
            !MirrorError::Decode {
                message: "corrupt".into()
            }
            .terminates_session()
        );
        assert!(
            !MirrorError::Integrity {
                message: "tag".into()
            }
            .terminates_session()
        );
    }

    #[test]
    fn test_receiver_level_recoverability() {
        assert!(MirrorError::SessionBusy.is_recoverable());
        assert!(MirrorError::transport("reset").is_recoverable());
        assert!(
            !MirrorError::InvalidConfig {
                name: "rtsp_port".into(),
                message: "in use".into()
            }
            .is_recoverable()
        );
    }

    #[test]
    fn test_plist_error_is_negotiation() {
        let err: MirrorError = PlistError::InvalidHeader.into();
        assert_eq!(err.category(), "negotiation");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err: MirrorError = io_err.into();
        assert!(matches!(err, MirrorError::NetworkError(_)));
    }
}

//! Mirroring session: state machine, pairing, keys and control handling

pub mod handshake;
pub mod keys;
pub mod manager;
pub mod pairing;
pub mod state;

pub use handshake::{Handshake, HandshakeContext, Outcome, StreamBinding, StreamRequest};
pub use keys::{KeyError, KeyVault, StreamKey, derive_stream_key};
pub use manager::{SessionControl, SessionEvent, SessionInfo, SessionManager};
pub use pairing::{LegacyPairingServer, PairingError};
pub use state::{SessionState, StateError};

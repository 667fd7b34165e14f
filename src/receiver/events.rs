//! Receiver events for host integration

use std::net::SocketAddr;

use crate::session::SessionState;
use crate::sink::StreamDescriptor;

/// Events emitted by the receiver
#[derive(Debug, Clone)]
pub enum ReceiverEvent {
    /// Receiver is listening
    Started {
        /// Advertised name
        name: String,
        /// Control port
        port: u16,
    },

    /// Receiver stopped accepting connections
    Stopped,

    /// The advertisement was republished under a new identity
    AdvertisementUpdated {
        /// Advertised name
        name: String,
        /// Advertised device id (`AA:BB:CC:DD:EE:FF`)
        device_id: String,
    },

    /// A sender connected and a session was created
    SessionStarted {
        /// Session ID
        session_id: u64,
        /// Sender address
        peer: SocketAddr,
    },

    /// A sender was turned away because another session is live
    SessionRejected {
        /// Sender address
        peer: SocketAddr,
    },

    /// Media started flowing
    StreamingStarted {
        /// Session ID
        session_id: u64,
    },

    /// A stream's format was (re)negotiated
    FormatChanged(StreamDescriptor),

    /// Sender changed the volume
    VolumeChanged {
        /// Session ID
        session_id: u64,
        /// Volume in dB (-144 is mute, 0 is full)
        db: f32,
    },

    /// Session reached `Closed` or `Errored`
    SessionEnded {
        /// Session ID
        session_id: u64,
        /// Terminal state
        state: SessionState,
    },

    /// A receiver-level failure that did not stop the receiver
    Error {
        /// Description
        message: String,
    },
}

//! Media transport: framing, decryption, reordering and error budgets
//!
//! Each negotiated stream gets a [`TransportChannel`]. The I/O tasks in
//! [`io`] read raw packets from the network, pass them through the
//! channel and forward ordered plaintext to the decode queues.

mod budget;
mod channel;
mod decryptor;
pub mod io;
mod reorder;

#[cfg(test)]
mod tests;

pub use budget::ErrorBudget;
pub use channel::{TransportChannel, TransportStats};
pub use decryptor::{DecryptionError, StreamDecryptor, seal};
pub use reorder::{Admission, ReorderBuffer, ReorderStats};

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::protocol::rtp::{PayloadType, RtpDecodeError};
use crate::session::keys::KeyError;
use crate::sink::StreamKind;

/// A decrypted packet released in sequence order
#[derive(Debug, Clone)]
pub struct PlainPacket {
    /// Stream the packet belongs to
    pub kind: StreamKind,
    /// RTP payload type
    pub payload_type: PayloadType,
    /// Extended sequence number
    pub sequence: u64,
    /// RTP timestamp
    pub timestamp: u32,
    /// RTP marker bit
    pub marker: bool,
    /// First packet after the stream was flushed
    pub discontinuity: bool,
    /// Decrypted payload
    pub payload: Bytes,
}

/// Kind of failure charged against a stream's error budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Tag verification failed
    Integrity,
    /// Header could not be parsed or did not fit the stream
    Malformed,
    /// Sequence number outside the reorder window
    Window(Admission),
}

impl FailureKind {
    /// Whether this failure is a tag/decryption failure
    #[must_use]
    pub fn is_integrity(self) -> bool {
        matches!(self, Self::Integrity)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integrity => f.write_str("integrity failure"),
            Self::Malformed => f.write_str("malformed packet"),
            Self::Window(Admission::Late) => f.write_str("late packet"),
            Self::Window(Admission::Duplicate) => f.write_str("duplicate packet"),
            Self::Window(Admission::TooFarAhead | Admission::Accept) => {
                f.write_str("packet outside reorder window")
            }
        }
    }
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Payload failed decryption or tag verification
    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    /// RTP header could not be parsed
    #[error("malformed packet: {0}")]
    Malformed(#[from] RtpDecodeError),

    /// Payload type belongs to a different stream
    #[error("unexpected {payload_type:?} packet on {kind} channel")]
    UnexpectedPayload {
        /// Channel the packet arrived on
        kind: StreamKind,
        /// Payload type found in the header
        payload_type: PayloadType,
    },

    /// Sequence number rejected by the reorder window
    #[error("sequence {sequence} rejected: {admission:?}")]
    OutOfWindow {
        /// Sequence number (extended when possible)
        sequence: u64,
        /// Why it was rejected
        admission: Admission,
    },

    /// Packet addressed to a session other than the channel's
    #[error("packet for session {actual}, channel belongs to {expected}")]
    ForeignSession {
        /// Channel's session
        expected: u64,
        /// Session the caller named
        actual: u64,
    },

    /// Too many consecutive failures
    #[error("{count} consecutive failures, last: {last}")]
    ThresholdExceeded {
        /// Length of the failure run
        count: u32,
        /// Most recent failure
        last: FailureKind,
    },

    /// Stream key unavailable
    #[error("stream key unavailable: {0}")]
    Key(#[from] KeyError),

    /// Data connection failed
    #[error("data connection failed: {0}")]
    Io(#[from] std::io::Error),
}

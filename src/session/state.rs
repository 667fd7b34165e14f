//! Mirroring session state machine
//!
//! A session walks `Negotiating → Authenticating → KeyDerived → Streaming`
//! and ends in `Closed` or `Errored`. `Idle` and `AwaitingConnection`
//! describe the receiver while no session holds the slot.

use std::fmt;

use crate::protocol::rtsp::Method;

/// Lifecycle state of the receiver's session slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Not listening
    Idle,

    /// Listening and advertised, no session
    AwaitingConnection,

    /// Control connection accepted; capability exchange
    Negotiating,

    /// Pair-setup / pair-verify in progress
    Authenticating,

    /// Shared secret established; streams may be set up
    KeyDerived,

    /// RECORD received, media flowing
    Streaming,

    /// Ended normally
    Closed,

    /// Ended by a protocol, authentication or transport failure
    Errored {
        /// Short description of the failure
        reason: String,
    },
}

impl SessionState {
    /// `Closed` or `Errored`
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Errored { .. })
    }

    /// A session exists and has not ended
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Negotiating | Self::Authenticating | Self::KeyDerived | Self::Streaming
        )
    }

    /// Check if the session is actively streaming
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming)
    }

    /// Check if stream keys can be derived in this state
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::KeyDerived | Self::Streaming)
    }

    /// Check if this state allows the given request
    ///
    /// `path` only matters for `GET` and `POST`, which are routed by path.
    #[must_use]
    pub fn allows(&self, method: Method, path: &str) -> bool {
        let pairing = matches!(path, "/pair-setup" | "/pair-verify");
        match self {
            Self::Negotiating | Self::Authenticating => match method {
                Method::Options | Method::Teardown => true,
                Method::Get => path == "/info",
                Method::Post => pairing,
                _ => false,
            },
            Self::KeyDerived => match method {
                Method::Options
                | Method::Setup
                | Method::Record
                | Method::GetParameter
                | Method::SetParameter
                | Method::Teardown => true,
                Method::Get => path == "/info",
                Method::Post => path == "/feedback",
                Method::Flush => false,
            },
            Self::Streaming => match method {
                Method::Options
                | Method::Setup
                | Method::GetParameter
                | Method::SetParameter
                | Method::Flush
                | Method::Teardown => true,
                Method::Post => path == "/feedback",
                Method::Get | Method::Record => false,
            },
            Self::Idle | Self::AwaitingConnection | Self::Closed | Self::Errored { .. } => false,
        }
    }

    /// Attempt to transition to a new state
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidTransition` if the transition is not allowed.
    #[allow(clippy::match_same_arms)]
    pub fn transition_to(&self, new_state: SessionState) -> Result<SessionState, StateError> {
        let valid = match (self, &new_state) {
            // Any live session can fail
            (from, Self::Errored { .. }) => from.is_active(),
            (from, Self::Closed) => from.is_active(),

            (Self::Idle, Self::AwaitingConnection) => true,
            (Self::AwaitingConnection, Self::Idle) => true,
            (Self::AwaitingConnection, Self::Negotiating) => true,
            (Self::Negotiating, Self::Authenticating) => true,
            (Self::Authenticating, Self::KeyDerived) => true,
            (Self::KeyDerived, Self::Streaming) => true,

            // Slot release
            (Self::Closed | Self::Errored { .. }, Self::AwaitingConnection | Self::Idle) => true,

            _ => false,
        };

        if valid {
            Ok(new_state)
        } else {
            Err(StateError::InvalidTransition {
                from: self.clone(),
                to: new_state,
            })
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::AwaitingConnection => f.write_str("AwaitingConnection"),
            Self::Negotiating => f.write_str("Negotiating"),
            Self::Authenticating => f.write_str("Authenticating"),
            Self::KeyDerived => f.write_str("KeyDerived"),
            Self::Streaming => f.write_str("Streaming"),
            Self::Closed => f.write_str("Closed"),
            Self::Errored { reason } => write!(f, "Errored({reason})"),
        }
    }
}

/// Error type for state machine operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateError {
    /// Transition not allowed
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// Source state
        from: SessionState,
        /// Destination state
        to: SessionState,
    },
}

impl StateError {
    /// State the rejected transition started from
    #[must_use]
    pub fn from_state(&self) -> &SessionState {
        match self {
            Self::InvalidTransition { from, .. } => from,
        }
    }
}

//! Single-session slot management
//!
//! The receiver serves one mirroring session at a time. A connection
//! arriving while another session is live is rejected without touching
//! the live session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::keys::KeyVault;
use super::state::SessionState;
use crate::error::MirrorError;

/// Events from the session manager
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A connection was accepted and a session created
    Started {
        /// Session ID
        session_id: u64,
        /// Sender address
        peer: SocketAddr,
    },
    /// A connection was refused because a session is live
    Rejected {
        /// Address of the refused sender
        peer: SocketAddr,
    },
    /// Session state changed
    StateChanged {
        /// Session ID
        session_id: u64,
        /// New state
        state: SessionState,
    },
    /// Session reached `Closed` or `Errored`
    Ended {
        /// Session ID
        session_id: u64,
        /// Terminal state
        state: SessionState,
    },
    /// Sender changed the volume
    VolumeChanged {
        /// Session ID
        session_id: u64,
        /// Volume in dB (-144 is mute, 0 is full)
        volume: f32,
    },
}

/// Snapshot of the live session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Session ID
    pub id: u64,
    /// Sender address
    pub peer: SocketAddr,
    /// Current state
    pub state: SessionState,
}

struct ActiveSession {
    id: u64,
    peer: SocketAddr,
    state: SessionState,
    token: CancellationToken,
    vault: Arc<KeyVault>,
}

struct Slot {
    accepting: bool,
    session: Option<ActiveSession>,
}

/// Owns the session slot and its state transitions
pub struct SessionManager {
    slot: Mutex<Slot>,
    next_id: AtomicU64,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    /// Create a new, idle session manager
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            slot: Mutex::new(Slot {
                accepting: false,
                session: None,
            }),
            next_id: AtomicU64::new(1),
            event_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Switch between `Idle` and `AwaitingConnection`
    pub fn set_accepting(&self, accepting: bool) {
        self.lock().accepting = accepting;
    }

    /// Receiver-level state: the live session's state, or `Idle` /
    /// `AwaitingConnection` when the slot is free
    #[must_use]
    pub fn phase(&self) -> SessionState {
        let slot = self.lock();
        match &slot.session {
            Some(session) if !session.state.is_terminal() => session.state.clone(),
            _ if slot.accepting => SessionState::AwaitingConnection,
            _ => SessionState::Idle,
        }
    }

    /// Snapshot of the session in the slot, if any
    #[must_use]
    pub fn current(&self) -> Option<SessionInfo> {
        self.lock().session.as_ref().map(|s| SessionInfo {
            id: s.id,
            peer: s.peer,
            state: s.state.clone(),
        })
    }

    /// Claim the slot for a newly accepted connection
    ///
    /// # Errors
    ///
    /// Returns `SessionBusy` while another session is live and
    /// `InvalidState` when the receiver is not accepting.
    pub fn begin(self: &Arc<Self>, peer: SocketAddr) -> Result<SessionControl, MirrorError> {
        let control = {
            let mut slot = self.lock();
            if slot
                .session
                .as_ref()
                .is_some_and(|s| !s.state.is_terminal())
            {
                drop(slot);
                tracing::info!(%peer, "Rejecting connection: session already active");
                self.emit(SessionEvent::Rejected { peer });
                return Err(MirrorError::SessionBusy);
            }
            if !slot.accepting {
                return Err(MirrorError::InvalidState {
                    message: "receiver is not accepting connections".to_string(),
                    current_state: SessionState::Idle.to_string(),
                });
            }

            let state = SessionState::AwaitingConnection.transition_to(SessionState::Negotiating)?;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let token = CancellationToken::new();
            let vault = Arc::new(KeyVault::new());
            slot.session = Some(ActiveSession {
                id,
                peer,
                state,
                token: token.clone(),
                vault: vault.clone(),
            });

            SessionControl {
                manager: self.clone(),
                id,
                peer,
                token,
                vault,
            }
        };

        tracing::info!(session_id = control.id, %peer, "Session started");
        self.emit(SessionEvent::Started {
            session_id: control.id,
            peer,
        });
        Ok(control)
    }

    /// Move session `id` to `to`
    ///
    /// Terminal targets wipe the key vault and cancel the session token
    /// before the lock is released. A stale `id` is ignored.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for a transition the state machine forbids.
    pub fn transition(&self, id: u64, to: SessionState) -> Result<(), MirrorError> {
        let event = {
            let mut slot = self.lock();
            let Some(session) = slot.session.as_mut().filter(|s| s.id == id) else {
                return Ok(());
            };
            if session.state.is_terminal() && to.is_terminal() {
                return Ok(());
            }

            session.state = session.state.transition_to(to)?;
            if session.state.is_terminal() {
                session.vault.wipe();
                session.token.cancel();
                SessionEvent::Ended {
                    session_id: id,
                    state: session.state.clone(),
                }
            } else {
                SessionEvent::StateChanged {
                    session_id: id,
                    state: session.state.clone(),
                }
            }
        };

        match &event {
            SessionEvent::Ended { state, .. } => {
                tracing::info!(session_id = id, %state, "Session ended");
            }
            SessionEvent::StateChanged { state, .. } => {
                tracing::debug!(session_id = id, %state, "Session state changed");
            }
            _ => {}
        }
        self.emit(event);
        Ok(())
    }

    /// End the live session normally, if any
    pub fn close_active(&self, reason: &str) {
        let id = self.lock().session.as_ref().map(|s| s.id);
        if let Some(id) = id {
            tracing::debug!(session_id = id, reason, "Closing active session");
            let _ = self.transition(id, SessionState::Closed);
        }
    }

    /// Free the slot held by session `id`
    ///
    /// A live session is closed first. Releasing a slot that has since
    /// been taken by another session does nothing.
    pub fn release(&self, id: u64) {
        let _ = self.transition(id, SessionState::Closed);
        let mut slot = self.lock();
        if slot.session.as_ref().is_some_and(|s| s.id == id) {
            slot.session = None;
        }
    }

    pub(crate) fn volume_changed(&self, id: u64, volume: f32) {
        self.emit(SessionEvent::VolumeChanged {
            session_id: id,
            volume,
        });
    }
}

/// Handle to one session held by its connection task and workers
#[derive(Clone)]
pub struct SessionControl {
    manager: Arc<SessionManager>,
    id: u64,
    peer: SocketAddr,
    token: CancellationToken,
    vault: Arc<KeyVault>,
}

impl SessionControl {
    /// Session ID
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sender address
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Token cancelled when the session ends
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Session key vault
    #[must_use]
    pub fn vault(&self) -> &Arc<KeyVault> {
        &self.vault
    }

    /// Current state of this session (`Closed` once released)
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.manager
            .current()
            .filter(|info| info.id == self.id)
            .map_or(SessionState::Closed, |info| info.state)
    }

    /// Whether the session has ended
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Move to the next state
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for a forbidden transition.
    pub fn transition(&self, to: SessionState) -> Result<(), MirrorError> {
        self.manager.transition(self.id, to)
    }

    /// End the session normally
    pub fn close(&self, reason: &str) {
        tracing::debug!(session_id = self.id, reason, "Closing session");
        let _ = self.manager.transition(self.id, SessionState::Closed);
    }

    /// End the session with an error
    pub fn fail(&self, error: &MirrorError) {
        tracing::warn!(session_id = self.id, category = error.category(), %error, "Session failed");
        let _ = self.manager.transition(
            self.id,
            SessionState::Errored {
                reason: error.to_string(),
            },
        );
    }

    /// Report a volume change from the sender
    pub fn volume_changed(&self, volume: f32) {
        self.manager.volume_changed(self.id, volume);
    }

    /// Free the slot; call once the connection task is done
    pub fn release(&self) {
        self.manager.release(self.id);
    }
}

impl std::fmt::Debug for SessionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionControl")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

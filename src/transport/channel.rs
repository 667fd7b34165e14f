use std::time::{Duration, Instant};

use bytes::Bytes;

use super::{
    Admission, ErrorBudget, FailureKind, PlainPacket, ReorderBuffer, ReorderStats,
    StreamDecryptor, TransportError,
};
use crate::protocol::rtp::split_packet;
use crate::session::keys::{KeyError, KeyVault};
use crate::sink::StreamKind;
use crate::types::TransportConfig;

/// Counters for one transport channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Raw packets offered to the channel
    pub packets_received: u64,
    /// Plaintext packets released downstream
    pub packets_delivered: u64,
    /// Tag verification failures
    pub integrity_failures: u64,
    /// Unparseable or misrouted packets
    pub malformed: u64,
    /// Reorder window counters
    pub reorder: ReorderStats,
}

/// Per-stream receive path: parse, window check, decrypt, reorder
///
/// ```text
/// raw ─► header ─► window? ─► open() ─► ReorderBuffer ─► ordered plaintext
///                     │          │
///                     └── drop + ErrorBudget ──► ThresholdExceeded
/// ```
///
/// The first packets of a stream, and of every stream restart after
/// [`flush`](Self::flush), are held for up to `startup_hold` so an
/// earlier sequence number arriving second is not rejected as late. The
/// reader calls [`release_held`](Self::release_held) once
/// [`hold_deadline`](Self::hold_deadline) passes.
pub struct TransportChannel {
    session_id: u64,
    kind: StreamKind,
    decryptor: StreamDecryptor,
    reorder: ReorderBuffer<PlainPacket>,
    budget: ErrorBudget,
    startup_hold: Duration,
    holding_since: Option<Instant>,
    restarted: bool,
    stats: TransportStats,
}

impl TransportChannel {
    /// Create the channel for one negotiated stream
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Key` when the session has no usable key.
    pub fn new(
        session_id: u64,
        kind: StreamKind,
        stream_connection_id: u64,
        vault: &KeyVault,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let key = vault.stream_key(kind, stream_connection_id)?;
        let decryptor = StreamDecryptor::new(&key).map_err(KeyError::from)?;
        Ok(Self {
            session_id,
            kind,
            decryptor,
            reorder: ReorderBuffer::new(config.reorder_window),
            budget: ErrorBudget::new(config.integrity_threshold),
            startup_hold: config.startup_hold,
            holding_since: None,
            restarted: false,
            stats: TransportStats::default(),
        })
    }

    /// Stream this channel carries
    #[must_use]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Process one raw packet
    ///
    /// Returns the packets released in sequence order, possibly none.
    ///
    /// # Errors
    ///
    /// Every rejected packet yields an error describing why. Once the
    /// error budget is spent the error is `ThresholdExceeded` and the
    /// caller must end the session.
    pub fn on_packet(
        &mut self,
        session_id: u64,
        raw: &[u8],
    ) -> Result<Vec<PlainPacket>, TransportError> {
        if session_id != self.session_id {
            return Err(TransportError::ForeignSession {
                expected: self.session_id,
                actual: session_id,
            });
        }
        self.stats.packets_received += 1;

        let (header, sealed) = match split_packet(raw) {
            Ok(parts) => parts,
            Err(e) => return Err(self.reject(FailureKind::Malformed, e.into())),
        };

        let kind = if header.payload_type.is_video() {
            StreamKind::Video
        } else {
            StreamKind::Audio
        };
        if kind != self.kind {
            let err = TransportError::UnexpectedPayload {
                kind: self.kind,
                payload_type: header.payload_type,
            };
            return Err(self.reject(FailureKind::Malformed, err));
        }

        let Some(sequence) = self.reorder.extend(header.sequence) else {
            self.reorder.record_rejection(Admission::Late);
            let err = TransportError::OutOfWindow {
                sequence: u64::from(header.sequence),
                admission: Admission::Late,
            };
            return Err(self.reject(FailureKind::Window(Admission::Late), err));
        };

        let admission = self.reorder.classify(sequence);
        if admission != Admission::Accept {
            self.reorder.record_rejection(admission);
            let err = TransportError::OutOfWindow {
                sequence,
                admission,
            };
            return Err(self.reject(FailureKind::Window(admission), err));
        }

        let payload = match self.decryptor.open(sequence, sealed.aad, sealed.payload) {
            Ok(payload) => payload,
            Err(e) => return Err(self.reject(FailureKind::Integrity, e.into())),
        };
        self.budget.record_success();

        let packet = PlainPacket {
            kind,
            payload_type: header.payload_type,
            sequence,
            timestamp: header.timestamp,
            marker: header.marker,
            discontinuity: false,
            payload: Bytes::from(payload),
        };
        let released = self.reorder.insert(sequence, packet);
        if !self.reorder.is_holding() {
            self.holding_since = None;
            return Ok(self.hand_over(released));
        }
        if self.startup_hold.is_zero() {
            return Ok(self.release_held());
        }
        self.holding_since.get_or_insert_with(Instant::now);
        Ok(released)
    }

    /// When held startup packets must be released, if any are held
    #[must_use]
    pub fn hold_deadline(&self) -> Option<Instant> {
        self.holding_since.map(|since| since + self.startup_hold)
    }

    /// Stop holding and release from the lowest sequence received
    pub fn release_held(&mut self) -> Vec<PlainPacket> {
        self.holding_since = None;
        let released = self.reorder.release_held();
        self.hand_over(released)
    }

    fn hand_over(&mut self, mut released: Vec<PlainPacket>) -> Vec<PlainPacket> {
        if let Some(first) = released.first_mut() {
            if self.restarted {
                first.discontinuity = true;
                self.restarted = false;
            }
        }
        self.stats.packets_delivered += released.len() as u64;
        released
    }

    fn reject(&mut self, failure: FailureKind, err: TransportError) -> TransportError {
        match failure {
            FailureKind::Integrity => self.stats.integrity_failures += 1,
            FailureKind::Malformed => self.stats.malformed += 1,
            FailureKind::Window(_) => {}
        }

        if self.budget.record_failure() {
            tracing::warn!(
                kind = %self.kind,
                count = self.budget.consecutive(),
                %failure,
                "Transport error threshold exceeded"
            );
            return TransportError::ThresholdExceeded {
                count: self.budget.consecutive(),
                last: failure,
            };
        }
        tracing::debug!(kind = %self.kind, error = %err, "Dropped packet");
        err
    }

    /// Discard buffered packets and restart the stream, e.g. after `FLUSH`
    ///
    /// The sender may resume at any sequence number. The error budget
    /// starts over and the next packet released is marked as a
    /// discontinuity so decoders drop their state too.
    pub fn flush(&mut self) {
        let dropped = self.reorder.pending_len();
        self.reorder.reset();
        self.budget.record_success();
        self.holding_since = None;
        self.restarted = true;
        tracing::debug!(kind = %self.kind, dropped, "Transport channel flushed");
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            reorder: self.reorder.stats(),
            ..self.stats
        }
    }
}

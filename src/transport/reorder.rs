//! Bounded reorder window over extended RTP sequence numbers

use std::collections::BTreeMap;

/// How an incoming sequence number relates to the window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Inside the window and not yet seen
    Accept,
    /// Behind the release point (already delivered or declared lost)
    Late,
    /// Already buffered
    Duplicate,
    /// More than one window ahead of the highest sequence seen
    TooFarAhead,
}

/// Counters kept by the reorder buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderStats {
    /// Packets inserted
    pub accepted: u64,
    /// Packets released in order
    pub released: u64,
    /// Packets that arrived out of order but were still placed
    pub reordered: u64,
    /// Sequence numbers skipped when the window slid past a gap
    pub lost: u64,
    /// Rejected as late
    pub late: u64,
    /// Rejected as duplicate
    pub duplicates: u64,
    /// Rejected as too far ahead
    pub too_far_ahead: u64,
}

/// Reorders items by sequence number within a bounded window
///
/// Items are released strictly in sequence order. When an item arrives a
/// full window past the release point, the missing sequence numbers are
/// declared lost so a single dropped datagram never stalls the stream.
///
/// A fresh buffer holds its first arrivals instead of releasing them, so
/// an earlier packet that overtook nothing can still take its place. The
/// release point is anchored at the lowest held sequence once the held
/// span covers a full window or the owner calls [`release_held`].
///
/// [`release_held`]: ReorderBuffer::release_held
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    window: u64,
    next: Option<u64>,
    highest: Option<u64>,
    // survives `reset` so sequence extension stays continuous
    reference: Option<u64>,
    pending: BTreeMap<u64, T>,
    stats: ReorderStats,
}

impl<T> ReorderBuffer<T> {
    /// Create a buffer tolerating `window` packets of disorder
    #[must_use]
    pub fn new(window: u16) -> Self {
        Self {
            window: u64::from(window.max(1)),
            next: None,
            highest: None,
            reference: None,
            pending: BTreeMap::new(),
            stats: ReorderStats::default(),
        }
    }

    /// Extend a 16-bit sequence number to 64 bits
    ///
    /// The result is the value closest to the highest sequence seen so
    /// far. Returns `None` for a number that would fall before zero.
    #[must_use]
    pub fn extend(&self, sequence: u16) -> Option<u64> {
        let Some(reference) = self.reference else {
            return Some(u64::from(sequence));
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let delta = i64::from(sequence.wrapping_sub(reference as u16) as i16);
        #[allow(clippy::cast_possible_wrap)]
        let extended = reference as i64 + delta;
        u64::try_from(extended).ok()
    }

    /// Classify an extended sequence number without changing state
    #[must_use]
    pub fn classify(&self, extended: u64) -> Admission {
        let Some(highest) = self.highest else {
            return Admission::Accept;
        };
        if self.next.is_some_and(|next| extended < next) {
            Admission::Late
        } else if self.pending.contains_key(&extended) {
            Admission::Duplicate
        } else if extended > highest + self.window {
            Admission::TooFarAhead
        } else if self.next.is_none() && extended + self.window <= highest {
            // holding: the span from here to `highest` would exceed the window
            Admission::Late
        } else {
            Admission::Accept
        }
    }

    /// Count a packet that `classify` rejected
    pub fn record_rejection(&mut self, admission: Admission) {
        match admission {
            Admission::Accept => {}
            Admission::Late => self.stats.late += 1,
            Admission::Duplicate => self.stats.duplicates += 1,
            Admission::TooFarAhead => self.stats.too_far_ahead += 1,
        }
    }

    /// Insert an accepted item and return everything now releasable
    ///
    /// The caller must have checked `classify` first; items that are not
    /// `Accept` are counted and discarded here.
    pub fn insert(&mut self, extended: u64, item: T) -> Vec<T> {
        let admission = self.classify(extended);
        if admission != Admission::Accept {
            self.record_rejection(admission);
            return Vec::new();
        }

        if self.highest.is_some_and(|h| extended < h) {
            self.stats.reordered += 1;
        }
        self.pending.insert(extended, item);
        self.stats.accepted += 1;
        let highest = self.highest.map_or(extended, |h| h.max(extended));
        self.highest = Some(highest);
        self.reference = Some(highest);

        match self.next {
            Some(next) => self.advance(next),
            None => {
                let lowest = self.pending.keys().next().copied().unwrap_or(extended);
                if highest + 1 >= lowest + self.window {
                    self.advance(lowest)
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Stop holding and release from the lowest sequence received
    ///
    /// Does nothing once the release point is anchored.
    pub fn release_held(&mut self) -> Vec<T> {
        if self.next.is_some() {
            return Vec::new();
        }
        match self.pending.keys().next().copied() {
            Some(lowest) => self.advance(lowest),
            None => Vec::new(),
        }
    }

    /// Whether arrivals are being held before the release point is set
    #[must_use]
    pub fn is_holding(&self) -> bool {
        self.next.is_none() && !self.pending.is_empty()
    }

    fn advance(&mut self, mut next: u64) -> Vec<T> {
        let mut released = Vec::new();

        if let Some(highest) = self.highest.filter(|&h| h >= next + self.window) {
            // Window saturated behind a gap: give up on the missing numbers
            let new_next = highest + 1 - self.window;
            let keep = self.pending.split_off(&new_next);
            let flushed = std::mem::replace(&mut self.pending, keep);
            let skipped = new_next - next - flushed.len() as u64;
            if skipped > 0 {
                tracing::debug!(from = next, to = new_next, skipped, "Reorder window slid past gap");
            }
            self.stats.lost += skipped;
            released.extend(flushed.into_values());
            next = new_next;
        }

        while let Some(item) = self.pending.remove(&next) {
            released.push(item);
            next += 1;
        }
        self.next = Some(next);
        self.stats.released += released.len() as u64;

        released
    }

    /// Number of items waiting for a gap to fill
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Next sequence number to be released
    #[must_use]
    pub fn next_expected(&self) -> Option<u64> {
        self.next
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    /// Drop buffered items and start holding again
    ///
    /// The window forgets where the stream was, so the next arrival may
    /// jump anywhere. Sequence extension stays continuous.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.next = None;
        self.highest = None;
    }
}

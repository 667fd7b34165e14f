//! RTP timestamp to presentation time conversion

use std::time::Duration;

/// Converts 32-bit RTP timestamps into presentation times
///
/// Timestamps are unwrapped to 64 bits and measured from the first
/// timestamp seen, so the first frame of a stream has PTS zero. After
/// [`restart`](Self::restart) the new timeline continues from the last
/// tick handed out.
#[derive(Debug, Clone)]
pub struct PtsClock {
    clock_rate: u32,
    base: Option<i64>,
    last_raw: u32,
    extended: i64,
    offset: u64,
    last_ticks: u64,
}

impl PtsClock {
    /// Create a clock ticking at `clock_rate` Hz
    #[must_use]
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate: clock_rate.max(1),
            base: None,
            last_raw: 0,
            extended: 0,
            offset: 0,
            last_ticks: 0,
        }
    }

    /// Ticks per second
    #[must_use]
    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Unwrap a timestamp to 64 bits relative to the stream start
    ///
    /// Timestamps earlier than the first one of the current timeline
    /// clamp to its start.
    pub fn unwrap(&mut self, timestamp: u32) -> u64 {
        let base = match self.base {
            Some(base) => {
                #[allow(clippy::cast_possible_wrap)]
                let delta = i64::from(timestamp.wrapping_sub(self.last_raw) as i32);
                self.extended += delta;
                base
            }
            None => {
                self.extended = i64::from(timestamp);
                self.base = Some(self.extended);
                self.extended
            }
        };
        self.last_raw = timestamp;
        self.last_ticks = self.offset + u64::try_from(self.extended - base).unwrap_or(0);
        self.last_ticks
    }

    /// Presentation time of `timestamp`
    pub fn pts(&mut self, timestamp: u32) -> Duration {
        let ticks = self.unwrap(timestamp);
        let rate = u64::from(self.clock_rate);
        Duration::from_secs(ticks / rate) + Duration::from_nanos((ticks % rate) * 1_000_000_000 / rate)
    }

    /// Start a new timeline at the next timestamp
    ///
    /// The sender may resume with any RTP timestamp; its first one maps
    /// to the last tick already returned, so PTS never goes backwards.
    pub fn restart(&mut self) {
        self.base = None;
        self.offset = self.last_ticks;
    }
}

/// Drops frames whose PTS would go backwards
#[derive(Debug, Clone, Default)]
pub struct MonotonicGate {
    last: Option<Duration>,
    rejected: u64,
}

impl MonotonicGate {
    /// Create an open gate
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a frame with `pts` may be delivered
    pub fn admit(&mut self, pts: Duration) -> bool {
        if self.last.is_some_and(|last| pts < last) {
            self.rejected += 1;
            return false;
        }
        self.last = Some(pts);
        true
    }

    /// Frames refused so far
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

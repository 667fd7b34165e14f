//! RTP framing for the mirroring data channels

mod packet;

#[cfg(test)]
mod packet_tests;

pub use packet::{PayloadType, RtpDecodeError, RtpHeader, SealedPacket, split_packet};

/// RTP clock rates used to convert timestamps
pub mod clock {
    /// Video timestamps tick at 90 kHz
    pub const VIDEO_CLOCK_RATE: u32 = 90_000;
}

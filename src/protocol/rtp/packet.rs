use thiserror::Error;

/// RTP payload types carried on the mirroring data channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    /// Audio frame (AAC or PCM)
    Audio = 0x60,
    /// Video fragment; the marker bit ends an access unit
    Video = 0x6E,
    /// Video codec configuration (avcC record)
    VideoConfig = 0x6F,
}

impl PayloadType {
    /// Parse from byte value
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x7F {
            0x60 => Some(Self::Audio),
            0x6E => Some(Self::Video),
            0x6F => Some(Self::VideoConfig),
            _ => None,
        }
    }

    /// Whether this payload belongs to the video stream
    #[must_use]
    pub fn is_video(self) -> bool {
        matches!(self, Self::Video | Self::VideoConfig)
    }
}

/// RTP header (12 bytes fixed, plus optional CSRCs and extension)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// Marker bit
    pub marker: bool,
    /// Payload type (7 bits)
    pub payload_type: PayloadType,
    /// Sequence number (16 bits)
    pub sequence: u16,
    /// Timestamp (32 bits)
    pub timestamp: u32,
    /// Synchronization source ID (32 bits)
    pub ssrc: u32,
}

impl RtpHeader {
    /// Fixed RTP header size
    pub const SIZE: usize = 12;

    /// Create a header without CSRCs or extension
    #[must_use]
    pub fn new(payload_type: PayloadType, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Set the marker bit
    #[must_use]
    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    /// Encode the fixed header
    #[must_use]
    pub fn encode(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];

        // V(2) | P(1) | X(1) | CC(4)
        buf[0] = 2 << 6;
        // M(1) | PT(7)
        buf[1] = (u8::from(self.marker) << 7) | (self.payload_type as u8 & 0x7F);
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        buf
    }

    /// Decode a header, returning it with its full encoded length
    ///
    /// # Errors
    ///
    /// Returns `RtpDecodeError` if the buffer is too small, the version is
    /// not 2 or the payload type is unknown.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), RtpDecodeError> {
        ensure_len(buf, Self::SIZE)?;

        let version = (buf[0] >> 6) & 0x03;
        if version != 2 {
            return Err(RtpDecodeError::InvalidVersion(version));
        }

        let payload_type_byte = buf[1] & 0x7F;
        let payload_type = PayloadType::from_byte(payload_type_byte)
            .ok_or(RtpDecodeError::UnknownPayloadType(payload_type_byte))?;

        let csrc_count = usize::from(buf[0] & 0x0F);
        let mut len = Self::SIZE + csrc_count * 4;
        ensure_len(buf, len)?;

        if buf[0] & 0x10 != 0 {
            // profile (16) | length in 32-bit words (16)
            ensure_len(buf, len + 4)?;
            let words = usize::from(u16::from_be_bytes([buf[len + 2], buf[len + 3]]));
            len += 4 + words * 4;
            ensure_len(buf, len)?;
        }

        let header = Self {
            marker: buf[1] & 0x80 != 0,
            payload_type,
            sequence: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        };
        Ok((header, len))
    }
}

fn ensure_len(buf: &[u8], needed: usize) -> Result<(), RtpDecodeError> {
    if buf.len() < needed {
        return Err(RtpDecodeError::BufferTooSmall {
            needed,
            have: buf.len(),
        });
    }
    Ok(())
}

/// RTP decode errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RtpDecodeError {
    /// Buffer shorter than the header claims
    #[error("buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall {
        /// Bytes required
        needed: usize,
        /// Bytes available
        have: usize,
    },

    /// Version field is not 2
    #[error("invalid RTP version: {0}")]
    InvalidVersion(u8),

    /// Payload type is not one of the mirroring types
    #[error("unknown payload type: 0x{0:02x}")]
    UnknownPayloadType(u8),

    /// Padding length exceeds the payload
    #[error("invalid padding length {0}")]
    InvalidPadding(u8),
}

/// A borrowed view of a received packet
///
/// `aad` is the raw header (including CSRCs and extension), which is
/// authenticated but not encrypted. `payload` is the sealed body with
/// any RTP padding removed.
#[derive(Debug, Clone, Copy)]
pub struct SealedPacket<'a> {
    /// Raw header bytes
    pub aad: &'a [u8],
    /// Sealed payload
    pub payload: &'a [u8],
}

/// Split a datagram into its parsed header, raw header bytes and payload
///
/// # Errors
///
/// Returns `RtpDecodeError` for malformed headers or padding.
pub fn split_packet(buf: &[u8]) -> Result<(RtpHeader, SealedPacket<'_>), RtpDecodeError> {
    let (header, header_len) = RtpHeader::decode(buf)?;
    let mut end = buf.len();

    if buf[0] & 0x20 != 0 {
        let pad = buf[end - 1];
        let pad_len = usize::from(pad);
        if pad_len == 0 || pad_len > end - header_len {
            return Err(RtpDecodeError::InvalidPadding(pad));
        }
        end -= pad_len;
    }

    Ok((
        header,
        SealedPacket {
            aad: &buf[..header_len],
            payload: &buf[header_len..end],
        },
    ))
}

//! Frame delivery to the host
//!
//! Decode workers push frames into a [`FrameSink`] from their own
//! threads. Implementations must be cheap and must not block: a slow
//! sink backs up the bounded decode queues.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

/// Elementary stream kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// H.264 screen video
    Video,
    /// AAC or PCM audio
    Audio,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => f.write_str("video"),
            Self::Audio => f.write_str("audio"),
        }
    }
}

/// Codec parameters of a negotiated stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecParameters {
    /// H.264 / AVC
    H264 {
        /// `profile_idc` from the active SPS
        profile: u8,
        /// `level_idc` from the active SPS
        level: u8,
        /// Raw avcC decoder configuration record
        avcc: Bytes,
    },
    /// AAC (LC or ELD), raw access units
    Aac {
        /// Audio object type (2 = LC, 39 = ELD)
        object_type: u8,
        /// Sample rate in Hz
        sample_rate: u32,
        /// Channel count
        channels: u8,
        /// Samples per channel per frame
        samples_per_frame: u32,
        /// AudioSpecificConfig
        asc: Bytes,
    },
    /// Linear PCM, big-endian
    Pcm {
        /// Sample rate in Hz
        sample_rate: u32,
        /// Channel count
        channels: u8,
        /// Bits per sample
        bits_per_sample: u8,
    },
}

/// Description of a stream's current format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Stream kind
    pub kind: StreamKind,
    /// Codec parameters
    pub codec: CodecParameters,
    /// Picture width (0 for audio)
    pub width: u32,
    /// Picture height (0 for audio)
    pub height: u32,
}

/// Layout of [`VideoFrame::data`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureFormat {
    /// Planar 8-bit YUV 4:2:0: the Y plane, then U, then V, rows packed
    /// without padding. Chroma planes are `ceil(width / 2)` by
    /// `ceil(height / 2)`.
    I420,
    /// Still-coded Annex-B NAL units with parameter sets prepended on
    /// keyframes, for hosts that decode themselves
    AnnexB,
}

/// One decoded video access unit
#[derive(Clone)]
pub struct VideoFrame {
    /// Presentation time since the first packet of the stream
    pub pts: Duration,
    /// Picture width
    pub width: u32,
    /// Picture height
    pub height: u32,
    /// Whether the unit is an IDR picture
    pub keyframe: bool,
    /// How `data` is laid out
    pub format: PictureFormat,
    /// Picture payload
    pub data: Bytes,
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("pts", &self.pts)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("keyframe", &self.keyframe)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// One decoded block of interleaved audio
#[derive(Clone)]
pub struct AudioFrame {
    /// Presentation time since the first packet of the stream
    pub pts: Duration,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u8,
    /// Interleaved 16-bit samples
    pub samples: Vec<i16>,
}

impl fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioFrame")
            .field("pts", &self.pts)
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("samples", &self.samples.len())
            .finish()
    }
}

/// Host callback surface for decoded media
pub trait FrameSink: Send + Sync {
    /// A video access unit is ready
    fn on_video_frame(&self, frame: VideoFrame);

    /// A block of audio is ready
    fn on_audio_frame(&self, frame: AudioFrame);

    /// A stream's format changed; called before the first frame in the
    /// new format
    fn on_format_changed(&self, descriptor: &StreamDescriptor) {
        let _ = descriptor;
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn on_video_frame(&self, _frame: VideoFrame) {}

    fn on_audio_frame(&self, _frame: AudioFrame) {}
}

//! Decode pipeline between the transport and the frame sink
//!
//! Ordered plaintext packets are queued per stream and consumed by a
//! dedicated worker thread that assembles, decodes and timestamps frames.

pub mod audio;
pub mod bits;
pub mod clock;
pub mod h264;
pub mod queue;
#[cfg(feature = "h264-decoder")]
pub mod software;
pub mod video;
mod worker;

pub use audio::{AudioCodec, AudioDecodeError, AudioDecoder, AudioFormat, AudioStage, AacDecoder, PcmDecoder};
pub use clock::{MonotonicGate, PtsClock};
pub use queue::{PacketReceiver, PacketSender, QueueClosed, bounded};
#[cfg(feature = "h264-decoder")]
pub use software::SoftwareDecoder;
pub use video::{
    AccessUnit, AccessUnitAssembler, DecodedPicture, PassthroughDecoder, VideoDecodeError,
    VideoDecoder, VideoDimensions, VideoStage,
};
pub use worker::{DecodeWorker, PacketStage, PipelineSnapshot, PipelineStats, StageFactory, spawn_worker};

use std::sync::Arc;

/// Creates a video decoder for each new stream
pub type VideoDecoderFactory =
    Arc<dyn Fn() -> Result<Box<dyn VideoDecoder>, VideoDecodeError> + Send + Sync>;

/// Creates an audio decoder for a negotiated format
pub type AudioDecoderFactory =
    Arc<dyn Fn(&AudioFormat) -> Result<Box<dyn AudioDecoder>, AudioDecodeError> + Send + Sync>;

/// Factory for the built-in [`SoftwareDecoder`], delivering I420 pictures
#[cfg(feature = "h264-decoder")]
#[must_use]
pub fn default_video_decoder() -> VideoDecoderFactory {
    Arc::new(|| Ok(Box::new(SoftwareDecoder::new()?) as Box<dyn VideoDecoder>))
}

/// Factory for [`PassthroughDecoder`]; the only choice without the
/// `h264-decoder` feature
#[cfg(not(feature = "h264-decoder"))]
#[must_use]
pub fn default_video_decoder() -> VideoDecoderFactory {
    passthrough_video_decoder()
}

/// Factory for [`PassthroughDecoder`], delivering still-coded Annex-B
/// units to hosts that decode themselves
#[must_use]
pub fn passthrough_video_decoder() -> VideoDecoderFactory {
    Arc::new(|| Ok(Box::new(PassthroughDecoder::new()) as Box<dyn VideoDecoder>))
}

/// Factory for the built-in PCM and AAC decoders
#[must_use]
pub fn default_audio_decoder() -> AudioDecoderFactory {
    Arc::new(audio::decoder_for)
}

//! Audio decode stage
//!
//! Mirroring audio is either big-endian linear PCM or raw AAC access
//! units (LC or ELD) described by an AudioSpecificConfig.

use std::sync::Arc;

use bytes::Bytes;
use fdk_aac::dec::{Decoder, Transport};
use thiserror::Error;

use super::bits::BitWriter;
use super::clock::{MonotonicGate, PtsClock};
use super::worker::PacketStage;
use crate::error::MirrorError;
use crate::protocol::rtp::PayloadType;
use crate::sink::{AudioFrame, CodecParameters, FrameSink, StreamDescriptor, StreamKind};
use crate::transport::PlainPacket;

/// AAC sampling frequency table, indexed by `samplingFrequencyIndex`
const SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

/// Room for one decoded frame: 2048 samples per channel, 8 channels
const MAX_DECODED_SAMPLES: usize = 2048 * 8;

/// Audio decoding errors
#[derive(Debug, Error)]
pub enum AudioDecodeError {
    /// Compression type not handled
    #[error("unsupported audio compression type {0}")]
    UnsupportedCodec(u64),

    /// Format parameters out of range
    #[error("invalid audio format: {0}")]
    InvalidFormat(String),

    /// Decoder rejected the configuration
    #[error("decoder configuration failed")]
    Configuration,

    /// Payload could not be decoded
    #[error("audio decode failed: {0}")]
    Corrupt(String),
}

/// Audio codec negotiated at SETUP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    /// Linear PCM, big-endian
    Pcm {
        /// Bits per sample (16 or 24)
        bits_per_sample: u8,
    },
    /// AAC Low Complexity
    AacLc,
    /// AAC Enhanced Low Delay
    AacEld,
}

impl AudioCodec {
    /// Map the SETUP `ct` compression type
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedCodec` for anything but 1, 4 or 8.
    pub fn from_compression_type(ct: u64) -> Result<Self, AudioDecodeError> {
        match ct {
            1 => Ok(Self::Pcm { bits_per_sample: 16 }),
            4 => Ok(Self::AacLc),
            8 => Ok(Self::AacEld),
            other => Err(AudioDecodeError::UnsupportedCodec(other)),
        }
    }

    /// MPEG-4 audio object type (0 for PCM)
    #[must_use]
    pub fn object_type(self) -> u8 {
        match self {
            Self::Pcm { .. } => 0,
            Self::AacLc => 2,
            Self::AacEld => 39,
        }
    }
}

/// Audio stream format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    /// Codec
    pub codec: AudioCodec,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u8,
    /// Samples per channel per packet
    pub samples_per_frame: u32,
    /// AudioSpecificConfig supplied by the sender
    pub asc: Option<Bytes>,
}

impl AudioFormat {
    /// Validate and build a format
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for zero or out-of-range parameters.
    pub fn new(
        codec: AudioCodec,
        sample_rate: u32,
        channels: u8,
        samples_per_frame: u32,
        asc: Option<Bytes>,
    ) -> Result<Self, AudioDecodeError> {
        if !(8_000..=192_000).contains(&sample_rate) {
            return Err(AudioDecodeError::InvalidFormat(format!(
                "sample rate {sample_rate}"
            )));
        }
        if !(1..=8).contains(&channels) {
            return Err(AudioDecodeError::InvalidFormat(format!("{channels} channels")));
        }
        if samples_per_frame == 0 || samples_per_frame > 4096 {
            return Err(AudioDecodeError::InvalidFormat(format!(
                "{samples_per_frame} samples per frame"
            )));
        }
        Ok(Self {
            codec,
            sample_rate,
            channels,
            samples_per_frame,
            asc,
        })
    }

    /// AudioSpecificConfig: the sender's, or one generated from the format
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for PCM, which has none.
    pub fn audio_specific_config(&self) -> Result<Bytes, AudioDecodeError> {
        if let Some(asc) = &self.asc {
            return Ok(asc.clone());
        }
        let mut w = BitWriter::new();
        let object_type = self.codec.object_type();
        match self.codec {
            AudioCodec::Pcm { .. } => {
                return Err(AudioDecodeError::InvalidFormat(
                    "PCM has no AudioSpecificConfig".into(),
                ));
            }
            AudioCodec::AacLc => w.write_bits(u32::from(object_type), 5),
            AudioCodec::AacEld => {
                w.write_bits(31, 5);
                w.write_bits(u32::from(object_type - 32), 6);
            }
        }

        match SAMPLE_RATES.iter().position(|&r| r == self.sample_rate) {
            #[allow(clippy::cast_possible_truncation)]
            Some(index) => w.write_bits(index as u32, 4),
            None => {
                w.write_bits(0x0F, 4);
                w.write_bits(self.sample_rate, 24);
            }
        }
        w.write_bits(u32::from(self.channels), 4);

        let short_frame = matches!(self.samples_per_frame, 480 | 960);
        match self.codec {
            AudioCodec::AacLc => {
                // frameLengthFlag, dependsOnCoreCoder, extensionFlag
                w.write_bit(short_frame);
                w.write_bit(false);
                w.write_bit(false);
            }
            AudioCodec::AacEld => {
                w.write_bit(short_frame);
                // section, scalefactor and spectral resilience flags
                w.write_bits(0, 3);
                // ldSbrPresentFlag
                w.write_bit(false);
                // ELDEXT_TERM
                w.write_bits(0, 4);
                // epConfig
                w.write_bits(0, 2);
            }
            AudioCodec::Pcm { .. } => {}
        }
        Ok(Bytes::from(w.finish()))
    }

    /// Descriptor announced to the sink
    #[must_use]
    pub fn descriptor(&self) -> StreamDescriptor {
        let codec = match self.codec {
            AudioCodec::Pcm { bits_per_sample } => CodecParameters::Pcm {
                sample_rate: self.sample_rate,
                channels: self.channels,
                bits_per_sample,
            },
            AudioCodec::AacLc | AudioCodec::AacEld => CodecParameters::Aac {
                object_type: self.codec.object_type(),
                sample_rate: self.sample_rate,
                channels: self.channels,
                samples_per_frame: self.samples_per_frame,
                asc: self.audio_specific_config().unwrap_or_default(),
            },
        };
        StreamDescriptor {
            kind: StreamKind::Audio,
            codec,
            width: 0,
            height: 0,
        }
    }
}

/// Pluggable audio decoder producing interleaved 16-bit samples
pub trait AudioDecoder {
    /// Decode one packet payload
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is corrupt. The caller skips it.
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, AudioDecodeError>;

    /// Drop any buffered state
    fn reset(&mut self) {}
}

/// Build the built-in decoder for `format`
///
/// # Errors
///
/// Returns an error if the decoder cannot be configured.
pub fn decoder_for(format: &AudioFormat) -> Result<Box<dyn AudioDecoder>, AudioDecodeError> {
    match format.codec {
        AudioCodec::Pcm { bits_per_sample } => {
            Ok(Box::new(PcmDecoder::new(bits_per_sample, format.channels)?))
        }
        AudioCodec::AacLc | AudioCodec::AacEld => Ok(Box::new(AacDecoder::new(format)?)),
    }
}

/// Big-endian linear PCM to 16-bit samples
#[derive(Debug, Clone)]
pub struct PcmDecoder {
    bytes_per_sample: usize,
    channels: usize,
}

impl PcmDecoder {
    /// Decoder for 16- or 24-bit samples
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for other sample sizes.
    pub fn new(bits_per_sample: u8, channels: u8) -> Result<Self, AudioDecodeError> {
        let bytes_per_sample = match bits_per_sample {
            16 => 2,
            24 => 3,
            other => {
                return Err(AudioDecodeError::InvalidFormat(format!(
                    "{other}-bit PCM"
                )));
            }
        };
        Ok(Self {
            bytes_per_sample,
            channels: usize::from(channels.max(1)),
        })
    }
}

impl AudioDecoder for PcmDecoder {
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, AudioDecodeError> {
        let frame = self.bytes_per_sample * self.channels;
        if payload.len() % frame != 0 {
            return Err(AudioDecodeError::Corrupt(format!(
                "{} bytes is not a whole number of {frame}-byte frames",
                payload.len()
            )));
        }
        // 24-bit samples keep their top 16 bits
        Ok(payload
            .chunks_exact(self.bytes_per_sample)
            .map(|s| i16::from_be_bytes([s[0], s[1]]))
            .collect())
    }
}

/// AAC-LC / AAC-ELD decoder backed by fdk-aac
pub struct AacDecoder {
    decoder: Decoder,
    asc: Bytes,
    pcm: Vec<i16>,
}

impl AacDecoder {
    /// Configure a raw-transport decoder from the format's ASC
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if fdk-aac rejects the ASC.
    pub fn new(format: &AudioFormat) -> Result<Self, AudioDecodeError> {
        let asc = format.audio_specific_config()?;
        let decoder = configured(&asc)?;
        tracing::debug!(asc = ?asc, "AAC decoder configured");
        Ok(Self {
            decoder,
            asc,
            pcm: vec![0; MAX_DECODED_SAMPLES],
        })
    }
}

fn configured(asc: &[u8]) -> Result<Decoder, AudioDecodeError> {
    let mut decoder = Decoder::new(Transport::Raw);
    decoder
        .config_raw(asc)
        .map_err(|_| AudioDecodeError::Configuration)?;
    Ok(decoder)
}

impl AudioDecoder for AacDecoder {
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>, AudioDecodeError> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        self.decoder
            .fill(payload)
            .map_err(|_| AudioDecodeError::Corrupt("payload rejected".into()))?;
        self.decoder
            .decode_frame(&mut self.pcm)
            .map_err(|_| AudioDecodeError::Corrupt("frame decode failed".into()))?;
        let samples = self.decoder.decoded_frame_size().min(self.pcm.len());
        Ok(self.pcm[..samples].to_vec())
    }

    fn reset(&mut self) {
        match configured(&self.asc) {
            Ok(decoder) => self.decoder = decoder,
            Err(e) => tracing::warn!(error = %e, "AAC decoder not reset"),
        }
    }
}

/// Worker stage turning audio packets into frames
pub struct AudioStage {
    decoder: Box<dyn AudioDecoder>,
    format: AudioFormat,
    clock: PtsClock,
    gate: MonotonicGate,
    sink: Arc<dyn FrameSink>,
    announced: bool,
}

impl AudioStage {
    /// Create a stage delivering into `sink`
    #[must_use]
    pub fn new(decoder: Box<dyn AudioDecoder>, format: AudioFormat, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            decoder,
            clock: PtsClock::new(format.sample_rate),
            format,
            gate: MonotonicGate::new(),
            sink,
            announced: false,
        }
    }
}

impl PacketStage for AudioStage {
    fn kind(&self) -> StreamKind {
        StreamKind::Audio
    }

    fn handle(&mut self, packet: &PlainPacket) -> Result<usize, MirrorError> {
        if packet.payload_type != PayloadType::Audio {
            return Ok(0);
        }
        let samples = self.decoder.decode(&packet.payload)?;
        if samples.is_empty() {
            return Ok(0);
        }

        let pts = self.clock.pts(packet.timestamp);
        if !self.gate.admit(pts) {
            tracing::debug!(?pts, "Dropping audio frame with regressing timestamp");
            return Ok(0);
        }
        if !self.announced {
            self.sink.on_format_changed(&self.format.descriptor());
            self.announced = true;
        }
        self.sink.on_audio_frame(AudioFrame {
            pts,
            sample_rate: self.format.sample_rate,
            channels: self.format.channels,
            samples,
        });
        Ok(1)
    }

    fn reset(&mut self) {
        self.decoder.reset();
        self.clock.restart();
    }
}

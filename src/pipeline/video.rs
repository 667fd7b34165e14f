//! Video decode stage
//!
//! Fragments are joined into access units, codec configuration packets
//! reconfigure the decoder, and decoded pictures are stamped and handed
//! to the sink.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::clock::{MonotonicGate, PtsClock};
use super::h264::{self, AvcConfig, H264Error, NAL_IDR, NAL_PPS, NAL_SPS, SpsInfo};
use super::worker::PacketStage;
use crate::error::MirrorError;
use crate::protocol::rtp::PayloadType;
use crate::protocol::rtp::clock::VIDEO_CLOCK_RATE;
use crate::sink::{CodecParameters, FrameSink, PictureFormat, StreamDescriptor, StreamKind, VideoFrame};
use crate::transport::PlainPacket;

/// Largest access unit the assembler buffers
pub const MAX_ACCESS_UNIT: usize = 8 * 1024 * 1024;

/// Video decoding errors
#[derive(Debug, Error)]
pub enum VideoDecodeError {
    /// Bitstream could not be parsed
    #[error(transparent)]
    Bitstream(#[from] H264Error),

    /// A unit arrived before any codec configuration
    #[error("decoder not configured")]
    NotConfigured,

    /// Host-supplied decoder failed
    #[error("decoder failure: {0}")]
    Decoder(String),
}

/// A complete coded picture
#[derive(Debug, Clone)]
pub struct AccessUnit {
    /// RTP timestamp shared by all fragments
    pub timestamp: u32,
    /// Length-prefixed NAL units
    pub data: Bytes,
}

/// A picture ready for the sink
#[derive(Debug, Clone)]
pub struct DecodedPicture {
    /// IDR picture
    pub keyframe: bool,
    /// Layout of `data`
    pub format: PictureFormat,
    /// Picture width
    pub width: u32,
    /// Picture height
    pub height: u32,
    /// Picture payload
    pub data: Bytes,
}

/// Pluggable video decoder
///
/// Decoders are created on the worker thread that uses them, so they
/// need not be `Send`.
pub trait VideoDecoder {
    /// Apply a new decoder configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unusable.
    fn configure(&mut self, config: &AvcConfig) -> Result<(), VideoDecodeError>;

    /// Decode one access unit; `Ok(None)` means no output yet
    ///
    /// # Errors
    ///
    /// Returns an error if the unit is corrupt. The caller skips it.
    fn decode(&mut self, unit: &AccessUnit) -> Result<Option<DecodedPicture>, VideoDecodeError>;

    /// Drop any buffered state
    fn flush(&mut self);
}

/// An access unit rewritten with start codes
pub(crate) struct AnnexBUnit {
    pub keyframe: bool,
    pub data: Bytes,
}

/// Rewrite an AVCC unit as Annex-B
///
/// The configured parameter sets are prepended when `with_parameter_sets`
/// is set or the unit is an IDR picture, unless the unit carries its own.
pub(crate) fn to_annex_b(
    config: &AvcConfig,
    unit: &AccessUnit,
    with_parameter_sets: bool,
) -> Result<AnnexBUnit, VideoDecodeError> {
    let nals = h264::split_length_prefixed(&unit.data, config.length_size)?;
    let keyframe = nals.iter().any(|n| h264::nal_type(n) == Some(NAL_IDR));
    let has_parameter_sets = nals.iter().any(|n| h264::nal_type(n) == Some(NAL_SPS));

    let parameter_sets = config.parameter_sets_annex_b();
    let mut out = BytesMut::with_capacity(unit.data.len() + parameter_sets.len() + 16);
    if (keyframe || with_parameter_sets) && !has_parameter_sets {
        out.extend_from_slice(&parameter_sets);
    }
    for nal in nals {
        h264::push_annex_b(&mut out, nal);
    }
    Ok(AnnexBUnit {
        keyframe,
        data: out.freeze(),
    })
}

/// Validates AVCC access units and re-emits them still coded, as Annex-B
///
/// For hosts that feed their own H.264 decoder. Parameter sets are
/// prepended on IDR pictures so every keyframe is independently
/// decodable.
#[derive(Debug, Default)]
pub struct PassthroughDecoder {
    config: Option<(AvcConfig, SpsInfo)>,
}

impl PassthroughDecoder {
    /// Unconfigured decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl VideoDecoder for PassthroughDecoder {
    fn configure(&mut self, config: &AvcConfig) -> Result<(), VideoDecodeError> {
        let sps = config.sps_info()?;
        self.config = Some((config.clone(), sps));
        Ok(())
    }

    fn decode(&mut self, unit: &AccessUnit) -> Result<Option<DecodedPicture>, VideoDecodeError> {
        let (config, sps) = self.config.as_ref().ok_or(VideoDecodeError::NotConfigured)?;
        let AnnexBUnit { keyframe, data } = to_annex_b(config, unit, false)?;
        Ok(Some(DecodedPicture {
            keyframe,
            format: PictureFormat::AnnexB,
            width: sps.width,
            height: sps.height,
            data,
        }))
    }

    fn flush(&mut self) {}
}

#[derive(Debug, Default, Clone, Copy)]
struct DimensionsSlot {
    owner: Option<u64>,
    width: u32,
    height: u32,
}

/// Negotiated picture size, readable from any thread
///
/// The dimensions belong to one session at a time. Writes from any
/// other session are ignored, so a session winding down cannot clobber
/// the one that replaced it.
#[derive(Debug, Default)]
pub struct VideoDimensions {
    slot: Mutex<DimensionsSlot>,
}

impl VideoDimensions {
    /// Zero dimensions, unowned
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DimensionsSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `(width, height)`
    #[must_use]
    pub fn get(&self) -> (u32, u32) {
        let slot = *self.lock();
        (slot.width, slot.height)
    }

    /// Hand the dimensions to `session_id`, starting from zero
    pub fn claim(&self, session_id: u64) {
        *self.lock() = DimensionsSlot {
            owner: Some(session_id),
            width: 0,
            height: 0,
        };
    }

    /// Publish new dimensions; returns `false` if `session_id` is not the owner
    pub fn set(&self, session_id: u64, width: u32, height: u32) -> bool {
        let mut slot = self.lock();
        if slot.owner != Some(session_id) {
            return false;
        }
        slot.width = width;
        slot.height = height;
        true
    }

    /// Back to zero if `session_id` still owns the dimensions
    pub fn release(&self, session_id: u64) -> bool {
        let mut slot = self.lock();
        if slot.owner != Some(session_id) {
            return false;
        }
        *slot = DimensionsSlot::default();
        true
    }

    /// Back to zero regardless of owner
    pub fn reset(&self) {
        *self.lock() = DimensionsSlot::default();
    }
}

/// Joins RTP fragments into access units
///
/// A unit ends at the fragment carrying the marker bit. A sequence gap
/// or a timestamp change without a marker discards the partial unit.
#[derive(Debug)]
pub struct AccessUnitAssembler {
    buffer: BytesMut,
    timestamp: Option<u32>,
    next_sequence: Option<u64>,
    broken: bool,
    discarded: u64,
    max_size: usize,
}

impl AccessUnitAssembler {
    /// Assembler with the default size limit
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_size(MAX_ACCESS_UNIT)
    }

    /// Assembler refusing units larger than `max_size`
    #[must_use]
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            timestamp: None,
            next_sequence: None,
            broken: false,
            discarded: 0,
            max_size,
        }
    }

    /// Units dropped because of loss or overflow
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Whether a unit is being collected
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.timestamp.is_some()
    }

    /// Account for a non-fragment packet sharing the sequence space
    pub fn skip(&mut self, sequence: u64) {
        if self.take_gap(sequence) {
            self.broken = true;
        }
    }

    /// Add one fragment, returning the unit it completes
    pub fn push(&mut self, sequence: u64, timestamp: u32, marker: bool, payload: &[u8]) -> Option<AccessUnit> {
        let gap = self.take_gap(sequence);

        if self.in_progress() && self.timestamp != Some(timestamp) {
            tracing::debug!(
                previous = ?self.timestamp,
                timestamp,
                "Access unit ended without marker, discarding"
            );
            self.discard();
            self.broken = gap;
        } else if gap {
            self.broken = true;
        }

        self.timestamp = Some(timestamp);
        if !self.broken {
            if self.buffer.len() + payload.len() > self.max_size {
                tracing::warn!(size = self.buffer.len() + payload.len(), "Access unit too large");
                self.broken = true;
                self.buffer.clear();
            } else {
                self.buffer.extend_from_slice(payload);
            }
        }

        if !marker {
            return None;
        }

        let unit = if self.broken {
            self.discarded += 1;
            self.buffer.clear();
            None
        } else {
            Some(AccessUnit {
                timestamp,
                data: self.buffer.split().freeze(),
            })
        };
        self.timestamp = None;
        self.broken = false;
        unit
    }

    /// Drop the partial unit, keeping sequence tracking
    pub fn flush(&mut self) {
        self.buffer.clear();
        self.timestamp = None;
        self.broken = false;
    }

    /// Drop the partial unit and forget the sequence position
    ///
    /// The next fragment starts a fresh unit whatever its sequence number.
    pub fn reset(&mut self) {
        self.flush();
        self.next_sequence = None;
    }

    fn take_gap(&mut self, sequence: u64) -> bool {
        let gap = self.next_sequence.is_some_and(|expected| expected != sequence);
        self.next_sequence = Some(sequence + 1);
        gap
    }

    fn discard(&mut self) {
        self.buffer.clear();
        self.timestamp = None;
        self.broken = false;
        self.discarded += 1;
    }
}

impl Default for AccessUnitAssembler {
    fn default() -> Self {
        Self::new()
    }
}

struct ActiveFormat {
    sps: SpsInfo,
    avcc: Bytes,
    length_size: u8,
}

/// Worker stage turning video packets into frames
pub struct VideoStage {
    session_id: u64,
    decoder: Box<dyn VideoDecoder>,
    assembler: AccessUnitAssembler,
    clock: PtsClock,
    gate: MonotonicGate,
    sink: Arc<dyn FrameSink>,
    dimensions: Arc<VideoDimensions>,
    format: Option<ActiveFormat>,
    pending_announcement: Option<StreamDescriptor>,
}

impl VideoStage {
    /// Create a stage for `session_id` delivering into `sink`
    #[must_use]
    pub fn new(
        session_id: u64,
        decoder: Box<dyn VideoDecoder>,
        sink: Arc<dyn FrameSink>,
        dimensions: Arc<VideoDimensions>,
    ) -> Self {
        Self {
            session_id,
            decoder,
            assembler: AccessUnitAssembler::new(),
            clock: PtsClock::new(VIDEO_CLOCK_RATE),
            gate: MonotonicGate::new(),
            sink,
            dimensions,
            format: None,
            pending_announcement: None,
        }
    }

    /// Units dropped by the assembler
    #[must_use]
    pub fn discarded_units(&self) -> u64 {
        self.assembler.discarded()
    }

    fn reconfigure(&mut self, config: &AvcConfig) -> Result<(), VideoDecodeError> {
        let avcc = config.to_bytes();
        if self.format.as_ref().is_some_and(|f| f.avcc == avcc) {
            return Ok(());
        }
        let sps = config.sps_info()?;

        self.assembler.flush();
        self.decoder.flush();
        self.decoder.configure(config)?;
        if !self.dimensions.set(self.session_id, sps.width, sps.height) {
            tracing::debug!(session_id = self.session_id, "Dimensions owned by another session");
        }

        tracing::info!(
            width = sps.width,
            height = sps.height,
            profile = sps.profile_idc,
            level = sps.level_idc,
            length_size = config.length_size,
            "Video format changed"
        );
        self.pending_announcement = Some(StreamDescriptor {
            kind: StreamKind::Video,
            codec: CodecParameters::H264 {
                profile: sps.profile_idc,
                level: sps.level_idc,
                avcc: avcc.clone(),
            },
            width: sps.width,
            height: sps.height,
        });
        self.format = Some(ActiveFormat {
            sps,
            avcc,
            length_size: config.length_size,
        });
        Ok(())
    }

    /// Pick up parameter sets sent inside an access unit
    ///
    /// The unit is framed with the negotiated length size; before any
    /// configuration the common 4-byte framing is assumed.
    fn check_in_band_config(&mut self, unit: &AccessUnit) -> Result<(), VideoDecodeError> {
        let length_size = self.format.as_ref().map_or(4, |f| f.length_size);
        let Ok(nals) = h264::split_length_prefixed(&unit.data, length_size) else {
            return Ok(());
        };
        let Some(sps) = nals.iter().find(|n| h264::nal_type(n) == Some(NAL_SPS)) else {
            return Ok(());
        };
        let sps_info = SpsInfo::parse(sps)?;
        if self.format.as_ref().is_some_and(|f| f.sps == sps_info) {
            return Ok(());
        }
        let pps = nals.iter().find(|n| h264::nal_type(n) == Some(NAL_PPS)).copied();
        let config = AvcConfig::from_parameter_sets(sps, pps, length_size)?;
        self.reconfigure(&config)
    }

    fn decode_unit(&mut self, unit: &AccessUnit) -> Result<usize, VideoDecodeError> {
        self.check_in_band_config(unit)?;

        let Some(picture) = self.decoder.decode(unit)? else {
            return Ok(0);
        };
        let pts = self.clock.pts(unit.timestamp);
        if !self.gate.admit(pts) {
            tracing::debug!(?pts, "Dropping video frame with regressing timestamp");
            return Ok(0);
        }

        if let Some(descriptor) = self.pending_announcement.take() {
            self.sink.on_format_changed(&descriptor);
        }
        self.sink.on_video_frame(VideoFrame {
            pts,
            width: picture.width,
            height: picture.height,
            keyframe: picture.keyframe,
            format: picture.format,
            data: picture.data,
        });
        Ok(1)
    }
}

impl PacketStage for VideoStage {
    fn kind(&self) -> StreamKind {
        StreamKind::Video
    }

    fn handle(&mut self, packet: &PlainPacket) -> Result<usize, MirrorError> {
        match packet.payload_type {
            PayloadType::VideoConfig => {
                self.assembler.skip(packet.sequence);
                let config = AvcConfig::parse(&packet.payload).map_err(VideoDecodeError::from)?;
                self.reconfigure(&config)?;
                Ok(0)
            }
            PayloadType::Video => {
                match self.assembler.push(
                    packet.sequence,
                    packet.timestamp,
                    packet.marker,
                    &packet.payload,
                ) {
                    Some(unit) => self.decode_unit(&unit).map_err(MirrorError::from),
                    None => Ok(0),
                }
            }
            PayloadType::Audio => Ok(0),
        }
    }

    fn reset(&mut self) {
        // The negotiated format survives a flush; only in-flight state goes
        self.assembler.reset();
        self.decoder.flush();
        self.clock.restart();
        tracing::debug!(session_id = self.session_id, "Video stage reset");
    }
}

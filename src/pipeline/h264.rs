//! H.264 bitstream helpers
//!
//! Just enough of the syntax to track the stream format: NAL unit
//! splitting, the avcC decoder configuration record and the sequence
//! parameter set fields that determine the picture size.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::bits::{BitError, BitReader};

/// NAL unit type of a sequence parameter set
pub const NAL_SPS: u8 = 7;
/// NAL unit type of a picture parameter set
pub const NAL_PPS: u8 = 8;
/// NAL unit type of an IDR slice
pub const NAL_IDR: u8 = 5;

const ANNEX_B_START: [u8; 4] = [0, 0, 0, 1];

/// Profiles whose SPS carries chroma format and bit depth fields
const HIGH_PROFILES: [u8; 12] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134];

/// H.264 parsing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum H264Error {
    /// Bitstream ended early or had an oversized code
    #[error("bitstream error: {0}")]
    Bits(#[from] BitError),

    /// NAL unit is not of the expected type
    #[error("expected NAL type {expected}, found {actual}")]
    UnexpectedNalType {
        /// Expected type
        expected: u8,
        /// Type found
        actual: u8,
    },

    /// Decoder configuration record is malformed
    #[error("invalid avcC record: {0}")]
    InvalidConfig(&'static str),

    /// Length-prefixed NAL data is inconsistent
    #[error("invalid NAL framing at offset {0}")]
    InvalidFraming(usize),

    /// Parsed dimensions are zero or cropped below zero
    #[error("invalid picture dimensions")]
    InvalidDimensions,
}

/// NAL unit type from the first header byte
#[must_use]
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1F)
}

/// Strip emulation prevention bytes (`00 00 03` -> `00 00`)
#[must_use]
pub fn unescape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &byte in data {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

/// Insert emulation prevention bytes into a raw RBSP
#[must_use]
pub fn escape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 64);
    let mut zeros = 0;
    for &byte in data {
        if zeros >= 2 && byte <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

/// Split length-prefixed (AVCC) NAL units
///
/// # Errors
///
/// Returns `InvalidFraming` when a length runs past the buffer, a NAL
/// unit is empty or its forbidden bit is set.
pub fn split_length_prefixed(data: &[u8], length_size: u8) -> Result<Vec<&[u8]>, H264Error> {
    let size = usize::from(length_size);
    if !(1..=4).contains(&size) || size == 3 {
        return Err(H264Error::InvalidConfig("NAL length size must be 1, 2 or 4"));
    }

    let mut nals = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let header = data
            .get(offset..offset + size)
            .ok_or(H264Error::InvalidFraming(offset))?;
        let len = header.iter().fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
        let start = offset + size;
        let nal = start
            .checked_add(len)
            .and_then(|end| data.get(start..end))
            .ok_or(H264Error::InvalidFraming(offset))?;
        if nal.is_empty() || nal[0] & 0x80 != 0 {
            return Err(H264Error::InvalidFraming(offset));
        }
        nals.push(nal);
        offset = start + len;
    }
    Ok(nals)
}

/// Append `nal` to `out` with an Annex-B start code
pub fn push_annex_b(out: &mut BytesMut, nal: &[u8]) {
    out.put_slice(&ANNEX_B_START);
    out.put_slice(nal);
}

/// Fields of a sequence parameter set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    /// `profile_idc`
    pub profile_idc: u8,
    /// Constraint flags byte
    pub constraint_flags: u8,
    /// `level_idc`
    pub level_idc: u8,
    /// `seq_parameter_set_id`
    pub sps_id: u32,
    /// `chroma_format_idc` (1 = 4:2:0)
    pub chroma_format_idc: u32,
    /// Displayed width after cropping
    pub width: u32,
    /// Displayed height after cropping
    pub height: u32,
}

impl SpsInfo {
    /// Parse an SPS NAL unit, header byte included
    ///
    /// # Errors
    ///
    /// Returns `H264Error` if the NAL is not an SPS or is truncated.
    pub fn parse(nal: &[u8]) -> Result<Self, H264Error> {
        let actual = nal_type(nal).ok_or(H264Error::Bits(BitError::Truncated(0)))?;
        if actual != NAL_SPS {
            return Err(H264Error::UnexpectedNalType {
                expected: NAL_SPS,
                actual,
            });
        }

        let rbsp = unescape_rbsp(&nal[1..]);
        let mut r = BitReader::new(&rbsp);

        #[allow(clippy::cast_possible_truncation)]
        let (profile_idc, constraint_flags, level_idc) = (
            r.read_bits(8)? as u8,
            r.read_bits(8)? as u8,
            r.read_bits(8)? as u8,
        );
        let sps_id = r.read_ue()?;

        let mut chroma_format_idc = 1;
        let mut separate_colour_plane = false;
        if HIGH_PROFILES.contains(&profile_idc) || profile_idc == 135 {
            chroma_format_idc = r.read_ue()?;
            if chroma_format_idc == 3 {
                separate_colour_plane = r.read_flag()?;
            }
            let _bit_depth_luma = r.read_ue()?;
            let _bit_depth_chroma = r.read_ue()?;
            let _qpprime_y_zero_transform_bypass = r.read_flag()?;
            if r.read_flag()? {
                let lists = if chroma_format_idc == 3 { 12 } else { 8 };
                for i in 0..lists {
                    if r.read_flag()? {
                        skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        let _log2_max_frame_num = r.read_ue()?;
        match r.read_ue()? {
            0 => {
                let _log2_max_poc_lsb = r.read_ue()?;
            }
            1 => {
                let _delta_pic_order_always_zero = r.read_flag()?;
                let _offset_for_non_ref_pic = r.read_se()?;
                let _offset_for_top_to_bottom = r.read_se()?;
                let cycle = r.read_ue()?;
                if cycle > 255 {
                    return Err(H264Error::InvalidConfig("pic order cycle too long"));
                }
                for _ in 0..cycle {
                    let _offset_for_ref_frame = r.read_se()?;
                }
            }
            _ => {}
        }

        let _max_num_ref_frames = r.read_ue()?;
        let _gaps_in_frame_num_allowed = r.read_flag()?;
        let width_mbs = u64::from(r.read_ue()?) + 1;
        let height_map_units = u64::from(r.read_ue()?) + 1;
        let frame_mbs_only = r.read_flag()?;
        if !frame_mbs_only {
            let _mb_adaptive_frame_field = r.read_flag()?;
        }
        let _direct_8x8_inference = r.read_flag()?;

        let field_factor = if frame_mbs_only { 1 } else { 2 };
        let mut width = width_mbs * 16;
        let mut height = field_factor * height_map_units * 16;

        if r.read_flag()? {
            let left = u64::from(r.read_ue()?);
            let right = u64::from(r.read_ue()?);
            let top = u64::from(r.read_ue()?);
            let bottom = u64::from(r.read_ue()?);

            let chroma_array_type = if separate_colour_plane { 0 } else { chroma_format_idc };
            let (unit_x, unit_y) = match chroma_array_type {
                0 => (1, field_factor),
                1 => (2, 2 * field_factor),
                2 => (2, field_factor),
                _ => (1, field_factor),
            };
            width = width
                .checked_sub((left + right) * unit_x)
                .ok_or(H264Error::InvalidDimensions)?;
            height = height
                .checked_sub((top + bottom) * unit_y)
                .ok_or(H264Error::InvalidDimensions)?;
        }

        let width = u32::try_from(width).map_err(|_| H264Error::InvalidDimensions)?;
        let height = u32::try_from(height).map_err(|_| H264Error::InvalidDimensions)?;
        if width == 0 || height == 0 {
            return Err(H264Error::InvalidDimensions);
        }

        Ok(Self {
            profile_idc,
            constraint_flags,
            level_idc,
            sps_id,
            chroma_format_idc,
            width,
            height,
        })
    }
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<(), H264Error> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = r.read_se()?;
            next = (last + delta).rem_euclid(256);
        }
        if next != 0 {
            last = next;
        }
    }
    Ok(())
}

/// AVC decoder configuration record (`avcC`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfig {
    /// `AVCProfileIndication`
    pub profile: u8,
    /// `profile_compatibility`
    pub compatibility: u8,
    /// `AVCLevelIndication`
    pub level: u8,
    /// Size of the NAL length prefix in bytes
    pub length_size: u8,
    /// Sequence parameter sets
    pub sps: Vec<Bytes>,
    /// Picture parameter sets
    pub pps: Vec<Bytes>,
}

impl AvcConfig {
    /// Parse an avcC record
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a wrong version, missing SPS or a
    /// parameter set running past the buffer.
    pub fn parse(data: &[u8]) -> Result<Self, H264Error> {
        if data.len() < 7 {
            return Err(H264Error::InvalidConfig("record too short"));
        }
        if data[0] != 1 {
            return Err(H264Error::InvalidConfig("unsupported version"));
        }
        let length_size = (data[4] & 0x03) + 1;
        if length_size == 3 {
            return Err(H264Error::InvalidConfig("NAL length size must be 1, 2 or 4"));
        }

        let mut offset = 5;
        let sps_count = data[offset] & 0x1F;
        offset += 1;
        let sps = read_parameter_sets(data, &mut offset, sps_count)?;

        let pps_count = *data
            .get(offset)
            .ok_or(H264Error::InvalidConfig("missing PPS count"))?;
        offset += 1;
        let pps = read_parameter_sets(data, &mut offset, pps_count)?;

        if sps.is_empty() {
            return Err(H264Error::InvalidConfig("no SPS"));
        }
        if sps.iter().any(|s| nal_type(s) != Some(NAL_SPS)) {
            return Err(H264Error::InvalidConfig("SPS entry has wrong NAL type"));
        }

        Ok(Self {
            profile: data[1],
            compatibility: data[2],
            level: data[3],
            length_size,
            sps,
            pps,
        })
    }

    /// Build a record from in-band parameter sets
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `sps` is too short to carry a profile.
    pub fn from_parameter_sets(sps: &[u8], pps: Option<&[u8]>, length_size: u8) -> Result<Self, H264Error> {
        if sps.len() < 4 || nal_type(sps) != Some(NAL_SPS) {
            return Err(H264Error::InvalidConfig("SPS too short"));
        }
        Ok(Self {
            profile: sps[1],
            compatibility: sps[2],
            level: sps[3],
            length_size,
            sps: vec![Bytes::copy_from_slice(sps)],
            pps: pps.map(Bytes::copy_from_slice).into_iter().collect(),
        })
    }

    /// Parse the first SPS
    ///
    /// # Errors
    ///
    /// Propagates SPS parse errors.
    pub fn sps_info(&self) -> Result<SpsInfo, H264Error> {
        let sps = self.sps.first().ok_or(H264Error::InvalidConfig("no SPS"))?;
        SpsInfo::parse(sps)
    }

    /// Serialize back to an avcC record
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(
            11 + self.sps.iter().chain(&self.pps).map(|p| p.len() + 2).sum::<usize>(),
        );
        out.put_u8(1);
        out.put_u8(self.profile);
        out.put_u8(self.compatibility);
        out.put_u8(self.level);
        out.put_u8(0xFC | (self.length_size.saturating_sub(1) & 0x03));
        #[allow(clippy::cast_possible_truncation)]
        out.put_u8(0xE0 | (self.sps.len() as u8 & 0x1F));
        for sps in &self.sps {
            #[allow(clippy::cast_possible_truncation)]
            out.put_u16(sps.len() as u16);
            out.put_slice(sps);
        }
        #[allow(clippy::cast_possible_truncation)]
        out.put_u8(self.pps.len() as u8);
        for pps in &self.pps {
            #[allow(clippy::cast_possible_truncation)]
            out.put_u16(pps.len() as u16);
            out.put_slice(pps);
        }
        out.freeze()
    }

    /// Parameter sets as Annex-B, SPS first
    #[must_use]
    pub fn parameter_sets_annex_b(&self) -> Bytes {
        let mut out = BytesMut::new();
        for nal in self.sps.iter().chain(&self.pps) {
            push_annex_b(&mut out, nal);
        }
        out.freeze()
    }
}

fn read_parameter_sets(data: &[u8], offset: &mut usize, count: u8) -> Result<Vec<Bytes>, H264Error> {
    let mut sets = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let len_bytes = data
            .get(*offset..*offset + 2)
            .ok_or(H264Error::InvalidConfig("truncated parameter set length"))?;
        let len = usize::from(u16::from_be_bytes([len_bytes[0], len_bytes[1]]));
        let start = *offset + 2;
        let set = data
            .get(start..start + len)
            .ok_or(H264Error::InvalidConfig("truncated parameter set"))?;
        if set.is_empty() {
            return Err(H264Error::InvalidConfig("empty parameter set"));
        }
        sets.push(Bytes::copy_from_slice(set));
        *offset = start + len;
    }
    Ok(sets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::h264::{SpsBuilder, avcc_record};

    const SPS_640X480: [u8; 9] = [0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x02, 0x80, 0xF6, 0x40];

    #[test]
    fn test_parse_baseline_sps() {
        let info = SpsInfo::parse(&SPS_640X480).unwrap();
        assert_eq!(info.profile_idc, 66);
        assert_eq!(info.level_idc, 30);
        assert_eq!((info.width, info.height), (640, 480));
    }

    #[test]
    fn test_parse_cropped_1080p() {
        let sps = SpsBuilder::new(1920, 1080).build();
        let info = SpsInfo::parse(&sps).unwrap();
        assert_eq!((info.width, info.height), (1920, 1080));
    }

    #[test]
    fn test_parse_high_profile_with_scaling_lists() {
        let sps = SpsBuilder::new(1280, 720)
            .profile(100)
            .scaling_lists(true)
            .build();
        let info = SpsInfo::parse(&sps).unwrap();
        assert_eq!(info.profile_idc, 100);
        assert_eq!(info.chroma_format_idc, 1);
        assert_eq!((info.width, info.height), (1280, 720));
    }

    #[test]
    fn test_parse_interlaced_with_poc_type_one() {
        let sps = SpsBuilder::new(720, 576).interlaced(true).poc_type(1).build();
        let info = SpsInfo::parse(&sps).unwrap();
        assert_eq!((info.width, info.height), (720, 576));
    }

    #[test]
    fn test_sps_rejects_wrong_nal_type() {
        let err = SpsInfo::parse(&[0x68, 0xCE, 0x38, 0x80]).unwrap_err();
        assert_eq!(
            err,
            H264Error::UnexpectedNalType {
                expected: NAL_SPS,
                actual: NAL_PPS
            }
        );
    }

    #[test]
    fn test_sps_truncated() {
        assert!(matches!(
            SpsInfo::parse(&SPS_640X480[..5]),
            Err(H264Error::Bits(_))
        ));
    }

    #[test]
    fn test_emulation_prevention() {
        let raw = [0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x05];
        let escaped = escape_rbsp(&raw);
        assert_eq!(escaped, vec![0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00, 0x05]);
        assert_eq!(unescape_rbsp(&escaped), raw.to_vec());
    }

    #[test]
    fn test_avcc_parse() {
        let record = avcc_record(&SPS_640X480, &[0x68, 0xCE, 0x38, 0x80]);
        let config = AvcConfig::parse(&record).unwrap();
        assert_eq!(config.profile, 0x42);
        assert_eq!(config.length_size, 4);
        assert_eq!(config.sps.len(), 1);
        assert_eq!(config.pps.len(), 1);
        assert_eq!(config.to_bytes(), Bytes::from(record));
        assert_eq!(config.sps_info().unwrap().width, 640);
    }

    #[test]
    fn test_avcc_rejects_truncated_sets() {
        let record = avcc_record(&SPS_640X480, &[0x68, 0xCE, 0x38, 0x80]);
        assert!(AvcConfig::parse(&record[..record.len() - 2]).is_err());
        assert!(AvcConfig::parse(&record[..4]).is_err());

        let mut bad_version = record.clone();
        bad_version[0] = 2;
        assert!(AvcConfig::parse(&bad_version).is_err());
    }

    #[test]
    fn test_split_length_prefixed() {
        let data = [0, 0, 0, 2, 0x65, 0xAA, 0, 0, 0, 1, 0x41];
        let nals = split_length_prefixed(&data, 4).unwrap();
        assert_eq!(nals, vec![&[0x65, 0xAA][..], &[0x41][..]]);
    }

    #[test]
    fn test_split_rejects_bad_lengths() {
        assert!(split_length_prefixed(&[0, 0, 0, 9, 0x65], 4).is_err());
        assert!(split_length_prefixed(&[0, 0, 0, 0], 4).is_err());
        assert!(split_length_prefixed(&[0, 0, 0, 1, 0x85], 4).is_err());
        assert!(split_length_prefixed(&[0, 0], 4).is_err());
    }
}

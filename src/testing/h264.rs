//! Synthetic H.264 parameter sets and access units

use crate::pipeline::bits::BitWriter;
use crate::pipeline::h264::escape_rbsp;

/// A minimal picture parameter set
pub const PPS: [u8; 4] = [0x68, 0xCE, 0x38, 0x80];

/// Builds sequence parameter sets for arbitrary picture sizes
#[derive(Debug, Clone)]
pub struct SpsBuilder {
    width: u32,
    height: u32,
    profile: u8,
    level: u8,
    scaling_lists: bool,
    interlaced: bool,
    poc_type: u32,
}

impl SpsBuilder {
    /// Baseline profile SPS for `width` x `height`
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            profile: 66,
            level: 40,
            scaling_lists: false,
            interlaced: false,
            poc_type: 2,
        }
    }

    /// Set `profile_idc`
    #[must_use]
    pub fn profile(mut self, profile: u8) -> Self {
        self.profile = profile;
        self
    }

    /// Emit scaling matrices (high profiles only)
    #[must_use]
    pub fn scaling_lists(mut self, enabled: bool) -> Self {
        self.scaling_lists = enabled;
        self
    }

    /// Field coding instead of frame-only
    #[must_use]
    pub fn interlaced(mut self, enabled: bool) -> Self {
        self.interlaced = enabled;
        self
    }

    /// Set `pic_order_cnt_type` (0, 1 or 2)
    #[must_use]
    pub fn poc_type(mut self, poc_type: u32) -> Self {
        self.poc_type = poc_type;
        self
    }

    /// Encode the SPS NAL unit, header byte included
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.write_bits(u32::from(self.profile), 8);
        w.write_bits(0, 8);
        w.write_bits(u32::from(self.level), 8);
        w.write_ue(0);

        if matches!(self.profile, 100 | 110 | 122 | 244) {
            w.write_ue(1);
            w.write_ue(0);
            w.write_ue(0);
            w.write_bit(false);
            w.write_bit(self.scaling_lists);
            if self.scaling_lists {
                for i in 0..8 {
                    let present = i % 2 == 0;
                    w.write_bit(present);
                    if present {
                        let size = if i < 6 { 16 } else { 64 };
                        w.write_se(8);
                        for _ in 1..size {
                            w.write_se(0);
                        }
                    }
                }
            }
        }

        w.write_ue(0);
        w.write_ue(self.poc_type);
        match self.poc_type {
            0 => w.write_ue(0),
            1 => {
                w.write_bit(false);
                w.write_se(0);
                w.write_se(0);
                w.write_ue(2);
                w.write_se(1);
                w.write_se(-1);
            }
            _ => {}
        }

        w.write_ue(1);
        w.write_bit(false);

        let field = if self.interlaced { 2 } else { 1 };
        let width_mbs = self.width.div_ceil(16);
        let height_units = self.height.div_ceil(16 * field);
        w.write_ue(width_mbs - 1);
        w.write_ue(height_units - 1);
        w.write_bit(!self.interlaced);
        if self.interlaced {
            w.write_bit(false);
        }
        w.write_bit(true);

        let crop_right = width_mbs * 16 - self.width;
        let crop_bottom = height_units * 16 * field - self.height;
        if crop_right > 0 || crop_bottom > 0 {
            w.write_bit(true);
            w.write_ue(0);
            w.write_ue(crop_right / 2);
            w.write_ue(0);
            w.write_ue(crop_bottom / (2 * field));
        } else {
            w.write_bit(false);
        }
        w.write_bit(false);

        let mut nal = vec![0x67];
        nal.extend_from_slice(&escape_rbsp(&w.finish_rbsp()));
        nal
    }
}

/// avcC record carrying one SPS and one PPS with 4-byte NAL lengths
#[must_use]
pub fn avcc_record(sps: &[u8], pps: &[u8]) -> Vec<u8> {
    let mut out = vec![1, sps[1], sps[2], sps[3], 0xFF, 0xE1];
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    out.extend_from_slice(sps);
    out.push(1);
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    out.extend_from_slice(pps);
    out
}

/// Join NAL units with 4-byte big-endian length prefixes
#[must_use]
pub fn length_prefixed(nals: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for nal in nals {
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

/// A length-prefixed IDR slice of `size` bytes
#[must_use]
pub fn idr_unit(size: usize) -> Vec<u8> {
    let mut slice = vec![0xAB; size.max(2)];
    slice[0] = 0x65;
    length_prefixed(&[&slice])
}

/// A length-prefixed non-IDR slice of `size` bytes
#[must_use]
pub fn slice_unit(size: usize) -> Vec<u8> {
    let mut slice = vec![0xCD; size.max(2)];
    slice[0] = 0x41;
    length_prefixed(&[&slice])
}

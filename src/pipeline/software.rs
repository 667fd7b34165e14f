//! Software H.264 decoding with OpenH264
//!
//! Produces packed I420 pictures for hosts that render frames directly.

use bytes::{BufMut, BytesMut};
use openh264::decoder::Decoder;
use openh264::formats::YUVSource;

use super::h264::AvcConfig;
use super::video::{AccessUnit, AnnexBUnit, DecodedPicture, VideoDecodeError, VideoDecoder, to_annex_b};
use crate::sink::PictureFormat;

/// H.264 decoder producing I420 pictures
pub struct SoftwareDecoder {
    decoder: Decoder,
    config: Option<AvcConfig>,
    // parameter sets must reach a fresh decoder before its first slice
    primed: bool,
}

impl SoftwareDecoder {
    /// Create an unconfigured decoder
    ///
    /// # Errors
    ///
    /// Returns `Decoder` if OpenH264 cannot be initialised.
    pub fn new() -> Result<Self, VideoDecodeError> {
        Ok(Self {
            decoder: open()?,
            config: None,
            primed: false,
        })
    }
}

fn open() -> Result<Decoder, VideoDecodeError> {
    Decoder::new().map_err(|e| VideoDecodeError::Decoder(e.to_string()))
}

impl VideoDecoder for SoftwareDecoder {
    fn configure(&mut self, config: &AvcConfig) -> Result<(), VideoDecodeError> {
        config.sps_info()?;
        self.config = Some(config.clone());
        self.primed = false;
        Ok(())
    }

    fn decode(&mut self, unit: &AccessUnit) -> Result<Option<DecodedPicture>, VideoDecodeError> {
        let config = self.config.as_ref().ok_or(VideoDecodeError::NotConfigured)?;
        let AnnexBUnit { keyframe, data } = to_annex_b(config, unit, !self.primed)?;
        self.primed = true;

        let decoded = self
            .decoder
            .decode(&data)
            .map_err(|e| VideoDecodeError::Decoder(e.to_string()))?;
        let Some(yuv) = decoded else {
            return Ok(None);
        };

        let (width, height) = yuv.dimensions();
        let (y_stride, u_stride, v_stride) = yuv.strides();
        let (chroma_width, chroma_height) = (width.div_ceil(2), height.div_ceil(2));

        let mut out = BytesMut::with_capacity(width * height + 2 * chroma_width * chroma_height);
        copy_plane(&mut out, yuv.y(), y_stride, width, height)?;
        copy_plane(&mut out, yuv.u(), u_stride, chroma_width, chroma_height)?;
        copy_plane(&mut out, yuv.v(), v_stride, chroma_width, chroma_height)?;

        Ok(Some(DecodedPicture {
            keyframe,
            format: PictureFormat::I420,
            width: u32::try_from(width).map_err(|_| VideoDecodeError::Decoder("picture too wide".into()))?,
            height: u32::try_from(height).map_err(|_| VideoDecodeError::Decoder("picture too tall".into()))?,
            data: out.freeze(),
        }))
    }

    fn flush(&mut self) {
        // OpenH264 keeps reference pictures; a fresh instance is the only
        // way to drop them
        match open() {
            Ok(decoder) => {
                self.decoder = decoder;
                self.primed = false;
            }
            Err(e) => tracing::warn!(error = %e, "Video decoder not reset"),
        }
    }
}

/// Append `rows` rows of `width` bytes from a plane with row pitch `stride`
fn copy_plane(
    out: &mut BytesMut,
    plane: &[u8],
    stride: usize,
    width: usize,
    rows: usize,
) -> Result<(), VideoDecodeError> {
    for row in 0..rows {
        let start = row * stride;
        let line = plane
            .get(start..start + width)
            .ok_or_else(|| VideoDecodeError::Decoder(format!("plane too short at row {row}")))?;
        out.put_slice(line);
    }
    Ok(())
}

/// Packed I420 size of a `width` by `height` picture
#[must_use]
pub fn i420_len(width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    w * h + 2 * w.div_ceil(2) * h.div_ceil(2)
}

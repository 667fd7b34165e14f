use byteorder::{BigEndian, ByteOrder};
use std::collections::BTreeMap;

use super::{PlistError, PlistValue};

pub(super) const MAGIC: &[u8; 8] = b"bplist00";
pub(super) const TRAILER_LEN: usize = 32;

/// Deepest container nesting accepted; reference cycles hit this too
const MAX_DEPTH: usize = 32;

struct Trailer {
    offset_size: usize,
    ref_size: usize,
    num_objects: usize,
    top_object: u64,
    offset_table: usize,
}

impl Trailer {
    fn parse(data: &[u8]) -> Result<Self, PlistError> {
        let t = &data[data.len() - TRAILER_LEN..];
        let offset_size = usize::from(t[6]);
        let ref_size = usize::from(t[7]);
        let num_objects =
            usize::try_from(BigEndian::read_u64(&t[8..16])).map_err(|_| PlistError::InvalidTrailer)?;
        let top_object = BigEndian::read_u64(&t[16..24]);
        let offset_table =
            usize::try_from(BigEndian::read_u64(&t[24..32])).map_err(|_| PlistError::InvalidTrailer)?;

        let table_end = num_objects
            .checked_mul(offset_size)
            .and_then(|len| len.checked_add(offset_table))
            .ok_or(PlistError::InvalidTrailer)?;

        let valid = (1..=8).contains(&offset_size)
            && (1..=8).contains(&ref_size)
            && num_objects > 0
            && top_object < num_objects as u64
            && offset_table >= MAGIC.len()
            && table_end <= data.len() - TRAILER_LEN;
        if !valid {
            return Err(PlistError::InvalidTrailer);
        }

        Ok(Self {
            offset_size,
            ref_size,
            num_objects,
            top_object,
            offset_table,
        })
    }
}

/// Decode a binary plist
///
/// # Errors
///
/// Returns `PlistError` for any structural problem; never panics on
/// malformed input.
pub fn decode(data: &[u8]) -> Result<PlistValue, PlistError> {
    if data.len() < MAGIC.len() + TRAILER_LEN || !data.starts_with(MAGIC) {
        return Err(PlistError::InvalidHeader);
    }

    let trailer = Trailer::parse(data)?;
    let offsets = (0..trailer.num_objects)
        .map(|i| {
            let at = trailer.offset_table + i * trailer.offset_size;
            usize::try_from(read_uint(&data[at..at + trailer.offset_size]))
                .map_err(|_| PlistError::InvalidTrailer)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let decoder = Decoder {
        data: &data[..trailer.offset_table],
        offsets,
        ref_size: trailer.ref_size,
    };
    decoder.object(trailer.top_object, 0)
}

fn read_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

struct Decoder<'a> {
    data: &'a [u8],
    offsets: Vec<usize>,
    ref_size: usize,
}

impl Decoder<'_> {
    fn bytes(&self, start: usize, len: usize) -> Result<&[u8], PlistError> {
        let end = start.checked_add(len).ok_or(PlistError::Truncated(start))?;
        self.data.get(start..end).ok_or(PlistError::Truncated(start))
    }

    fn object(&self, index: u64, depth: usize) -> Result<PlistValue, PlistError> {
        if depth > MAX_DEPTH {
            return Err(PlistError::TooDeep);
        }
        let offset = usize::try_from(index)
            .ok()
            .and_then(|i| self.offsets.get(i))
            .copied()
            .ok_or(PlistError::InvalidReference(index))?;

        let marker = *self.bytes(offset, 1)?.first().ok_or(PlistError::Truncated(offset))?;
        let low = marker & 0x0F;

        match marker >> 4 {
            0x0 => match marker {
                0x08 => Ok(PlistValue::Boolean(false)),
                0x09 => Ok(PlistValue::Boolean(true)),
                _ => Err(PlistError::UnsupportedMarker(marker)),
            },
            0x1 => self.integer(offset + 1, low).map(PlistValue::Integer),
            0x2 => self.real(offset + 1, low).map(PlistValue::Real),
            0x3 if low == 3 => self.real(offset + 1, 3).map(PlistValue::Date),
            0x4 => {
                let (len, start) = self.length(offset, low)?;
                Ok(PlistValue::Data(self.bytes(start, len)?.to_vec()))
            }
            0x5 => {
                let (len, start) = self.length(offset, low)?;
                let raw = self.bytes(start, len)?;
                if !raw.is_ascii() {
                    return Err(PlistError::InvalidString);
                }
                String::from_utf8(raw.to_vec())
                    .map(PlistValue::String)
                    .map_err(|_| PlistError::InvalidString)
            }
            0x6 => {
                let (units, start) = self.length(offset, low)?;
                let raw = self.bytes(start, units.checked_mul(2).ok_or(PlistError::Truncated(start))?)?;
                let utf16: Vec<u16> = raw.chunks_exact(2).map(BigEndian::read_u16).collect();
                String::from_utf16(&utf16)
                    .map(PlistValue::String)
                    .map_err(|_| PlistError::InvalidString)
            }
            0x8 => {
                let raw = self.bytes(offset + 1, usize::from(low) + 1)?;
                i64::try_from(read_uint(raw))
                    .map(PlistValue::Integer)
                    .map_err(|_| PlistError::UnsupportedMarker(marker))
            }
            0xA => {
                let (len, start) = self.length(offset, low)?;
                let items = (0..len)
                    .map(|i| self.object(self.reference(start, i)?, depth + 1))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(PlistValue::Array(items))
            }
            0xD => {
                let (len, start) = self.length(offset, low)?;
                let mut dict = BTreeMap::new();
                for i in 0..len {
                    let key = match self.object(self.reference(start, i)?, depth + 1)? {
                        PlistValue::String(s) => s,
                        _ => return Err(PlistError::NonStringKey),
                    };
                    let value = self.object(self.reference(start, len + i)?, depth + 1)?;
                    dict.insert(key, value);
                }
                Ok(PlistValue::Dictionary(dict))
            }
            _ => Err(PlistError::UnsupportedMarker(marker)),
        }
    }

    fn reference(&self, start: usize, i: usize) -> Result<u64, PlistError> {
        let at = i
            .checked_mul(self.ref_size)
            .and_then(|o| o.checked_add(start))
            .ok_or(PlistError::Truncated(start))?;
        Ok(read_uint(self.bytes(at, self.ref_size)?))
    }

    fn integer(&self, start: usize, size_exp: u8) -> Result<i64, PlistError> {
        match size_exp {
            0..=2 => {
                let raw = self.bytes(start, 1 << size_exp)?;
                i64::try_from(read_uint(raw)).map_err(|_| PlistError::UnsupportedMarker(0x10 | size_exp))
            }
            3 => Ok(BigEndian::read_i64(self.bytes(start, 8)?)),
            // 128-bit integers carry the value in the low 8 bytes
            4 => Ok(BigEndian::read_i64(&self.bytes(start, 16)?[8..])),
            _ => Err(PlistError::UnsupportedMarker(0x10 | size_exp)),
        }
    }

    fn real(&self, start: usize, size_exp: u8) -> Result<f64, PlistError> {
        match size_exp {
            2 => Ok(f64::from(BigEndian::read_f32(self.bytes(start, 4)?))),
            3 => Ok(BigEndian::read_f64(self.bytes(start, 8)?)),
            _ => Err(PlistError::UnsupportedMarker(0x20 | size_exp)),
        }
    }

    /// Element count and the offset where the payload begins
    fn length(&self, offset: usize, low: u8) -> Result<(usize, usize), PlistError> {
        if low != 0x0F {
            return Ok((usize::from(low), offset + 1));
        }
        let int_marker = *self
            .bytes(offset + 1, 1)?
            .first()
            .ok_or(PlistError::Truncated(offset + 1))?;
        if int_marker >> 4 != 0x1 {
            return Err(PlistError::UnsupportedMarker(int_marker));
        }
        let size_exp = int_marker & 0x0F;
        let value = self.integer(offset + 2, size_exp)?;
        let len = usize::try_from(value).map_err(|_| PlistError::Truncated(offset))?;
        Ok((len, offset + 2 + (1usize << size_exp.min(4))))
    }
}

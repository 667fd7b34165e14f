//! Bit-level reading and writing for codec headers

use thiserror::Error;

/// Ran out of bits, or an exp-Golomb code was too long
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BitError {
    /// Read past the end of the buffer
    #[error("bitstream truncated at bit {0}")]
    Truncated(usize),
    /// Exp-Golomb code longer than 32 bits
    #[error("exp-Golomb code too long at bit {0}")]
    GolombOverflow(usize),
}

/// MSB-first bit reader
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    /// Read from the start of `data`
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bits consumed so far
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bits left
    #[must_use]
    pub fn remaining(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.pos)
    }

    /// Read one bit
    ///
    /// # Errors
    ///
    /// Returns `Truncated` at the end of the buffer.
    pub fn read_bit(&mut self) -> Result<bool, BitError> {
        let byte = self
            .data
            .get(self.pos / 8)
            .ok_or(BitError::Truncated(self.pos))?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Ok(bit == 1)
    }

    /// Read a flag (alias of `read_bit` that reads better in syntax tables)
    ///
    /// # Errors
    ///
    /// Returns `Truncated` at the end of the buffer.
    pub fn read_flag(&mut self) -> Result<bool, BitError> {
        self.read_bit()
    }

    /// Read up to 32 bits as an unsigned integer
    ///
    /// # Errors
    ///
    /// Returns `Truncated` at the end of the buffer.
    pub fn read_bits(&mut self, count: u8) -> Result<u32, BitError> {
        debug_assert!(count <= 32);
        if self.remaining() < usize::from(count) {
            return Err(BitError::Truncated(self.pos));
        }
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | u32::from(self.read_bit()?);
        }
        Ok(value)
    }

    /// Skip `count` bits
    ///
    /// # Errors
    ///
    /// Returns `Truncated` if fewer bits remain.
    pub fn skip(&mut self, count: usize) -> Result<(), BitError> {
        if self.remaining() < count {
            return Err(BitError::Truncated(self.pos));
        }
        self.pos += count;
        Ok(())
    }

    /// Unsigned exp-Golomb code, `ue(v)`
    ///
    /// # Errors
    ///
    /// Returns `GolombOverflow` for codes longer than 32 bits.
    pub fn read_ue(&mut self) -> Result<u32, BitError> {
        let start = self.pos;
        let mut leading_zeros = 0u8;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(BitError::GolombOverflow(start));
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let suffix = self.read_bits(leading_zeros)?;
        Ok(((1u32 << leading_zeros) - 1) + suffix)
    }

    /// Signed exp-Golomb code, `se(v)`
    ///
    /// # Errors
    ///
    /// Same as [`read_ue`](Self::read_ue).
    pub fn read_se(&mut self) -> Result<i32, BitError> {
        let code = i64::from(self.read_ue()?);
        let value = if code % 2 == 1 { (code + 1) / 2 } else { -(code / 2) };
        i32::try_from(value).map_err(|_| BitError::GolombOverflow(self.pos))
    }
}

/// MSB-first bit writer
#[derive(Debug, Clone, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    bits: usize,
}

impl BitWriter {
    /// Empty writer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one bit
    pub fn write_bit(&mut self, bit: bool) {
        if self.bits % 8 == 0 {
            self.bytes.push(0);
        }
        if bit {
            let last = self.bytes.len() - 1;
            self.bytes[last] |= 1 << (7 - (self.bits % 8));
        }
        self.bits += 1;
    }

    /// Append the low `count` bits of `value`, most significant first
    pub fn write_bits(&mut self, value: u32, count: u8) {
        for i in (0..count).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    /// Append an unsigned exp-Golomb code
    pub fn write_ue(&mut self, value: u32) {
        let code = u64::from(value) + 1;
        #[allow(clippy::cast_possible_truncation)]
        let len = (64 - code.leading_zeros()) as u8;
        for _ in 1..len {
            self.write_bit(false);
        }
        for i in (0..len).rev() {
            self.write_bit((code >> i) & 1 == 1);
        }
    }

    /// Append a signed exp-Golomb code
    pub fn write_se(&mut self, value: i32) {
        let code = if value > 0 {
            2 * value.unsigned_abs() - 1
        } else {
            2 * value.unsigned_abs()
        };
        self.write_ue(code);
    }

    /// Bits written so far
    #[must_use]
    pub fn len_bits(&self) -> usize {
        self.bits
    }

    /// Finish with `rbsp_trailing_bits`: a stop bit then zero padding
    #[must_use]
    pub fn finish_rbsp(mut self) -> Vec<u8> {
        self.write_bit(true);
        self.bytes
    }

    /// Finish with zero padding to the next byte
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

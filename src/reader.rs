//! Bounds-checked reads over byte buffers.
//!
//! Every structure parser goes through this trait so that an offset or
//! length taken from the file is validated against the buffer before the
//! unchecked [`crate::codec`] primitives are used.

use crate::codec;
use crate::error::try_copy;
use crate::{Error, Result};

/// Compute `offset + len`, failing if it overflows or exceeds `size`.
#[inline]
pub fn checked_end(offset: usize, len: usize, size: usize) -> Result<usize> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(end),
        _ => Err(Error::truncated(offset, len, size.saturating_sub(offset))),
    }
}

/// Checked little-endian access to an in-memory byte source.
pub trait Reader {
    /// The underlying bytes.
    fn bytes(&self) -> &[u8];

    /// Total size of the source.
    fn size(&self) -> usize {
        self.bytes().len()
    }

    /// Borrow `len` bytes at `offset`.
    fn slice_at(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = checked_end(offset, len, self.size())?;
        Ok(&self.bytes()[offset..end])
    }

    fn read_u8_at(&self, offset: usize) -> Result<u8> {
        checked_end(offset, 1, self.size())?;
        Ok(codec::read_u8(self.bytes(), offset))
    }

    fn read_u16_at(&self, offset: usize) -> Result<u16> {
        checked_end(offset, 2, self.size())?;
        Ok(codec::read_u16(self.bytes(), offset))
    }

    fn read_u32_at(&self, offset: usize) -> Result<u32> {
        checked_end(offset, 4, self.size())?;
        Ok(codec::read_u32(self.bytes(), offset))
    }

    fn read_u64_at(&self, offset: usize) -> Result<u64> {
        checked_end(offset, 8, self.size())?;
        Ok(codec::read_u64(self.bytes(), offset))
    }

    /// Copy `len` bytes at `offset` into an owned buffer.
    fn read_bytes_at(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        try_copy(self.slice_at(offset, len)?)
    }

    /// Read a NUL-terminated string starting at `offset`.
    ///
    /// Fails if no terminator is found before the end of the source.
    fn read_cstring_at(&self, offset: usize) -> Result<String> {
        let tail = self.slice_at(offset, self.size().saturating_sub(offset))?;
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::truncated(offset, tail.len() + 1, tail.len()))?;
        Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
    }
}

impl Reader for [u8] {
    fn bytes(&self) -> &[u8] {
        self
    }
}

impl Reader for Vec<u8> {
    fn bytes(&self) -> &[u8] {
        self
    }
}

//! Bounds-checked, byte-order aware cursor over an immutable byte slice.
//!
//! Every multi-byte read honours the [`Endian`] the reader was created with,
//! so container data is decoded identically regardless of the host's own
//! byte order. Reads past the end of the slice fail with
//! [`Error::MalformedContainer`] instead of panicking.

use crate::{Error, Result};

/// Byte order of a container or slice, as implied by its magic number.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

#[derive(Clone, Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8], endian: Endian) -> Self {
        Self {
            data,
            pos: 0,
            endian,
        }
    }

    /// Create a reader positioned at `offset`.
    pub fn at(data: &'a [u8], offset: usize, endian: Endian) -> Result<Self> {
        let mut reader = Self::new(data, endian);
        reader.seek(offset)?;
        Ok(reader)
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn seek(&mut self, offset: usize) -> Result<()> {
        if offset > self.data.len() {
            return Err(out_of_bounds(offset, 0, self.data.len()));
        }
        self.pos = offset;
        Ok(())
    }

    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.bytes(count).map(|_| ())
    }

    /// Borrow the next `count` bytes and advance past them.
    pub fn bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(count)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| out_of_bounds(self.pos, count, self.data.len()))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let raw = self.array::<2>()?;
        Ok(match self.endian {
            Endian::Little => u16::from_le_bytes(raw),
            Endian::Big => u16::from_be_bytes(raw),
        })
    }

    pub fn u32(&mut self) -> Result<u32> {
        let raw = self.array::<4>()?;
        Ok(match self.endian {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        })
    }

    pub fn u64(&mut self) -> Result<u64> {
        let raw = self.array::<8>()?;
        Ok(match self.endian {
            Endian::Little => u64::from_le_bytes(raw),
            Endian::Big => u64::from_be_bytes(raw),
        })
    }

    /// Read a fixed 16-byte, NUL-padded name (segment or section name).
    pub fn name16(&mut self) -> Result<String> {
        let raw = self.array::<16>()?;
        Ok(fixed_name(&raw))
    }

    /// Read a NUL-terminated string starting at the cursor.
    pub fn cstr(&mut self) -> Result<String> {
        let rest = &self.data[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::MalformedContainer("unterminated string".to_string()))?;
        let s = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += len + 1;
        Ok(s)
    }
}

/// Convert a NUL-padded fixed-size name into a `String`.
pub fn fixed_name(raw: &[u8]) -> String {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..len]).into_owned()
}

fn out_of_bounds(offset: usize, count: usize, len: usize) -> Error {
    Error::MalformedContainer(format!(
        "read of {count} bytes at offset 0x{offset:x} exceeds buffer of 0x{len:x} bytes"
    ))
}

/// Decode an unsigned LEB128 value starting at `start`.
///
/// Returns the value and the number of bytes consumed.
pub fn read_uleb128(data: &[u8], start: usize) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;
    let mut consumed = 0;

    while start + consumed < data.len() {
        let byte = data[start + consumed];
        consumed += 1;

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok((result, consumed));
        }

        shift += 7;
        if shift >= 64 {
            return Err(Error::MalformedContainer(
                "ULEB128 value too large".to_string(),
            ));
        }
    }

    Err(Error::MalformedContainer(
        "unexpected end of data while reading ULEB128".to_string(),
    ))
}

/// Decode a signed LEB128 value starting at `start`.
pub fn read_sleb128(data: &[u8], start: usize) -> Result<(i64, usize)> {
    let mut result = 0i64;
    let mut shift = 0;
    let mut consumed = 0;

    while start + consumed < data.len() {
        let byte = data[start + consumed];
        consumed += 1;

        result |= ((byte & 0x7F) as i64) << shift;
        shift += 7;

        if (byte & 0x80) == 0 {
            if shift < 64 && (byte & 0x40) != 0 {
                result |= -1i64 << shift;
            }
            return Ok((result, consumed));
        }

        if shift >= 64 {
            return Err(Error::MalformedContainer(
                "SLEB128 value too large".to_string(),
            ));
        }
    }

    Err(Error::MalformedContainer(
        "unexpected end of data while reading SLEB128".to_string(),
    ))
}

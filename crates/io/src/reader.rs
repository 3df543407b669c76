//! Positioned reader over an in-memory byte slice.

use crate::{IoError, IoResult};

/// Reads little-endian primitives and fixed-width fields from a slice.
#[derive(Debug)]
pub struct MemoryReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> MemoryReader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    fn take(&mut self, n: usize, entity: &'static str) -> IoResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(IoError::UnexpectedEof(entity));
        }
        let slice = &self.data[self.position..self.position + n];
        self.position += n;
        Ok(slice)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> IoResult<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    /// Reads a little-endian u16.
    pub fn read_u16(&mut self) -> IoResult<u16> {
        let bytes = self.take(2, "u16")?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Reads a little-endian u32.
    pub fn read_u32(&mut self) -> IoResult<u32> {
        let bytes = self.take(4, "u32")?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a little-endian u64.
    pub fn read_u64(&mut self) -> IoResult<u64> {
        let bytes = self.take(8, "u64")?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a fixed-width byte array.
    pub fn read_array<const N: usize>(&mut self) -> IoResult<[u8; N]> {
        let bytes = self.take(N, "fixed array")?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(bytes);
        Ok(buf)
    }

    /// Reads `n` bytes into an owned vector.
    pub fn read_bytes(&mut self, n: usize) -> IoResult<Vec<u8>> {
        Ok(self.take(n, "bytes")?.to_vec())
    }

    /// Reads everything left in the slice.
    pub fn read_to_end(&mut self) -> Vec<u8> {
        let rest = self.data[self.position..].to_vec();
        self.position = self.data.len();
        rest
    }
}

//! Input byte buffer.
//!
//! An ordered queue of immutable byte chunks as they arrived from the
//! socket. Bytes are only copied when a caller needs a contiguous view
//! that happens to span chunk boundaries.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::{IoError, IoResult};

/// Ordered-chunk input queue for one connection.
///
/// The front of the buffer always begins at a message boundary once a
/// full frame has been removed.
#[derive(Debug, Default)]
pub struct InputBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl InputBuffer {
    /// Creates an empty input buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of unconsumed bytes across all chunks.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether any bytes remain to be consumed.
    pub fn has_more(&self) -> bool {
        self.len != 0
    }

    /// Appends a chunk without copying. Empty chunks are dropped.
    pub fn add_bytes(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Removes and returns exactly `n` bytes from the front, spanning
    /// chunks as needed. Fails if fewer than `n` bytes are buffered.
    pub fn remove_bytes(&mut self, n: usize) -> IoResult<Bytes> {
        if n > self.len {
            return Err(IoError::BufferUnderflow {
                requested: n,
                available: self.len,
            });
        }
        if n == 0 {
            return Ok(Bytes::new());
        }

        self.len -= n;

        // Common case: the front chunk covers the request on its own.
        let front_len = self.chunks[0].len();
        if front_len >= n {
            let taken = self.chunks[0].split_to(n);
            if self.chunks[0].is_empty() {
                self.chunks.pop_front();
            }
            return Ok(taken);
        }

        let mut assembled = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let front = &mut self.chunks[0];
            if front.len() <= remaining {
                remaining -= front.len();
                assembled.extend_from_slice(front);
                self.chunks.pop_front();
            } else {
                assembled.extend_from_slice(&front.split_to(remaining));
                remaining = 0;
            }
        }
        Ok(assembled.freeze())
    }

    /// Returns a contiguous view of the first `n` bytes without
    /// consuming them, coalescing front chunks if the view would
    /// otherwise be fragmented.
    pub fn peek(&mut self, n: usize) -> IoResult<&[u8]> {
        if n > self.len {
            return Err(IoError::BufferUnderflow {
                requested: n,
                available: self.len,
            });
        }
        if n == 0 {
            return Ok(&[]);
        }

        while self.chunks[0].len() < n {
            let second = self.chunks.remove(1).ok_or(IoError::BufferUnderflow {
                requested: n,
                available: self.chunks[0].len(),
            })?;
            let mut merged = BytesMut::with_capacity(self.chunks[0].len() + second.len());
            merged.extend_from_slice(&self.chunks[0]);
            merged.extend_from_slice(&second);
            self.chunks[0] = merged.freeze();
        }
        Ok(&self.chunks[0][..n])
    }
}

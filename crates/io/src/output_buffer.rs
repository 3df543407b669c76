//! Output byte buffer.
//!
//! Mirrors [`InputBuffer`](crate::InputBuffer) for the outbound
//! direction, with two additions: priority insertion at the current read
//! position, and a small-batch coalescing buffer that trades a bounded
//! amount of latency for fewer socket writes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};

use bdn_config::{OUTPUT_FLUSH_HOLD, OUTPUT_FLUSH_THRESHOLD};

/// Ordered-chunk output queue for one connection.
#[derive(Debug)]
pub struct OutputBuffer {
    chunks: VecDeque<Bytes>,
    flushed_len: usize,
    batch: BytesMut,
    batch_since: Option<Instant>,
    flush_threshold: usize,
    flush_hold: Duration,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(OUTPUT_FLUSH_THRESHOLD, OUTPUT_FLUSH_HOLD)
    }
}

impl OutputBuffer {
    /// Creates an output buffer with the given flush policy.
    pub fn new(flush_threshold: usize, flush_hold: Duration) -> Self {
        Self {
            chunks: VecDeque::new(),
            flushed_len: 0,
            batch: BytesMut::new(),
            batch_since: None,
            flush_threshold,
            flush_hold,
        }
    }

    /// Total unconsumed bytes, including any still held in the batch.
    pub fn len(&self) -> usize {
        self.flushed_len + self.batch.len()
    }

    /// Whether no bytes are queued at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any flushed bytes are ready for the socket.
    pub fn has_more(&self) -> bool {
        self.flushed_len != 0
    }

    /// Queues bytes for sending. Short writes are accumulated into the
    /// batch buffer; a write that pushes the batch past the threshold
    /// flushes it into the chunk queue.
    pub fn enqueue(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        if data.len() >= self.flush_threshold {
            // Large writes skip batching entirely.
            self.flush();
            self.flushed_len += data.len();
            self.chunks.push_back(data);
            return;
        }
        if self.batch.is_empty() {
            self.batch_since = Some(Instant::now());
        }
        self.batch.extend_from_slice(&data);
        if self.batch.len() >= self.flush_threshold {
            self.flush();
        }
    }

    /// Inserts bytes at the current read position, ahead of everything
    /// already queued.
    pub fn prepend(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.flushed_len += data.len();
        self.chunks.push_front(data);
    }

    /// Moves the batch into the chunk queue regardless of size or age.
    pub fn flush(&mut self) {
        if self.batch.is_empty() {
            self.batch_since = None;
            return;
        }
        let batch = std::mem::take(&mut self.batch).freeze();
        self.flushed_len += batch.len();
        self.chunks.push_back(batch);
        self.batch_since = None;
    }

    /// Flushes the batch if it has been held longer than the policy
    /// allows. Returns whether a flush happened.
    pub fn maybe_flush(&mut self, now: Instant) -> bool {
        match self.batch_since {
            Some(since) if now.duration_since(since) >= self.flush_hold => {
                self.flush();
                true
            }
            _ => false,
        }
    }

    /// Time until the held batch must be flushed, if one is pending.
    pub fn time_to_flush(&self, now: Instant) -> Option<Duration> {
        self.batch_since
            .map(|since| self.flush_hold.saturating_sub(now.duration_since(since)))
    }

    /// The frontmost flushed chunk, for a socket write attempt.
    pub fn front_chunk(&self) -> Option<&[u8]> {
        self.chunks.front().map(|chunk| &chunk[..])
    }

    /// Pops the frontmost flushed chunk whole, transferring ownership
    /// to the caller.
    pub fn pop_chunk(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.pop_front()?;
        self.flushed_len -= chunk.len();
        Some(chunk)
    }

    /// Consumes `n` bytes from the front after a (possibly partial)
    /// socket write. `n` must not exceed the flushed length.
    pub fn advance(&mut self, mut n: usize) {
        debug_assert!(n <= self.flushed_len, "advance past flushed bytes");
        self.flushed_len -= n.min(self.flushed_len);
        while n > 0 {
            let Some(front) = self.chunks.front_mut() else {
                return;
            };
            if front.len() <= n {
                n -= front.len();
                self.chunks.pop_front();
            } else {
                front.advance(n);
                n = 0;
            }
        }
    }
}

//! Byte buffers used on the read and write paths.
//!
//! [`ScratchBuffer`] is the loop-owned, reused-every-iteration buffer bytes
//! are read into from the kernel (§3 "shared read buffer"); its contents are
//! only valid for the duration of a single readiness dispatch. [`CompositeBuf`]
//! is the zero-copy view over a sequence of byte slices used for outbound
//! payloads: it can be built from any number of [`bytes::Bytes`] chunks,
//! written out with a single vectored write, and have a byte prefix advanced
//! past without copying the remainder.

use std::collections::VecDeque;
use std::io::IoSlice;

use bytes::{Buf, Bytes, BytesMut};

/// Default capacity of a selector loop's shared scratch read buffer.
pub const DEFAULT_SCRATCH_CAPACITY: usize = 64 * 1024;

/// A growable, reusable buffer the selector loop reads socket bytes into.
///
/// Mirrors the grow/mark_read/mark_written/compact discipline of the
/// engine's first buffer implementation, generalized off a single
/// HTTP-request reader to any byte consumer. One instance is shared by a
/// selector loop across all sessions it drives; a filter that needs bytes
/// beyond the current callback must copy them out (see [`crate::chain`]).
#[derive(Debug)]
pub struct ScratchBuffer {
    storage: Vec<u8>,
    read_offset: usize,
    write_offset: usize,
    desired_capacity: usize,
}

impl ScratchBuffer {
    /// Creates a buffer pre-allocated to `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        ScratchBuffer {
            storage: vec![0u8; capacity],
            read_offset: 0,
            write_offset: 0,
            desired_capacity: capacity,
        }
    }

    /// Bytes available to be read out of the buffer.
    pub fn remaining(&self) -> usize {
        self.write_offset - self.read_offset
    }

    /// Bytes of spare capacity available for the next write.
    pub fn remaining_mut(&self) -> usize {
        self.storage.len() - self.write_offset
    }

    /// The unread portion of the buffer.
    ///
    /// Valid only until the next call into this buffer; a filter retaining
    /// bytes beyond the current dispatch must copy this slice.
    pub fn readable(&self) -> &[u8] {
        &self.storage[self.read_offset..self.write_offset]
    }

    /// The writable tail of the buffer, growing it first if it has no spare
    /// capacity left.
    pub fn writable_mut(&mut self) -> &mut [u8] {
        if self.remaining_mut() == 0 {
            self.grow();
        }
        &mut self.storage[self.write_offset..]
    }

    /// Marks `amount` bytes as consumed, compacting the buffer back to its
    /// desired capacity once it has been fully drained.
    pub fn mark_read(&mut self, amount: usize) {
        self.read_offset = self.write_offset.min(self.read_offset + amount);
        self.compact();
    }

    /// Marks `amount` bytes as having just been written into the tail
    /// returned by [`ScratchBuffer::writable_mut`].
    pub fn mark_written(&mut self, amount: usize) {
        self.write_offset = self.storage.len().min(self.write_offset + amount);
    }

    fn grow(&mut self) {
        let new_len = (self.storage.len() * 2).max(self.desired_capacity);
        self.storage.resize(new_len, 0);
    }

    fn compact(&mut self) {
        if self.remaining() == 0 {
            self.read_offset = 0;
            self.write_offset = 0;
            if self.storage.len() > self.desired_capacity {
                self.storage.truncate(self.desired_capacity);
                self.storage.shrink_to_fit();
            }
            return;
        }

        if self.read_offset == 0 {
            return;
        }

        self.storage.copy_within(self.read_offset..self.write_offset, 0);
        self.write_offset -= self.read_offset;
        self.read_offset = 0;
    }
}

impl Default for ScratchBuffer {
    fn default() -> Self {
        ScratchBuffer::with_capacity(DEFAULT_SCRATCH_CAPACITY)
    }
}

/// A zero-copy view over a sequence of [`bytes::Bytes`] chunks.
///
/// Used to build outbound write requests: chunks are appended as they are
/// produced (by the application, or by the TLS helper re-encoding plaintext)
/// and consumed from the front as the socket accepts them, without any
/// chunk's backing memory ever being copied.
#[derive(Debug, Default, Clone)]
pub struct CompositeBuf {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl CompositeBuf {
    /// An empty composite buffer.
    pub fn new() -> Self {
        CompositeBuf::default()
    }

    /// Wraps a single chunk.
    pub fn from_bytes(bytes: Bytes) -> Self {
        let mut buf = CompositeBuf::new();
        buf.push(bytes);
        buf
    }

    /// Appends a chunk to the end of the view.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Total remaining bytes across all chunks.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no bytes remain.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrows up to `IoSlice`s covering every remaining chunk, for a single
    /// vectored write.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.chunks.iter().map(|c| IoSlice::new(c)).collect()
    }

    /// Advances past `amount` bytes from the front, dropping fully-consumed
    /// chunks and trimming a partially-consumed head chunk in place.
    ///
    /// Never copies: trimming a chunk only adjusts its `Bytes` view.
    pub fn advance(&mut self, mut amount: usize) {
        debug_assert!(amount <= self.len);
        while amount > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if amount < front.len() {
                front.advance(amount);
                self.len -= amount;
                amount = 0;
            } else {
                amount -= front.len();
                self.len -= front.len();
                self.chunks.pop_front();
            }
        }
    }

    /// Materializes the remaining bytes into one contiguous buffer.
    ///
    /// Only used where a single contiguous slice is unavoidable (e.g.
    /// handing plaintext to a TLS engine); prefer [`CompositeBuf::io_slices`]
    /// on the plain write path.
    pub fn to_contiguous(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}

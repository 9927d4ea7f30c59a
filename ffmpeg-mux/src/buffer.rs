use bytes::{Buf, BufMut, BytesMut};

use crate::error::{MuxError, Result};

/// Growable byte buffer with stream read/write semantics.
///
/// Bridges frame-oriented producers (encoder output, the mixing loop) with
/// byte-oriented readers. Reads may be short; an empty buffer reads as
/// `Ok(0)`. Writes grow the buffer first and never write past its capacity.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    inner: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: BytesMut::with_capacity(capacity),
        }
    }

    /// Unread bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Makes room for at least `additional` more bytes.
    pub fn grow(&mut self, additional: usize) {
        self.inner.reserve(additional);
    }

    /// Copies up to `dst.len()` bytes out of the buffer.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        if dst.is_empty() {
            return Err(MuxError::EmptyReadBuffer);
        }
        let n = dst.len().min(self.inner.len());
        if n == 0 {
            return Ok(0);
        }
        self.inner.copy_to_slice(&mut dst[..n]);
        Ok(n)
    }

    pub fn write(&mut self, src: &[u8]) -> Result<usize> {
        if src.is_empty() {
            return Err(MuxError::EmptyWriteBuffer);
        }
        let spare = self.inner.capacity() - self.inner.len();
        if spare < src.len() {
            self.grow(src.len() - spare);
        }
        self.inner.put_slice(src);
        Ok(src.len())
    }

    /// Takes up to `max` bytes without copying.
    pub fn split_to(&mut self, max: usize) -> bytes::Bytes {
        let n = max.min(self.inner.len());
        self.inner.split_to(n).freeze()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

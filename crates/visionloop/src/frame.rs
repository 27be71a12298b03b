//! Shared capture frames.
//!
//! One captured frame is shared read-only by every pipeline bound to the
//! camera for that cycle. The pixel buffer is reference counted and goes back
//! to the camera's [`FramePool`] once the last consumer drops its handle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::CaptureError;

/// Pixel layout of a frame buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Gray8,
    #[default]
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// Geometry of a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl FrameInfo {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    /// Bytes per row
    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    pub fn byte_len(&self) -> usize {
        self.stride() * self.height as usize
    }
}

/// Free list of frame buffers for one camera.
///
/// Buffers are recycled through a bounded channel; when the pool is full a
/// returned buffer is simply dropped.
pub struct FramePool {
    free_tx: flume::Sender<Vec<u8>>,
    free_rx: flume::Receiver<Vec<u8>>,
}

impl FramePool {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (free_tx, free_rx) = flume::bounded(capacity.max(1));
        Arc::new(Self { free_tx, free_rx })
    }

    /// Take a recycled buffer, or a fresh one if none is free.
    pub fn acquire(&self) -> Vec<u8> {
        match self.free_rx.try_recv() {
            Ok(mut buf) => {
                buf.clear();
                buf
            }
            Err(_) => Vec::new(),
        }
    }

    /// Return a buffer to the free list.
    pub fn recycle(&self, buf: Vec<u8>) {
        let _ = self.free_tx.try_send(buf);
    }

    /// Number of buffers waiting for reuse
    pub fn available(&self) -> usize {
        self.free_rx.len()
    }
}

struct FrameInner {
    sequence: u64,
    captured_at_ns: u64,
    info: FrameInfo,
    pixels: Vec<u8>,
    pool: Option<Arc<FramePool>>,
}

impl Drop for FrameInner {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.recycle(std::mem::take(&mut self.pixels));
        }
    }
}

/// One captured frame for one cycle.
///
/// Consumers only ever see `&FrameHandle`; additional references are created
/// by the router alone, so a pipeline cannot keep the buffer alive past its
/// deadline.
pub struct FrameHandle {
    inner: Arc<FrameInner>,
}

impl FrameHandle {
    /// Wrap a filled buffer; it returns to `pool` once every consumer is done.
    pub(crate) fn pooled(
        sequence: u64,
        info: FrameInfo,
        pixels: Vec<u8>,
        pool: Arc<FramePool>,
    ) -> Result<Self, CaptureError> {
        if pixels.len() != info.byte_len() {
            pool.recycle(pixels);
            return Err(CaptureError::Device(format!(
                "frame size mismatch: expected {} bytes for {}x{} {:?}",
                info.byte_len(),
                info.width,
                info.height,
                info.format
            )));
        }
        Ok(Self::build(sequence, info, pixels, Some(pool)))
    }

    /// Build a frame that is not backed by a pool.
    pub fn from_pixels(
        sequence: u64,
        info: FrameInfo,
        pixels: Vec<u8>,
    ) -> Result<Self, CaptureError> {
        if pixels.len() != info.byte_len() {
            return Err(CaptureError::Device(format!(
                "frame size mismatch: expected {} bytes, got {}",
                info.byte_len(),
                pixels.len()
            )));
        }
        Ok(Self::build(sequence, info, pixels, None))
    }

    fn build(sequence: u64, info: FrameInfo, pixels: Vec<u8>, pool: Option<Arc<FramePool>>) -> Self {
        Self {
            inner: Arc::new(FrameInner {
                sequence,
                captured_at_ns: now_ns(),
                info,
                pixels,
                pool,
            }),
        }
    }

    /// Another reference to the same buffer.
    pub(crate) fn share(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.inner.sequence
    }

    /// Capture time in nanoseconds since the Unix epoch
    #[inline]
    pub fn captured_at_ns(&self) -> u64 {
        self.inner.captured_at_ns
    }

    #[inline]
    pub fn info(&self) -> FrameInfo {
        self.inner.info
    }

    #[inline]
    pub fn pixels(&self) -> &[u8] {
        &self.inner.pixels
    }

    /// Live references to this frame, the router's included
    pub fn consumers(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// True when both handles refer to the very same buffer
    pub fn same_buffer(&self, other: &FrameHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHandle")
            .field("sequence", &self.inner.sequence)
            .field("info", &self.inner.info)
            .field("consumers", &self.consumers())
            .finish()
    }
}

pub(crate) fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Raw pixel frame with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Time the frame entered the process, for latency tracking
    pub timestamp: Instant,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("bytes", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row, at least `width * channels`
    pub stride: usize,
    pub format: PixelFormat,
    pub source_timestamp: Option<Duration>, // Presentation time if the source has one
}

/// Pixel formats we support. All are 8 bits per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    Rgba32,
}

impl PixelFormat {
    pub fn channels(self) -> u32 {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgba32 => 4,
        }
    }

    pub fn from_channels(channels: u32) -> Option<Self> {
        match channels {
            1 => Some(PixelFormat::Gray8),
            3 => Some(PixelFormat::Rgb24),
            4 => Some(PixelFormat::Rgba32),
            _ => None,
        }
    }
}

impl Frame {
    /// Wrap tightly packed pixels. Fails if `data` is shorter than `width * height * channels`.
    pub fn packed(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: impl Into<Bytes>,
    ) -> Result<Self> {
        let stride = width as usize * format.channels() as usize;
        Self::strided(width, height, stride, format, data)
    }

    /// Wrap pixels whose rows are `stride` bytes apart.
    pub fn strided(
        width: u32,
        height: u32,
        stride: usize,
        format: PixelFormat,
        data: impl Into<Bytes>,
    ) -> Result<Self> {
        let data = data.into();
        let row = width as usize * format.channels() as usize;
        if width == 0 || height == 0 || stride < row {
            return Err(TransportError::InvalidGeometry {
                width,
                height,
                channels: format.channels(),
            });
        }

        let required = stride * (height as usize - 1) + row;
        if data.len() < required {
            return Err(TransportError::BufferSize {
                expected: required,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            meta: Arc::new(FrameMetadata {
                sequence: 0,
                width,
                height,
                stride,
                format,
                source_timestamp: None,
            }),
            timestamp: Instant::now(),
        })
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        Arc::make_mut(&mut self.meta).sequence = sequence;
        self
    }

    pub fn with_source_timestamp(mut self, ts: Duration) -> Self {
        Arc::make_mut(&mut self.meta).source_timestamp = Some(ts);
        self
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn channels(&self) -> u32 {
        self.meta.format.channels()
    }

    pub fn is_packed(&self) -> bool {
        self.meta.stride == self.meta.width as usize * self.channels() as usize
    }

    /// Row `y` without the stride padding
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.meta.stride;
        let len = self.meta.width as usize * self.channels() as usize;
        &self.data[start..start + len]
    }
}

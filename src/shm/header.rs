//! In-segment frame header.
//!
//! Every field is an atomic so both processes can touch the mapping without a
//! data race. `write_seq` is odd while the writer is copying pixels; readers use
//! it to reject a copy that overlapped a write. `is_new_frame` is published with
//! Release after the pixels and observed with Acquire before them.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::error::{Result, TransportError};

#[repr(C)]
pub struct SharedFrameHeader {
    width: AtomicU32,
    height: AtomicU32,
    channels: AtomicU32,
    frame_index: AtomicU32,
    total_frames: AtomicU32,
    _reserved0: AtomicU32,
    fps_bits: AtomicU64,
    timestamp_ms: AtomicU64,
    write_seq: AtomicU64,
    is_new_frame: AtomicBool,
    is_end_of_video: AtomicBool,
    _reserved1: [u8; 6],
}

pub const HEADER_SIZE: usize = std::mem::size_of::<SharedFrameHeader>();

const _: () = assert!(HEADER_SIZE == 56);
const _: () = assert!(std::mem::align_of::<SharedFrameHeader>() == 8);

/// Plain copy of the header fields
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HeaderSnapshot {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub frame_index: u32,
    pub total_frames: u32,
    pub fps: f64,
    pub timestamp_ms: u64,
    pub is_new_frame: bool,
    pub is_end_of_video: bool,
}

impl HeaderSnapshot {
    pub fn frame_len(&self) -> usize {
        frame_len(self.width, self.height, self.channels).unwrap_or(0)
    }
}

/// Per-frame values the writer records alongside the pixels
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameInfo {
    pub frame_index: u32,
    pub total_frames: u32,
    pub fps: f64,
    pub timestamp_ms: u64,
}

/// Pixel bytes for the given geometry, or an error on zero or overflowing sizes.
pub fn frame_len(width: u32, height: u32, channels: u32) -> Result<usize> {
    let invalid = TransportError::InvalidGeometry {
        width,
        height,
        channels,
    };
    if width == 0 || height == 0 || channels == 0 {
        return Err(invalid);
    }
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(channels as usize))
        .ok_or(invalid)
}

/// Header plus pixel region.
pub fn segment_len(width: u32, height: u32, channels: u32) -> Result<usize> {
    frame_len(width, height, channels).map(|n| n + HEADER_SIZE)
}

impl SharedFrameHeader {
    /// Reset every field for a freshly sized segment.
    pub(crate) fn initialize(&self, width: u32, height: u32, channels: u32) {
        self.frame_index.store(0, Ordering::Relaxed);
        self.total_frames.store(0, Ordering::Relaxed);
        self.fps_bits.store(0f64.to_bits(), Ordering::Relaxed);
        self.timestamp_ms.store(0, Ordering::Relaxed);
        self.write_seq.store(0, Ordering::Relaxed);
        self.is_new_frame.store(false, Ordering::Relaxed);
        self.is_end_of_video.store(false, Ordering::Relaxed);
        self.width.store(width, Ordering::Relaxed);
        self.height.store(height, Ordering::Relaxed);
        self.channels.store(channels, Ordering::Release);
    }

    pub fn dimensions(&self) -> (u32, u32, u32) {
        (
            self.width.load(Ordering::Acquire),
            self.height.load(Ordering::Acquire),
            self.channels.load(Ordering::Acquire),
        )
    }

    pub fn is_new_frame(&self) -> bool {
        self.is_new_frame.load(Ordering::Acquire)
    }

    pub fn is_end_of_video(&self) -> bool {
        self.is_end_of_video.load(Ordering::Acquire)
    }

    /// Clear the new-frame flag for the frame written at `seq`. If a write
    /// started since then the flag stays raised for it.
    pub(crate) fn consume_frame(&self, seq: u64) {
        self.is_new_frame.swap(false, Ordering::AcqRel);
        if self.write_seq.load(Ordering::Acquire) != seq {
            self.is_new_frame.store(true, Ordering::Release);
        }
    }

    pub(crate) fn publish_new_frame(&self) {
        self.is_new_frame.store(true, Ordering::Release);
    }

    pub(crate) fn mark_end_of_video(&self) {
        self.is_end_of_video.store(true, Ordering::Release);
    }

    /// Enter the write section. Readers that start a copy now will retry.
    pub(crate) fn begin_write(&self) -> u64 {
        let seq = self.write_seq.load(Ordering::Relaxed);
        self.write_seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        std::sync::atomic::fence(Ordering::Release);
        seq
    }

    pub(crate) fn record(&self, info: &FrameInfo) {
        self.frame_index.store(info.frame_index, Ordering::Relaxed);
        self.total_frames.store(info.total_frames, Ordering::Relaxed);
        self.fps_bits.store(info.fps.to_bits(), Ordering::Relaxed);
        self.timestamp_ms.store(info.timestamp_ms, Ordering::Relaxed);
    }

    pub(crate) fn end_write(&self, started: u64) {
        self.write_seq
            .store(started.wrapping_add(2), Ordering::Release);
    }

    /// Sequence value to start a read section with, `None` while a write is in flight.
    pub(crate) fn read_begin(&self) -> Option<u64> {
        let seq = self.write_seq.load(Ordering::Acquire);
        (seq & 1 == 0).then_some(seq)
    }

    /// Whether nothing was written since `read_begin` returned `seq`.
    pub(crate) fn read_validate(&self, seq: u64) -> bool {
        std::sync::atomic::fence(Ordering::Acquire);
        self.write_seq.load(Ordering::Relaxed) == seq
    }

    pub fn snapshot(&self) -> HeaderSnapshot {
        let (width, height, channels) = self.dimensions();
        HeaderSnapshot {
            width,
            height,
            channels,
            frame_index: self.frame_index.load(Ordering::Relaxed),
            total_frames: self.total_frames.load(Ordering::Relaxed),
            fps: f64::from_bits(self.fps_bits.load(Ordering::Relaxed)),
            timestamp_ms: self.timestamp_ms.load(Ordering::Relaxed),
            is_new_frame: self.is_new_frame(),
            is_end_of_video: self.is_end_of_video(),
        }
    }
}

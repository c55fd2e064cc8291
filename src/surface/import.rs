use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::fd::{AsRawFd, OwnedFd};

use memmap2::{Mmap, MmapOptions};
use nix::errno::Errno;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::media::{Frame, PixelFormat};
use crate::shm::header::frame_len;
use crate::surface::SURFACE_CHANNELS;

const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_START: u64 = 0;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

#[repr(C)]
pub struct DmaBufSync {
    flags: u64,
}

// DMA_BUF_IOCTL_SYNC from linux/dma-buf.h
nix::ioctl_write_ptr!(dma_buf_ioctl_sync, b'b', 0, DmaBufSync);

/// A received surface descriptor mapped read-only.
///
/// The producer keeps writing the memory in place, so every read sees the
/// latest upload without another descriptor exchange.
pub struct ImportedSurface {
    width: u32,
    height: u32,
    map: Mmap,
    file: File,
    dma_buf: bool,
}

impl ImportedSurface {
    /// Map `fd` as a `width` x `height` RGBA surface. Takes ownership of `fd`.
    pub fn import(fd: OwnedFd, width: u32, height: u32) -> Result<Self> {
        let len = frame_len(width, height, SURFACE_CHANNELS)?;
        let mut file = File::from(fd);

        // dma-buf descriptors report their size through lseek, not fstat
        let size = file
            .seek(SeekFrom::End(0))
            .map_err(|e| TransportError::io("Failed to size imported surface", e))?
            as usize;
        if size < len {
            return Err(TransportError::SegmentTooSmall {
                required: len,
                actual: size,
            });
        }

        // SAFETY: the mapping is read-only; concurrent producer writes can only
        // change pixel values, never the mapping's extent.
        let map = unsafe { MmapOptions::new().len(len).map(&file) }
            .map_err(|e| TransportError::io("Failed to map imported surface", e))?;

        let dma_buf = probe_dma_buf(&file);
        info!(
            "Imported {}x{} surface ({} bytes, {})",
            width,
            height,
            size,
            if dma_buf { "dma-buf" } else { "plain memory" }
        );

        Ok(Self {
            width,
            height,
            map,
            file,
            dma_buf,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_dma_buf(&self) -> bool {
        self.dma_buf
    }

    /// Copy the current RGBA contents into `out`.
    pub fn read_into(&self, out: &mut Vec<u8>) -> Result<()> {
        self.sync(DMA_BUF_SYNC_START | DMA_BUF_SYNC_READ)?;
        out.clear();
        out.extend_from_slice(&self.map);
        self.sync(DMA_BUF_SYNC_END | DMA_BUF_SYNC_READ)?;
        Ok(())
    }

    /// Current contents as a frame.
    pub fn snapshot(&self) -> Result<Frame> {
        let mut pixels = Vec::with_capacity(self.map.len());
        self.read_into(&mut pixels)?;
        Frame::packed(self.width, self.height, PixelFormat::Rgba32, pixels)
    }

    fn sync(&self, flags: u64) -> Result<()> {
        if !self.dma_buf {
            return Ok(());
        }
        let arg = DmaBufSync { flags };
        loop {
            // SAFETY: `arg` is a valid dma_buf_sync for the duration of the call.
            match unsafe { dma_buf_ioctl_sync(self.file.as_raw_fd(), &arg) } {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                Err(e) => return Err(TransportError::os("DMA_BUF_IOCTL_SYNC failed", e)),
            }
        }
    }
}

/// Whether `file` answers the dma-buf sync ioctl. Anything else is read unsynchronised.
fn probe_dma_buf(file: &File) -> bool {
    let start = DmaBufSync {
        flags: DMA_BUF_SYNC_START | DMA_BUF_SYNC_READ,
    };
    // SAFETY: `start` is a valid dma_buf_sync for the duration of the call.
    match unsafe { dma_buf_ioctl_sync(file.as_raw_fd(), &start) } {
        Ok(_) => {
            let end = DmaBufSync {
                flags: DMA_BUF_SYNC_END | DMA_BUF_SYNC_READ,
            };
            // SAFETY: as above.
            if let Err(e) = unsafe { dma_buf_ioctl_sync(file.as_raw_fd(), &end) } {
                warn!("dma-buf sync end failed during probe: {}", e);
            }
            true
        }
        Err(e) => {
            debug!("Descriptor is not a dma-buf ({})", e);
            false
        }
    }
}

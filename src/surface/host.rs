use std::fs::File;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use memmap2::{MmapOptions, MmapRaw};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::media::{convert, Frame};
use crate::shm::header::frame_len;
use crate::surface::{ExportedSurface, SURFACE_CHANNELS};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// RGBA pixels in anonymous shared memory.
///
/// The backing object is unlinked right after creation, so it is reachable only
/// through descriptors: ours and the ones handed out by [`export_fd`].
///
/// [`export_fd`]: ExportedSurface::export_fd
pub struct HostSurface {
    width: u32,
    height: u32,
    len: usize,
    map: MmapRaw,
    file: File,
    upload_lock: Mutex<()>,
}

impl HostSurface {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let len = frame_len(width, height, SURFACE_CHANNELS)?;
        let name = format!(
            "/vst-surface-{}-{}",
            std::process::id(),
            NEXT_ID.fetch_add(1, Ordering::Relaxed)
        );

        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| TransportError::os("Failed to allocate surface memory", e))?;
        shm_unlink(name.as_str())
            .map_err(|e| TransportError::os("Failed to detach surface memory", e))?;

        ftruncate(&fd, len as nix::libc::off_t)
            .map_err(|e| TransportError::os("Failed to size surface memory", e))?;
        let file = File::from(fd);
        let map = MmapOptions::new()
            .len(len)
            .map_raw(&file)
            .map_err(|e| TransportError::io("Failed to map surface memory", e))?;

        info!("Allocated {}x{} RGBA surface ({} bytes)", width, height, len);

        Ok(Self {
            width,
            height,
            len,
            map,
            file,
            upload_lock: Mutex::new(()),
        })
    }

    /// Allocate a surface sized to `frame` and fill it.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let surface = Self::new(frame.width(), frame.height())?;
        surface.upload(frame)?;
        Ok(surface)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ExportedSurface for HostSurface {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn export_fd(&self) -> Result<OwnedFd> {
        self.file
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| TransportError::io("Failed to duplicate surface descriptor", e))
    }

    fn upload(&self, frame: &Frame) -> Result<()> {
        if (frame.width(), frame.height()) != (self.width, self.height) {
            return Err(TransportError::DimensionMismatch {
                expected: (self.width, self.height),
                actual: (frame.width(), frame.height()),
            });
        }

        let _guard = self.upload_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // SAFETY: the mapping is `len` bytes and lives as long as `self`; uploads
        // in this process are serialised by the lock.
        let dst = unsafe { std::slice::from_raw_parts_mut(self.map.as_mut_ptr(), self.len) };
        convert::pack_into(frame, dst, SURFACE_CHANNELS)?;
        debug!("Uploaded frame {} to surface", frame.meta.sequence);
        Ok(())
    }
}

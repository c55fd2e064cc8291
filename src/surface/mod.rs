//! Exportable pixel surfaces.
//!
//! The DMA path hands consumers a descriptor to memory the producer keeps
//! updating in place. Rendering stacks that allocate real GPU buffers plug in
//! through [`ExportedSurface`]; [`HostSurface`] is the CPU-side implementation.

pub mod host;
pub mod import;

use std::os::fd::OwnedFd;

use crate::error::Result;
use crate::media::Frame;

pub use host::HostSurface;
pub use import::ImportedSurface;

/// Memory a producer can export as a descriptor and keep updating
pub trait ExportedSurface: Send + Sync {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// A new descriptor for the surface memory. Each call returns an
    /// independent handle; closing it does not affect the surface.
    fn export_fd(&self) -> Result<OwnedFd>;

    /// Replace the surface contents with `frame`, converted to RGBA.
    fn upload(&self, frame: &Frame) -> Result<()>;
}

/// Surfaces are always RGBA
pub const SURFACE_CHANNELS: u32 = 4;

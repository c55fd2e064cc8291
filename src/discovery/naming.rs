//! Resource names that carry their pixel dimensions.
//!
//! `<prefix>-<W>x<H>` for shared-memory segments, `<prefix>-<W>x<H>.sock` for
//! descriptor-passing sockets. The prefix selects transport mode and content type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

pub const SOCKET_SUFFIX: &str = ".sock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// POSIX shared memory, pixels copied in and out
    #[value(name = "shm")]
    #[serde(rename = "shm")]
    SharedMemory,
    /// Native memory descriptor handed over a Unix socket
    #[value(name = "dma")]
    #[serde(rename = "dma")]
    DmaBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Image,
    Video,
}

/// Mode and content together; every combination is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub mode: TransportMode,
    pub content: ContentType,
}

impl ResourceKind {
    pub const SHM_IMAGE: Self = Self::new(TransportMode::SharedMemory, ContentType::Image);
    pub const SHM_VIDEO: Self = Self::new(TransportMode::SharedMemory, ContentType::Video);
    pub const DMA_IMAGE: Self = Self::new(TransportMode::DmaBuf, ContentType::Image);
    pub const DMA_VIDEO: Self = Self::new(TransportMode::DmaBuf, ContentType::Video);

    /// Discovery scan order; the first kind with a live resource wins.
    pub const PRIORITY: [Self; 4] = [
        Self::SHM_VIDEO,
        Self::SHM_IMAGE,
        Self::DMA_IMAGE,
        Self::DMA_VIDEO,
    ];

    pub const fn new(mode: TransportMode, content: ContentType) -> Self {
        Self { mode, content }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportMode::SharedMemory => "shm",
            TransportMode::DmaBuf => "dma",
        })
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "shm" => Ok(TransportMode::SharedMemory),
            "dma" => Ok(TransportMode::DmaBuf),
            other => Err(format!("unknown mode {other:?}, expected shm or dma")),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContentType::Image => "image",
            ContentType::Video => "video",
        })
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.mode, self.content)
    }
}

/// Name prefixes for each resource kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Naming {
    pub image_shm_prefix: String,
    pub video_shm_prefix: String,
    pub image_socket_prefix: String,
    pub video_socket_prefix: String,
}

impl Default for Naming {
    fn default() -> Self {
        Self {
            image_shm_prefix: "vst_shared_texture".into(),
            video_shm_prefix: "vst_shared_video".into(),
            image_socket_prefix: "vulkan_shared_image".into(),
            video_socket_prefix: "vulkan_shared_video".into(),
        }
    }
}

impl Naming {
    pub fn prefix(&self, kind: ResourceKind) -> &str {
        match (kind.mode, kind.content) {
            (TransportMode::SharedMemory, ContentType::Image) => &self.image_shm_prefix,
            (TransportMode::SharedMemory, ContentType::Video) => &self.video_shm_prefix,
            (TransportMode::DmaBuf, ContentType::Image) => &self.image_socket_prefix,
            (TransportMode::DmaBuf, ContentType::Video) => &self.video_socket_prefix,
        }
    }

    /// File name for a resource of `kind` with the given dimensions.
    pub fn encode(&self, kind: ResourceKind, width: u32, height: u32) -> String {
        let suffix = match kind.mode {
            TransportMode::SharedMemory => "",
            TransportMode::DmaBuf => SOCKET_SUFFIX,
        };
        format!("{}-{}x{}{}", self.prefix(kind), width, height, suffix)
    }

    /// Match `file_name` against the pattern for `kind`.
    ///
    /// `None` when the name belongs to another pattern. `Some(Err(_))` when the
    /// prefix matches but the dimensions are malformed.
    pub fn decode(&self, kind: ResourceKind, file_name: &str) -> Option<Result<(u32, u32)>> {
        let rest = file_name
            .strip_prefix(self.prefix(kind))?
            .strip_prefix('-')?;
        let dims = match kind.mode {
            TransportMode::SharedMemory if rest.ends_with(SOCKET_SUFFIX) => return None,
            TransportMode::SharedMemory => rest,
            TransportMode::DmaBuf => rest.strip_suffix(SOCKET_SUFFIX)?,
        };
        Some(parse_size(dims).map_err(|reason| TransportError::InvalidName {
            name: file_name.to_string(),
            reason,
        }))
    }
}

/// Decode the trailing `<W>x<H>` from any resource name, with or without the
/// socket suffix: everything after the last `-` must be `<digits>x<digits>`.
pub fn parse_dimensions(name: &str) -> Result<(u32, u32)> {
    let invalid = |reason| TransportError::InvalidName {
        name: name.to_string(),
        reason,
    };
    let stem = name.strip_suffix(SOCKET_SUFFIX).unwrap_or(name);
    let (_, dims) = stem.rsplit_once('-').ok_or_else(|| invalid("no '-' separator"))?;
    parse_size(dims).map_err(invalid)
}

fn parse_size(dims: &str) -> std::result::Result<(u32, u32), &'static str> {
    let (w, h) = dims.split_once('x').ok_or("missing 'x' between dimensions")?;
    let width = parse_component(w)?;
    let height = parse_component(h)?;
    Ok((width, height))
}

fn parse_component(digits: &str) -> std::result::Result<u32, &'static str> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err("dimension is not a decimal number");
    }
    match digits.parse::<u32>() {
        Ok(0) => Err("dimension is zero"),
        Ok(v) => Ok(v),
        Err(_) => Err("dimension out of range"),
    }
}

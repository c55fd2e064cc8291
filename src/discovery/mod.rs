//! Locate an active producer by scanning the shared-memory and socket directories.
//!
//! There is no registry: a producer publishes a name that encodes its transport,
//! content type and dimensions (see [`naming`]), and the consumer finds it with a
//! read-only directory scan.

pub mod naming;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
pub use naming::{parse_dimensions, ContentType, Naming, ResourceKind, TransportMode};

/// Directories scanned for published resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub shm_dir: PathBuf,
    pub socket_dir: PathBuf,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            shm_dir: PathBuf::from("/dev/shm"),
            socket_dir: PathBuf::from("/tmp"),
        }
    }
}

/// A published resource found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedResource {
    pub path: PathBuf,
    pub kind: ResourceKind,
    pub width: u32,
    pub height: u32,
}

impl SharedResource {
    pub fn mode(&self) -> TransportMode {
        self.kind.mode
    }

    pub fn content(&self) -> ContentType {
        self.kind.content
    }

    /// The bare file name, which is also the shared-memory segment name
    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct Discovery {
    naming: Naming,
    dirs: DiscoveryConfig,
}

impl Discovery {
    pub fn new(naming: Naming, dirs: DiscoveryConfig) -> Self {
        Self { naming, dirs }
    }

    pub fn naming(&self) -> &Naming {
        &self.naming
    }

    pub fn dir_for(&self, mode: TransportMode) -> &Path {
        match mode {
            TransportMode::SharedMemory => &self.dirs.shm_dir,
            TransportMode::DmaBuf => &self.dirs.socket_dir,
        }
    }

    /// Path a producer of `kind` publishes at.
    pub fn path_for(&self, kind: ResourceKind, width: u32, height: u32) -> PathBuf {
        self.dir_for(kind.mode)
            .join(self.naming.encode(kind, width, height))
    }

    /// The highest-priority live resource, or `None` when nothing is published.
    pub fn find(&self) -> Result<Option<SharedResource>> {
        for kind in ResourceKind::PRIORITY {
            if let Some(found) = self.find_kind(kind)? {
                info!(
                    "Found {} resource {} ({}x{})",
                    kind,
                    found.path.display(),
                    found.width,
                    found.height
                );
                return Ok(Some(found));
            }
        }
        debug!("No shared resource published");
        Ok(None)
    }

    /// Like [`find`](Self::find) but a missing resource is an error.
    pub fn require(&self) -> Result<SharedResource> {
        self.find()?.ok_or(TransportError::NotFound)
    }

    /// Every well-formed resource, in priority order.
    pub fn scan(&self) -> Result<Vec<SharedResource>> {
        let mut all = Vec::new();
        for kind in ResourceKind::PRIORITY {
            let mut found: Vec<_> = self.candidates(kind)?.into_iter().map(|(r, _)| r).collect();
            found.sort_by(|a, b| a.path.cmp(&b.path));
            all.extend(found);
        }
        Ok(all)
    }

    /// Most recently modified resource of `kind`; ties go to the smaller name.
    pub fn find_kind(&self, kind: ResourceKind) -> Result<Option<SharedResource>> {
        let newest = self
            .candidates(kind)?
            .into_iter()
            .max_by(|(a, at), (b, bt)| at.cmp(bt).then_with(|| b.path.cmp(&a.path)))
            .map(|(resource, _)| resource);
        Ok(newest)
    }

    fn candidates(&self, kind: ResourceKind) -> Result<Vec<(SharedResource, SystemTime)>> {
        let dir = self.dir_for(kind.mode);
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} does not exist", dir.display());
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(TransportError::io(
                    format!("Failed to scan {}", dir.display()),
                    e,
                ))
            }
        };

        let mut found = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            match self.naming.decode(kind, name) {
                None => {}
                Some(Ok((width, height))) => {
                    let modified = entry
                        .metadata()
                        .and_then(|m| m.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    found.push((
                        SharedResource {
                            path: entry.path(),
                            kind,
                            width,
                            height,
                        },
                        modified,
                    ));
                }
                Some(Err(e)) => warn!("Skipping {}: {}", entry.path().display(), e),
            }
        }
        Ok(found)
    }
}

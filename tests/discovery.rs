use std::fs;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use vst_share::discovery::{
    ContentType, Discovery, DiscoveryConfig, Naming, ResourceKind, TransportMode,
};
use vst_share::TransportError;

struct Dirs {
    shm: TempDir,
    sockets: TempDir,
}

impl Dirs {
    fn new() -> Self {
        Self {
            shm: tempfile::tempdir().unwrap(),
            sockets: tempfile::tempdir().unwrap(),
        }
    }

    fn discovery(&self) -> Discovery {
        Discovery::new(
            Naming::default(),
            DiscoveryConfig {
                shm_dir: self.shm.path().to_path_buf(),
                socket_dir: self.sockets.path().to_path_buf(),
            },
        )
    }
}

fn touch(dir: &Path, name: &str) {
    fs::write(dir.join(name), b"").unwrap();
}

#[test]
fn empty_directories_find_nothing() {
    let dirs = Dirs::new();
    assert!(dirs.discovery().find().unwrap().is_none());
    assert!(matches!(
        dirs.discovery().require(),
        Err(TransportError::NotFound)
    ));
}

#[test]
fn missing_directories_find_nothing() {
    let discovery = Discovery::new(
        Naming::default(),
        DiscoveryConfig {
            shm_dir: "/nonexistent/vst/shm".into(),
            socket_dir: "/nonexistent/vst/sock".into(),
        },
    );
    assert!(discovery.find().unwrap().is_none());
}

#[test]
fn shared_memory_video_beats_image() {
    let dirs = Dirs::new();
    touch(dirs.shm.path(), "vst_shared_texture-640x480");
    touch(dirs.shm.path(), "vst_shared_video-1280x720");

    let found = dirs.discovery().find().unwrap().unwrap();
    assert_eq!(found.kind, ResourceKind::SHM_VIDEO);
    assert_eq!((found.width, found.height), (1280, 720));
    assert_eq!(found.name(), "vst_shared_video-1280x720");
}

#[test]
fn priority_order_is_fixed() {
    let dirs = Dirs::new();
    touch(dirs.sockets.path(), "vulkan_shared_video-10x10.sock");
    assert_eq!(
        dirs.discovery().find().unwrap().unwrap().kind,
        ResourceKind::DMA_VIDEO
    );

    touch(dirs.sockets.path(), "vulkan_shared_image-20x20.sock");
    assert_eq!(
        dirs.discovery().find().unwrap().unwrap().kind,
        ResourceKind::DMA_IMAGE
    );

    touch(dirs.shm.path(), "vst_shared_texture-30x30");
    assert_eq!(
        dirs.discovery().find().unwrap().unwrap().kind,
        ResourceKind::SHM_IMAGE
    );

    touch(dirs.shm.path(), "vst_shared_video-40x40");
    let found = dirs.discovery().find().unwrap().unwrap();
    assert_eq!(found.mode(), TransportMode::SharedMemory);
    assert_eq!(found.content(), ContentType::Video);

    let all: Vec<_> = dirs
        .discovery()
        .scan()
        .unwrap()
        .into_iter()
        .map(|r| r.kind)
        .collect();
    assert_eq!(all, ResourceKind::PRIORITY.to_vec());
}

#[test]
fn malformed_names_are_skipped() {
    let dirs = Dirs::new();
    touch(dirs.shm.path(), "vst_shared_video-axb");
    touch(dirs.shm.path(), "vst_shared_video-0x10");
    touch(dirs.shm.path(), "vst_shared_video");
    touch(dirs.shm.path(), "unrelated-100x100");
    touch(dirs.sockets.path(), "vulkan_shared_image-8x8");

    assert!(dirs.discovery().find().unwrap().is_none());

    touch(dirs.sockets.path(), "vulkan_shared_image-8x8.sock");
    let found = dirs.discovery().find().unwrap().unwrap();
    assert_eq!(found.kind, ResourceKind::DMA_IMAGE);
    assert_eq!(found.path, dirs.sockets.path().join("vulkan_shared_image-8x8.sock"));
}

#[test]
fn newest_resource_of_a_kind_wins() {
    let dirs = Dirs::new();
    touch(dirs.shm.path(), "vst_shared_video-100x100");
    std::thread::sleep(Duration::from_millis(20));
    touch(dirs.shm.path(), "vst_shared_video-200x100");

    let found = dirs.discovery().find().unwrap().unwrap();
    assert_eq!((found.width, found.height), (200, 100));
}

#[test]
fn path_for_matches_what_discovery_finds() {
    let dirs = Dirs::new();
    let discovery = dirs.discovery();
    let path = discovery.path_for(ResourceKind::DMA_VIDEO, 1920, 1080);
    assert_eq!(
        path,
        dirs.sockets.path().join("vulkan_shared_video-1920x1080.sock")
    );

    fs::write(&path, b"").unwrap();
    let found = discovery.find().unwrap().unwrap();
    assert_eq!(found.path, path);
    assert_eq!((found.width, found.height), (1920, 1080));
}

#[test]
fn custom_prefixes_are_honoured() {
    let dirs = Dirs::new();
    let naming = Naming {
        video_shm_prefix: "cam0".into(),
        ..Naming::default()
    };
    let discovery = Discovery::new(
        naming,
        DiscoveryConfig {
            shm_dir: dirs.shm.path().to_path_buf(),
            socket_dir: dirs.sockets.path().to_path_buf(),
        },
    );
    touch(dirs.shm.path(), "vst_shared_video-2x2");
    assert!(discovery.find().unwrap().is_none());

    touch(dirs.shm.path(), "cam0-2x2");
    assert_eq!(discovery.find().unwrap().unwrap().kind, ResourceKind::SHM_VIDEO);
}

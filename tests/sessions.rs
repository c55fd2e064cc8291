use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serial_test::serial;
use tempfile::TempDir;
use vst_share::discovery::{ContentType, ResourceKind, SharedResource};
use vst_share::display::{FrameSink, StatsSink};
use vst_share::media::{Frame, PixelFormat};
use vst_share::session::{
    run_consumer, run_image, ConsumerChannel, ConsumerSession, ProducerSession, Received,
    StopReason,
};
use vst_share::shm::FrameInfo;
use vst_share::surface::{ExportedSurface, HostSurface};
use vst_share::utils::CancelToken;
use vst_share::Config;

static NEXT: AtomicU32 = AtomicU32::new(0);

/// Sockets go to a scratch directory; shared memory uses the real mount, with
/// per-test prefixes so leftovers from other runs never outrank the resource
/// under test.
fn test_config(sockets: &TempDir) -> Config {
    let id = format!("{}_{}", std::process::id(), NEXT.fetch_add(1, Ordering::Relaxed));
    let mut config = Config::default();
    config.discovery.socket_dir = sockets.path().to_path_buf();
    config.naming.image_shm_prefix = format!("vst_test_image_{id}");
    config.naming.video_shm_prefix = format!("vst_test_video_{id}");
    config.shm.poll_interval_ms = 2;
    config.shm.max_poll_attempts = 500;
    config.ipc.accept_poll_interval_ms = 5;
    config.ipc.connect_backoff_initial_ms = 5;
    config.ipc.connect_backoff_max_ms = 20;
    config.video.default_fps = 200.0;
    config
}

fn info(index: u32) -> FrameInfo {
    FrameInfo {
        frame_index: index,
        total_frames: 0,
        fps: 200.0,
        timestamp_ms: index as u64 * 5,
    }
}

fn wait_for(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !path.exists() {
        assert!(Instant::now() < deadline, "{} never appeared", path.display());
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
#[serial]
fn shared_memory_image_scenario() {
    let sockets = tempfile::tempdir().unwrap();
    let mut config = test_config(&sockets);
    config.naming.image_shm_prefix = "vst_shared_texture".into();

    let pattern: Vec<u8> = (0u8..12).flat_map(|i| [i; 4]).collect();
    let frame = Frame::packed(4, 3, PixelFormat::Rgba32, pattern.clone()).unwrap();

    let mut producer = ProducerSession::publish_shm(&config, ContentType::Image, 4, 3).unwrap();
    assert_eq!(producer.name(), "vst_shared_texture-4x3");
    producer.push_frame(&frame, info(0)).unwrap();

    let resource = ConsumerSession::discover(&config).unwrap();
    assert_eq!(resource.kind, ResourceKind::SHM_IMAGE);
    assert_eq!((resource.width, resource.height), (4, 3));

    let mut consumer = ConsumerSession::join(&config, resource, &CancelToken::new()).unwrap();
    let received = consumer.read_image().unwrap();
    assert_eq!(&received.data[..], &pattern[..]);

    let ConsumerChannel::SharedMemory(channel) = consumer.channel() else {
        panic!("expected a shared-memory channel");
    };
    let header = channel.frame_metadata();
    assert_eq!((header.width, header.height), (4, 3));

    consumer.close();
    producer.shutdown().unwrap();
    producer.shutdown().unwrap();
    assert!(!Path::new("/dev/shm/vst_shared_texture-4x3").exists());
}

#[test]
#[serial]
fn shared_memory_video_runs_to_end_of_stream() {
    let sockets = tempfile::tempdir().unwrap();
    let config = test_config(&sockets);

    let producer = ProducerSession::publish_shm(&config, ContentType::Video, 8, 8).unwrap();
    let resource = ConsumerSession::discover(&config).unwrap();
    assert_eq!(resource.kind, ResourceKind::SHM_VIDEO);
    let mut consumer = ConsumerSession::join(&config, resource, &CancelToken::new()).unwrap();

    let pusher = thread::spawn(move || {
        for index in 0..10u32 {
            let frame =
                Frame::packed(8, 8, PixelFormat::Rgba32, vec![index as u8; 256]).unwrap();
            producer.push_frame(&frame, info(index)).unwrap();
            thread::sleep(Duration::from_millis(10));
        }
        producer.finish().unwrap();
        producer
    });

    let mut sink = StatsSink::new();
    let summary =
        run_consumer(&config, &mut consumer, &mut sink, &CancelToken::new(), None).unwrap();
    assert_eq!(summary.reason, StopReason::EndOfStream);
    assert!(summary.frames >= 1);
    assert_eq!(sink.frames(), summary.frames);

    consumer.close();
    let mut producer = pusher.join().unwrap();
    producer.shutdown().unwrap();
}

#[test]
#[serial]
fn dma_video_updates_in_place_without_reconnecting() {
    let sockets = tempfile::tempdir().unwrap();
    let config = test_config(&sockets);

    let surface = Arc::new(HostSurface::new(2, 2).unwrap());
    let first = Frame::packed(2, 2, PixelFormat::Rgba32, vec![1; 16]).unwrap();
    surface.upload(&first).unwrap();

    let mut producer =
        ProducerSession::publish_dma(&config, ContentType::Video, surface.clone()).unwrap();
    assert_eq!(
        producer.path(),
        sockets.path().join("vulkan_shared_video-2x2.sock")
    );

    let resource = ConsumerSession::discover(&config).unwrap();
    assert_eq!(resource.kind, ResourceKind::DMA_VIDEO);
    let mut consumer = ConsumerSession::join(&config, resource, &CancelToken::new()).unwrap();

    let Received::Frame(frame) = consumer.next_frame().unwrap() else {
        panic!("expected a frame");
    };
    assert_eq!(&frame.data[..], &[1; 16]);

    let second = Frame::packed(2, 2, PixelFormat::Rgb24, vec![7; 12]).unwrap();
    producer.push_frame(&second, info(1)).unwrap();
    let Received::Frame(frame) = consumer.next_frame().unwrap() else {
        panic!("expected a frame");
    };
    assert_eq!(&frame.data[..], &[7, 7, 7, 255].repeat(4)[..]);
    let deadline = Instant::now() + Duration::from_secs(1);
    while producer.served() < 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(producer.served(), 1);

    let mut sink = StatsSink::new();
    let summary =
        run_consumer(&config, &mut consumer, &mut sink, &CancelToken::new(), Some(3)).unwrap();
    assert_eq!(summary.reason, StopReason::FrameLimit);
    assert_eq!(summary.frames, 3);

    let socket = producer.path().to_path_buf();
    consumer.close();
    producer.shutdown().unwrap();
    assert!(!socket.exists());
}

#[test]
#[serial]
fn streaming_consumer_waits_for_a_late_producer() {
    let sockets = tempfile::tempdir().unwrap();
    let config = test_config(&sockets);
    let path = sockets.path().join("vulkan_shared_video-4x4.sock");
    let resource = SharedResource {
        path: path.clone(),
        kind: ResourceKind::DMA_VIDEO,
        width: 4,
        height: 4,
    };

    let producer_config = config.clone();
    let producer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let surface = Arc::new(HostSurface::new(4, 4).unwrap());
        ProducerSession::publish_dma(&producer_config, ContentType::Video, surface).unwrap()
    });

    let consumer = ConsumerSession::join(&config, resource, &CancelToken::new()).unwrap();
    assert!(matches!(consumer.channel(), ConsumerChannel::DmaBuf(_)));

    consumer.close();
    drop(producer.join().unwrap());
    assert!(!path.exists());
}

#[test]
#[serial]
fn image_consumer_does_not_retry() {
    let sockets = tempfile::tempdir().unwrap();
    let config = test_config(&sockets);
    let resource = SharedResource {
        path: sockets.path().join("vulkan_shared_image-4x4.sock"),
        kind: ResourceKind::DMA_IMAGE,
        width: 4,
        height: 4,
    };

    let started = Instant::now();
    let err = ConsumerSession::join(&config, resource, &CancelToken::new())
        .err()
        .unwrap();
    assert!(err.is_retryable());
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
#[serial]
fn dma_image_producer_serves_until_cancelled() {
    let sockets = tempfile::tempdir().unwrap();
    let config = test_config(&sockets);
    let path = sockets.path().join("vulkan_shared_image-3x1.sock");

    let cancel = CancelToken::new();
    let producer_cancel = cancel.clone();
    let producer_config = config.clone();
    let producer = thread::spawn(move || {
        let frame = Frame::packed(3, 1, PixelFormat::Rgb24, vec![10, 20, 30, 40, 50, 60, 70, 80, 90])
            .unwrap();
        run_image(
            &producer_config,
            vst_share::discovery::TransportMode::DmaBuf,
            &frame,
            &producer_cancel,
        )
    });

    wait_for(&path);
    // The file appears at bind, slightly before listen.
    thread::sleep(Duration::from_millis(20));
    let mut consumer = ConsumerSession::connect(&config, &CancelToken::new()).unwrap();
    assert_eq!(consumer.resource().kind, ResourceKind::DMA_IMAGE);

    let mut sink = StatsSink::new();
    let summary =
        run_consumer(&config, &mut consumer, &mut sink, &CancelToken::new(), None).unwrap();
    assert_eq!(summary.reason, StopReason::Presented);
    assert_eq!(sink.frames(), 1);
    assert!(!sink.is_interactive());

    let image = consumer.read_image().unwrap();
    assert_eq!(&image.data[..4], &[10, 20, 30, 255]);
    consumer.close();

    cancel.cancel();
    producer.join().unwrap().unwrap();
    assert!(!path.exists());
}

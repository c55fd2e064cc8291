use std::io::{Seek, SeekFrom, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::MetadataExt;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use vst_share::ipc::{
    bind_listener, cleanup_socket, connect, connect_with_backoff, receive_descriptor,
    send_descriptor, DescriptorServer, IpcConfig,
};
use vst_share::surface::{ExportedSurface, HostSurface, ImportedSurface};
use vst_share::media::{Frame, PixelFormat};
use vst_share::utils::CancelToken;
use vst_share::TransportError;

const POLL: Duration = Duration::from_millis(5);

#[test]
fn received_descriptor_refers_to_the_same_file() {
    let (tx, rx) = UnixStream::pair().unwrap();
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"shared bytes").unwrap();

    send_descriptor(&tx, file.as_fd(), 1920, 1080).unwrap();
    let received = receive_descriptor(&rx).unwrap();

    assert_eq!((received.width, received.height), (1920, 1080));
    assert_ne!(received.fd.as_raw_fd(), file.as_raw_fd());

    let mut imported = std::fs::File::from(received.fd);
    let ours = file.metadata().unwrap();
    let theirs = imported.metadata().unwrap();
    assert_eq!((ours.dev(), ours.ino()), (theirs.dev(), theirs.ino()));
    assert_eq!(imported.seek(SeekFrom::End(0)).unwrap(), 12);

    // Closing the sender's copy leaves the receiver's usable.
    drop(file);
    assert_eq!(imported.metadata().unwrap().len(), 12);
}

#[test]
fn server_serves_sequential_clients() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vulkan_shared_video-2x1.sock");

    let surface = HostSurface::new(2, 1).unwrap();
    let frame = Frame::packed(2, 1, PixelFormat::Rgba32, vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    surface.upload(&frame).unwrap();

    let mut server =
        DescriptorServer::spawn(&path, surface.export_fd().unwrap(), 2, 1, POLL).unwrap();
    assert!(path.exists());

    for _ in 0..3 {
        let stream = connect(&path).unwrap();
        let received = receive_descriptor(&stream).unwrap();
        assert_eq!((received.width, received.height), (2, 1));

        let imported = ImportedSurface::import(received.fd, 2, 1).unwrap();
        assert_eq!(&imported.snapshot().unwrap().data[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }
    assert_eq!(server.served(), 3);

    server.stop();
    server.stop();
    assert!(!server.is_running());
    server.close().unwrap();
    assert!(!path.exists());
}

#[test]
fn dropping_the_server_removes_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vulkan_shared_image-1x1.sock");
    let file = tempfile::tempfile().unwrap();

    let server = DescriptorServer::spawn(&path, file.into(), 1, 1, POLL).unwrap();
    assert!(server.is_running());
    drop(server);
    assert!(!path.exists());
}

#[test]
fn stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stale.sock");
    std::fs::write(&path, b"left over").unwrap();

    let listener = bind_listener(&path).unwrap();
    let client = connect(&path).unwrap();
    let (server_side, _) = listener.accept().unwrap();

    let file = tempfile::tempfile().unwrap();
    send_descriptor(&server_side, file.as_fd(), 3, 4).unwrap();
    let received = receive_descriptor(&client).unwrap();
    assert_eq!((received.width, received.height), (3, 4));

    cleanup_socket(&path).unwrap();
    cleanup_socket(&path).unwrap();
}

#[test]
fn connecting_before_the_producer_listens_is_retryable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not_yet.sock");
    let err = connect(&path).unwrap_err();
    assert!(err.is_retryable());

    let config = IpcConfig {
        connect_attempts: 2,
        connect_backoff_initial_ms: 1,
        connect_backoff_max_ms: 1,
        ..Default::default()
    };
    let err = connect_with_backoff(&path, &config, &CancelToken::new()).unwrap_err();
    assert!(matches!(err, TransportError::Io { .. }));
}

#[test]
fn late_producer_is_reached_by_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("late.sock");

    let late_path = path.clone();
    let producer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        let file = tempfile::tempfile().unwrap();
        DescriptorServer::spawn(&late_path, file.into(), 8, 8, POLL).unwrap()
    });

    let config = IpcConfig {
        connect_attempts: 50,
        connect_backoff_initial_ms: 5,
        connect_backoff_max_ms: 20,
        ..Default::default()
    };
    let stream = connect_with_backoff(&path, &config, &CancelToken::new()).unwrap();
    let received = receive_descriptor(&stream).unwrap();
    assert_eq!((received.width, received.height), (8, 8));

    drop(producer.join().unwrap());
}

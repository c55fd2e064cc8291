//! One descriptor plus `width`/`height` over a Unix stream socket.
//!
//! Wire message: 8 payload bytes (`width`, `height` as native-endian u32) with the
//! descriptor attached as `SCM_RIGHTS` ancillary data in the same `sendmsg`.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use nix::errno::Errno;
use nix::sys::socket::{
    bind, listen, recvmsg, sendmsg, socket, AddressFamily, Backlog, ControlMessage,
    ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};

pub const MESSAGE_LEN: usize = 8;

/// What the consumer gets out of one message
#[derive(Debug)]
pub struct ReceivedDescriptor {
    pub fd: OwnedFd,
    pub width: u32,
    pub height: u32,
}

/// Replace any stale socket at `path` and listen on it with a backlog of one.
pub fn bind_listener(path: &Path) -> Result<UnixListener> {
    cleanup_socket(path)?;

    let context = |what: &str| format!("Failed to {what} {}", path.display());
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|e| TransportError::os(context("create socket for"), e))?;
    let addr = UnixAddr::new(path).map_err(|e| TransportError::os(context("address"), e))?;
    bind(fd.as_raw_fd(), &addr).map_err(|e| TransportError::os(context("bind"), e))?;

    let backlog = Backlog::new(1).map_err(|e| TransportError::os(context("listen on"), e))?;
    listen(&fd, backlog).map_err(|e| TransportError::os(context("listen on"), e))?;

    info!("Listening on {}", path.display());
    Ok(UnixListener::from(fd))
}

/// Connect to a producer's socket.
pub fn connect(path: &Path) -> Result<UnixStream> {
    let stream = UnixStream::connect(path)
        .map_err(|e| TransportError::io(format!("Failed to connect to {}", path.display()), e))?;
    debug!("Connected to {}", path.display());
    Ok(stream)
}

/// Send `fd` with its dimensions as one message.
pub fn send_descriptor<S: AsRawFd>(
    socket: &S,
    fd: BorrowedFd<'_>,
    width: u32,
    height: u32,
) -> Result<()> {
    let mut payload = [0u8; MESSAGE_LEN];
    payload[..4].copy_from_slice(&width.to_ne_bytes());
    payload[4..].copy_from_slice(&height.to_ne_bytes());

    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(&payload)];

    let sent = loop {
        match sendmsg::<UnixAddr>(
            socket.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::MSG_NOSIGNAL,
            None,
        ) {
            Err(Errno::EINTR) => continue,
            other => break other,
        }
    }
    .map_err(|e| TransportError::os("Failed to send descriptor", e))?;

    if sent != MESSAGE_LEN {
        return Err(TransportError::ShortMessage {
            expected: MESSAGE_LEN,
            actual: sent,
        });
    }
    debug!("Sent descriptor {} ({}x{})", fd.as_raw_fd(), width, height);
    Ok(())
}

/// Receive one message. A message without a descriptor is a protocol error.
pub fn receive_descriptor<S: AsRawFd>(socket: &S) -> Result<ReceivedDescriptor> {
    let mut payload = [0u8; MESSAGE_LEN];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);

    let (bytes, mut fds) = {
        let mut iov = [IoSliceMut::new(&mut payload)];
        let msg = loop {
            match recvmsg::<UnixAddr>(
                socket.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Err(Errno::EINTR) => continue,
                other => break other,
            }
        }
        .map_err(|e| TransportError::os("Failed to receive descriptor", e))?;

        let mut fds = Vec::new();
        for cmsg in msg
            .cmsgs()
            .map_err(|e| TransportError::os("Failed to read control messages", e))?
        {
            match cmsg {
                ControlMessageOwned::ScmRights(raw) => {
                    for fd in raw {
                        // SAFETY: the kernel just installed this descriptor for us and
                        // nothing else refers to it.
                        fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
                other => warn!("Ignoring unexpected control message {:?}", other),
            }
        }
        (msg.bytes, fds)
    };

    if bytes != MESSAGE_LEN {
        return Err(TransportError::ShortMessage {
            expected: MESSAGE_LEN,
            actual: bytes,
        });
    }
    if fds.is_empty() {
        return Err(TransportError::MissingDescriptor);
    }
    if fds.len() > 1 {
        warn!("Received {} descriptors, keeping the first", fds.len());
    }

    let width = u32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let height = u32::from_ne_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let fd = fds.swap_remove(0);
    debug!("Received descriptor {} ({}x{})", fd.as_raw_fd(), width, height);

    Ok(ReceivedDescriptor { fd, width, height })
}

/// Remove the socket file. Missing is fine.
pub fn cleanup_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed socket {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TransportError::io(
            format!("Failed to remove {}", path.display()),
            e,
        )),
    }
}

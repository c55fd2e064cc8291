use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{Result, TransportError};
use crate::ipc::fd_passing::{bind_listener, cleanup_socket, send_descriptor};
use crate::utils::CancelToken;

/// Hands the same descriptor to every client that connects, one at a time,
/// until stopped.
pub struct DescriptorServer {
    path: PathBuf,
    cancel: CancelToken,
    served: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl DescriptorServer {
    /// Bind `path` and start the accept thread. The server keeps `fd` open for
    /// its whole life.
    pub fn spawn(
        path: &Path,
        fd: OwnedFd,
        width: u32,
        height: u32,
        poll_interval: Duration,
    ) -> Result<Self> {
        let listener = bind_listener(path)?;
        listener
            .set_nonblocking(true)
            .map_err(|e| TransportError::io("Failed to make listener non-blocking", e))?;

        let cancel = CancelToken::new();
        let served = Arc::new(AtomicU64::new(0));

        let worker = AcceptLoop {
            listener,
            fd,
            width,
            height,
            poll_interval,
            cancel: cancel.clone(),
            served: served.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("vst-descriptor-server".into())
            .spawn(move || worker.run())
            .map_err(|e| TransportError::io("Failed to spawn descriptor server", e))?;

        Ok(Self {
            path: path.to_path_buf(),
            cancel,
            served,
            handle: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of clients that received the descriptor
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop accepting and join the thread. Idempotent. The socket file stays
    /// until [`close`](Self::close) or drop.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.cancel.cancel();
        if handle.join().is_err() {
            error!("Descriptor server thread panicked");
        }
        info!(
            "Descriptor server on {} stopped after {} clients",
            self.path.display(),
            self.served()
        );
    }

    /// Stop and remove the socket file.
    pub fn close(mut self) -> Result<()> {
        self.stop();
        cleanup_socket(&self.path)
    }
}

impl Drop for DescriptorServer {
    fn drop(&mut self) {
        self.stop();
        if let Err(e) = cleanup_socket(&self.path) {
            warn!("{}", e);
        }
    }
}

struct AcceptLoop {
    listener: UnixListener,
    fd: OwnedFd,
    width: u32,
    height: u32,
    poll_interval: Duration,
    cancel: CancelToken,
    served: Arc<AtomicU64>,
}

impl AcceptLoop {
    fn run(self) {
        debug!("Descriptor server thread started");
        while !self.cancel.is_cancelled() {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    // One failing client must not take the server down.
                    match send_descriptor(&stream, self.fd.as_fd(), self.width, self.height) {
                        Ok(()) => {
                            let n = self.served.fetch_add(1, Ordering::Relaxed) + 1;
                            metrics::counter!("vst_descriptors_served").increment(1);
                            info!("Sent descriptor to client #{}", n);
                        }
                        Err(e) => warn!("Failed to serve client: {}", e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.cancel.wait_timeout(self.poll_interval);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("Accept failed: {}", e);
                    self.cancel.wait_timeout(self.poll_interval);
                }
            }
        }
        debug!("Descriptor server thread exiting");
    }
}

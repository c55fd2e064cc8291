pub mod fd_passing;
pub mod server;

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::utils::{backoff, CancelToken};

pub use fd_passing::{
    bind_listener, cleanup_socket, connect, receive_descriptor, send_descriptor,
    ReceivedDescriptor, MESSAGE_LEN,
};
pub use server::DescriptorServer;

/// Descriptor-passing settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub accept_poll_interval_ms: u64,
    pub connect_attempts: u32,
    pub connect_backoff_initial_ms: u64,
    pub connect_backoff_max_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            accept_poll_interval_ms: 20,
            connect_attempts: 20,
            connect_backoff_initial_ms: 100,
            connect_backoff_max_ms: 2000,
        }
    }
}

impl IpcConfig {
    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_interval_ms)
    }

    pub fn backoff(&self) -> impl Iterator<Item = Duration> {
        backoff(
            Duration::from_millis(self.connect_backoff_initial_ms),
            Duration::from_millis(self.connect_backoff_max_ms),
        )
    }
}

/// Connect to `path`, retrying retryable failures with exponential backoff.
/// The last error is returned once `config.connect_attempts` are spent.
pub fn connect_with_backoff(
    path: &Path,
    config: &IpcConfig,
    cancel: &CancelToken,
) -> Result<UnixStream> {
    retry_with_backoff(config, cancel, "connect", || connect(path))
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub fn retry_with_backoff<T>(
    config: &IpcConfig,
    cancel: &CancelToken,
    what: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let attempts = config.connect_attempts.max(1);
    let mut delays = config.backoff();
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts && !cancel.is_cancelled() => {
                let delay = delays.next().unwrap_or_default();
                debug!(
                    "{} attempt {}/{} failed ({}), retrying in {:?}",
                    what, attempt, attempts, e, delay
                );
                if cancel.wait_timeout(delay) {
                    return Err(e);
                }
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!("{} gave up after {} attempts", what, attempt);
                }
                return Err(e);
            }
        }
    }
}

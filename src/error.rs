//! Error type shared by the transport layer (discovery, shared memory, descriptor passing)

use std::io;

use nix::errno::Errno;
use thiserror::Error;

pub type Result<T, E = TransportError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Os {
        context: String,
        #[source]
        source: Errno,
    },

    /// A resource name matched a naming pattern but its dimensions could not be decoded
    #[error("invalid resource name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("no shared resource found")]
    NotFound,

    #[error("invalid frame geometry {width}x{height}x{channels}")]
    InvalidGeometry {
        width: u32,
        height: u32,
        channels: u32,
    },

    #[error("frame is {actual:?} but the channel expects {expected:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("cannot convert {from}-channel pixels to {to} channels")]
    UnsupportedConversion { from: u32, to: u32 },

    #[error("pixel buffer holds {actual} bytes, {expected} required")]
    BufferSize { expected: usize, actual: usize },

    #[error("mapped region is {actual} bytes, {required} required")]
    SegmentTooSmall { required: usize, actual: usize },

    #[error("channel is not open")]
    NotOpen,

    /// The segment exists but its creator has not finished sizing or initialising it
    #[error("shared memory {name} is not initialised yet")]
    NotReady { name: String },

    #[error("writer did not finish a frame in time")]
    WriterStalled,

    #[error("message carried no file descriptor")]
    MissingDescriptor,

    #[error("short message: {actual} of {expected} bytes")]
    ShortMessage { expected: usize, actual: usize },
}

impl TransportError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn os(context: impl Into<String>, source: Errno) -> Self {
        Self::Os {
            context: context.into(),
            source,
        }
    }

    /// Errors a streaming consumer should answer with a backoff and another attempt:
    /// the producer has not created its socket or segment yet, or is not listening.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::Interrupted
            ),
            Self::Os { source, .. } => {
                matches!(source, Errno::ENOENT | Errno::ECONNREFUSED | Errno::EINTR)
            }
            Self::NotFound | Self::NotReady { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_connections_are_retryable() {
        let refused = TransportError::io(
            "connect",
            io::Error::from(io::ErrorKind::ConnectionRefused),
        );
        assert!(refused.is_retryable());
        assert!(TransportError::os("shm_open", Errno::ENOENT).is_retryable());
        assert!(TransportError::NotReady {
            name: "vst_shared_video-4x4".into()
        }
        .is_retryable());
    }

    #[test]
    fn protocol_errors_are_not_retryable() {
        assert!(!TransportError::MissingDescriptor.is_retryable());
        assert!(!TransportError::DimensionMismatch {
            expected: (4, 3),
            actual: (3, 4)
        }
        .is_retryable());
    }
}

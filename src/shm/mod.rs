pub mod channel;
pub mod header;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use channel::{
    unlink_segment, ChannelRole, ChannelStats, PollPolicy, ReadOutcome, ShmFrameChannel,
};
pub use header::{FrameInfo, HeaderSnapshot, SharedFrameHeader, HEADER_SIZE};

/// Shared-memory channel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmConfig {
    /// Channel count producers declare for new segments
    pub channels: u32,
    pub poll_interval_ms: u64,
    pub max_poll_attempts: u32,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            channels: 4,
            poll_interval_ms: 50,
            max_poll_attempts: 100, // 5 seconds at 50ms
        }
    }
}

impl ShmConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_attempts: self.max_poll_attempts,
        }
    }
}

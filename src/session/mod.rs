pub mod consumer;
pub mod producer;

pub use consumer::{
    run_consumer, ConsumerChannel, ConsumerSession, ConsumerSummary, Received, StopReason,
};
pub use producer::{run_image, run_video, ProducerSession, VideoOptions};

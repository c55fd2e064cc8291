//! Consumer side: find a producer, attach to it, pull frames into a sink.

use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::discovery::{ContentType, SharedResource, TransportMode};
use crate::display::FrameSink;
use crate::error::{Result, TransportError};
use crate::ipc::{connect, receive_descriptor, retry_with_backoff};
use crate::media::{Frame, PixelFormat};
use crate::shm::{HeaderSnapshot, ReadOutcome, ShmFrameChannel};
use crate::surface::ImportedSurface;
use crate::utils::CancelToken;
use crate::Config;

/// The attached transport
pub enum ConsumerChannel {
    SharedMemory(ShmFrameChannel),
    DmaBuf(ImportedSurface),
}

/// Outcome of [`ConsumerSession::next_frame`]
#[derive(Clone)]
pub enum Received {
    Frame(Frame),
    Timeout,
    EndOfStream,
}

pub struct ConsumerSession {
    resource: SharedResource,
    channel: ConsumerChannel,
    buffer: Vec<u8>,
    sequence: u64,
}

impl ConsumerSession {
    /// Scan for a published resource. Nothing found is [`TransportError::NotFound`].
    pub fn discover(config: &Config) -> Result<SharedResource> {
        config.discovery().require()
    }

    /// Attach to `resource`. Streams retry transient failures with backoff;
    /// a still image gets one attempt.
    #[instrument(skip(config, cancel), fields(path = %resource.path.display()))]
    pub fn join(config: &Config, resource: SharedResource, cancel: &CancelToken) -> Result<Self> {
        let channel = match resource.content() {
            ContentType::Image => Self::attach(config, &resource)?,
            ContentType::Video => retry_with_backoff(&config.ipc, cancel, "attach", || {
                Self::attach(config, &resource)
            })?,
        };

        Ok(Self {
            resource,
            channel,
            buffer: Vec::new(),
            sequence: 0,
        })
    }

    /// Discover and join in one step.
    pub fn connect(config: &Config, cancel: &CancelToken) -> Result<Self> {
        let resource = Self::discover(config)?;
        Self::join(config, resource, cancel)
    }

    fn attach(config: &Config, resource: &SharedResource) -> Result<ConsumerChannel> {
        match resource.mode() {
            TransportMode::SharedMemory => {
                let channel = ShmFrameChannel::open(resource.name())?
                    .with_poll_policy(config.shm.poll_policy());
                let snapshot = channel.frame_metadata();
                if (snapshot.width, snapshot.height) != (resource.width, resource.height) {
                    warn!(
                        "Segment header says {}x{}, name says {}x{}; using the header",
                        snapshot.width, snapshot.height, resource.width, resource.height
                    );
                }
                Ok(ConsumerChannel::SharedMemory(channel))
            }
            TransportMode::DmaBuf => {
                let stream = connect(&resource.path)?;
                let received = receive_descriptor(&stream)?;
                drop(stream);
                if (received.width, received.height) != (resource.width, resource.height) {
                    warn!(
                        "Producer sent {}x{}, name says {}x{}; using the message",
                        received.width, received.height, resource.width, resource.height
                    );
                }
                let surface =
                    ImportedSurface::import(received.fd, received.width, received.height)?;
                Ok(ConsumerChannel::DmaBuf(surface))
            }
        }
    }

    pub fn resource(&self) -> &SharedResource {
        &self.resource
    }

    pub fn channel(&self) -> &ConsumerChannel {
        &self.channel
    }

    /// Frame rate the producer declared, if any
    pub fn producer_fps(&self) -> Option<f64> {
        match &self.channel {
            ConsumerChannel::SharedMemory(channel) => {
                Some(channel.frame_metadata().fps).filter(|f| *f > 0.0)
            }
            ConsumerChannel::DmaBuf(_) => None,
        }
    }

    /// Copy whatever the producer last published.
    pub fn read_image(&mut self) -> Result<Frame> {
        match &self.channel {
            ConsumerChannel::SharedMemory(channel) => {
                let snapshot = channel.read_current(&mut self.buffer)?;
                frame_from(snapshot, &mut self.buffer)
            }
            ConsumerChannel::DmaBuf(surface) => surface.snapshot(),
        }
    }

    /// Wait for the next frame. A DMA surface always has a current frame.
    pub fn next_frame(&mut self) -> Result<Received> {
        match &self.channel {
            ConsumerChannel::SharedMemory(channel) => {
                match channel.read_frame(&mut self.buffer, true)? {
                    ReadOutcome::Frame(snapshot) => {
                        frame_from(snapshot, &mut self.buffer).map(Received::Frame)
                    }
                    ReadOutcome::Timeout => Ok(Received::Timeout),
                    ReadOutcome::EndOfStream => Ok(Received::EndOfStream),
                }
            }
            ConsumerChannel::DmaBuf(surface) => {
                let frame = surface.snapshot()?.with_sequence(self.sequence);
                self.sequence += 1;
                metrics::counter!("vst_frames_read").increment(1);
                Ok(Received::Frame(frame))
            }
        }
    }

    /// Release the mapping or imported descriptor. Never removes the
    /// producer's name.
    pub fn close(self) {
        if let ConsumerChannel::SharedMemory(channel) = &self.channel {
            channel.close();
        }
        info!("Detached from {}", self.resource.path.display());
    }
}

/// Wrap the bytes a shared-memory read left in `buffer`.
fn frame_from(snapshot: HeaderSnapshot, buffer: &mut Vec<u8>) -> Result<Frame> {
    let format =
        PixelFormat::from_channels(snapshot.channels).ok_or(TransportError::InvalidGeometry {
            width: snapshot.width,
            height: snapshot.height,
            channels: snapshot.channels,
        })?;
    let pixels = std::mem::take(buffer);
    let frame = Frame::packed(snapshot.width, snapshot.height, format, pixels)?
        .with_sequence(snapshot.frame_index as u64)
        .with_source_timestamp(Duration::from_millis(snapshot.timestamp_ms));
    Ok(frame)
}

/// Why [`run_consumer`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A still image was presented
    Presented,
    EndOfStream,
    /// The producer's name disappeared while we waited
    ProducerGone,
    FrameLimit,
    SinkClosed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSummary {
    pub frames: u64,
    pub timeouts: u64,
    pub reason: StopReason,
}

/// Pull frames from `session` into `sink` until the stream ends, the sink
/// closes, `max_frames` are presented or `cancel` fires.
pub fn run_consumer(
    config: &Config,
    session: &mut ConsumerSession,
    sink: &mut dyn FrameSink,
    cancel: &CancelToken,
    max_frames: Option<u64>,
) -> color_eyre::Result<ConsumerSummary> {
    let kind = session.resource().kind;
    let summary = match (kind.mode, kind.content) {
        (TransportMode::SharedMemory, ContentType::Image)
        | (TransportMode::DmaBuf, ContentType::Image) => {
            show_image(config, session, sink, cancel)?
        }
        (TransportMode::SharedMemory, ContentType::Video) => {
            stream(config, session, sink, cancel, max_frames, true)?
        }
        (TransportMode::DmaBuf, ContentType::Video) => {
            stream(config, session, sink, cancel, max_frames, false)?
        }
    };
    sink.finish()?;

    info!(
        "Consumer stopped ({:?}) after {} frames",
        summary.reason, summary.frames
    );
    Ok(summary)
}

fn show_image(
    config: &Config,
    session: &mut ConsumerSession,
    sink: &mut dyn FrameSink,
    cancel: &CancelToken,
) -> color_eyre::Result<ConsumerSummary> {
    let frame = session.read_image()?;
    info!("Read image {}x{}", frame.width(), frame.height());
    sink.present(&frame)?;

    let delay = config.video.frame_delay(None);
    let mut reason = StopReason::Presented;
    if sink.is_interactive() {
        reason = loop {
            if sink.should_close() {
                break StopReason::SinkClosed;
            }
            if cancel.wait_timeout(delay) {
                break StopReason::Cancelled;
            }
            // A DMA producer may still be drawing into the surface.
            let frame = match &session.channel {
                ConsumerChannel::DmaBuf(surface) => surface.snapshot()?,
                ConsumerChannel::SharedMemory(_) => frame.clone(),
            };
            sink.present(&frame)?;
        };
    }

    Ok(ConsumerSummary {
        frames: 1,
        timeouts: 0,
        reason,
    })
}

fn stream(
    config: &Config,
    session: &mut ConsumerSession,
    sink: &mut dyn FrameSink,
    cancel: &CancelToken,
    max_frames: Option<u64>,
    watch_producer: bool,
) -> color_eyre::Result<ConsumerSummary> {
    let progress_every = config.display.progress_every.max(1);
    let mut frames = 0u64;
    let mut timeouts = 0u64;
    let started = Instant::now();

    let reason = loop {
        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }
        if sink.should_close() {
            break StopReason::SinkClosed;
        }
        if max_frames.is_some_and(|max| frames >= max) {
            break StopReason::FrameLimit;
        }

        let frame_started = Instant::now();
        let frame = match session.next_frame()? {
            Received::Frame(frame) => frame,
            Received::EndOfStream => break StopReason::EndOfStream,
            Received::Timeout => {
                timeouts += 1;
                if watch_producer && !session.resource().path.exists() {
                    info!("Producer removed {}", session.resource().path.display());
                    break StopReason::ProducerGone;
                }
                debug!("No frame yet, waiting again");
                continue;
            }
        };

        sink.present(&frame)?;
        frames += 1;
        if frames % progress_every == 0 {
            info!(
                "Received {} frames ({:.1} fps)",
                frames,
                frames as f64 / started.elapsed().as_secs_f64()
            );
        }

        let delay = config.video.frame_delay(session.producer_fps());
        if let Some(remaining) = delay.checked_sub(frame_started.elapsed()) {
            if cancel.wait_timeout(remaining) {
                break StopReason::Cancelled;
            }
        }
    };

    Ok(ConsumerSummary {
        frames,
        timeouts,
        reason,
    })
}

//! Producer side: publish a resource, feed it frames, tear it down.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::eyre::WrapErr;
use flume::{bounded, RecvTimeoutError};
use tracing::{debug, error, info, instrument, warn};

use crate::discovery::{ContentType, ResourceKind, TransportMode};
use crate::error::{Result, TransportError};
use crate::ipc::DescriptorServer;
use crate::media::{Frame, FrameSource};
use crate::shm::{unlink_segment, FrameInfo, ShmFrameChannel};
use crate::surface::{ExportedSurface, HostSurface};
use crate::utils::{CancelToken, StreamClock};
use crate::Config;

/// Frames buffered between the decoder thread and the publisher
const DECODE_QUEUE: usize = 2;

enum Transport {
    SharedMemory(ShmFrameChannel),
    DmaBuf {
        surface: Arc<dyn ExportedSurface>,
        server: DescriptorServer,
    },
}

/// A published resource and the means to update it
pub struct ProducerSession {
    kind: ResourceKind,
    name: String,
    path: PathBuf,
    width: u32,
    height: u32,
    transport: Option<Transport>,
}

impl ProducerSession {
    /// Create the shared-memory segment `<prefix>-<W>x<H>`.
    #[instrument(skip(config))]
    pub fn publish_shm(
        config: &Config,
        content: ContentType,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let kind = ResourceKind::new(TransportMode::SharedMemory, content);
        let discovery = config.discovery();
        let name = config.naming.encode(kind, width, height);
        let path = discovery.path_for(kind, width, height);

        let channel = ShmFrameChannel::create(&name, width, height, config.shm.channels)?
            .with_poll_policy(config.shm.poll_policy());

        info!("Publishing {} as {}", kind, path.display());
        Ok(Self {
            kind,
            name,
            path,
            width,
            height,
            transport: Some(Transport::SharedMemory(channel)),
        })
    }

    /// Serve `surface`'s descriptor on `<prefix>-<W>x<H>.sock`.
    #[instrument(skip(config, surface))]
    pub fn publish_dma(
        config: &Config,
        content: ContentType,
        surface: Arc<dyn ExportedSurface>,
    ) -> Result<Self> {
        let kind = ResourceKind::new(TransportMode::DmaBuf, content);
        let (width, height) = (surface.width(), surface.height());
        let name = config.naming.encode(kind, width, height);
        let path = config.discovery().path_for(kind, width, height);

        let server = DescriptorServer::spawn(
            &path,
            surface.export_fd()?,
            width,
            height,
            config.ipc.accept_poll_interval(),
        )?;

        info!("Publishing {} as {}", kind, path.display());
        Ok(Self {
            kind,
            name,
            path,
            width,
            height,
            transport: Some(Transport::DmaBuf { surface, server }),
        })
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Clients served so far; always zero for shared memory.
    pub fn served(&self) -> u64 {
        match &self.transport {
            Some(Transport::DmaBuf { server, .. }) => server.served(),
            _ => 0,
        }
    }

    pub fn is_published(&self) -> bool {
        self.transport.is_some()
    }

    /// Publish one frame. Shared memory gets a new slot value; a DMA surface
    /// is updated in place.
    pub fn push_frame(&self, frame: &Frame, info: FrameInfo) -> Result<()> {
        match &self.transport {
            Some(Transport::SharedMemory(channel)) => channel.write_frame(frame, info),
            Some(Transport::DmaBuf { surface, .. }) => {
                surface.upload(frame)?;
                metrics::counter!("vst_frames_written").increment(1);
                Ok(())
            }
            None => Err(TransportError::NotOpen),
        }
    }

    /// Tell consumers no more frames follow.
    pub fn finish(&self) -> Result<()> {
        match &self.transport {
            Some(Transport::SharedMemory(channel)) => channel.signal_end_of_video(),
            // Consumers keep showing the last upload; the socket goes away on shutdown.
            Some(Transport::DmaBuf { .. }) => Ok(()),
            None => Ok(()),
        }
    }

    /// Stop serving, release the surface or mapping, then remove the name.
    /// Idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(transport) = self.transport.take() else {
            return Ok(());
        };
        info!("Shutting down {} {}", self.kind, self.name);

        match transport {
            Transport::SharedMemory(channel) => {
                channel.close();
                drop(channel);
                unlink_segment(&self.name)
            }
            Transport::DmaBuf {
                surface,
                mut server,
            } => {
                server.stop();
                drop(surface);
                server.close()
            }
        }
    }
}

impl Drop for ProducerSession {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Producer cleanup failed: {}", e);
        }
    }
}

/// Publish a still image and keep it available until cancelled.
pub fn run_image(
    config: &Config,
    mode: TransportMode,
    frame: &Frame,
    cancel: &CancelToken,
) -> color_eyre::Result<()> {
    let mut session = match mode {
        TransportMode::SharedMemory => {
            let session =
                ProducerSession::publish_shm(config, ContentType::Image, frame.width(), frame.height())?;
            session.push_frame(
                frame,
                FrameInfo {
                    frame_index: 0,
                    total_frames: 1,
                    fps: 0.0,
                    timestamp_ms: 0,
                },
            )?;
            session
        }
        TransportMode::DmaBuf => {
            let surface = HostSurface::from_frame(frame)?;
            ProducerSession::publish_dma(config, ContentType::Image, Arc::new(surface))?
        }
    };

    info!("Image published at {}, waiting for shutdown", session.path().display());
    cancel.wait();
    session.shutdown()?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct VideoOptions {
    /// Rate to pace at when the source does not declare one
    pub fps: Option<f64>,
    /// Rewind at end of stream instead of finishing
    pub looping: bool,
}

/// Decode `source` on a worker thread and publish each frame at the source rate.
pub fn run_video(
    config: &Config,
    mode: TransportMode,
    mut source: Box<dyn FrameSource>,
    options: VideoOptions,
    cancel: &CancelToken,
) -> color_eyre::Result<u64> {
    let (width, height) = source.dimensions();
    let fps = source
        .fps()
        .or(options.fps)
        .filter(|f| f.is_finite() && *f > 0.0)
        .unwrap_or(config.video.default_fps);
    let frame_delay = config.video.frame_delay(Some(fps));
    let total_frames = source.frame_count().unwrap_or(0);

    let mut session = match mode {
        TransportMode::SharedMemory => {
            ProducerSession::publish_shm(config, ContentType::Video, width, height)?
        }
        TransportMode::DmaBuf => {
            let surface = HostSurface::new(width, height)?;
            ProducerSession::publish_dma(config, ContentType::Video, Arc::new(surface))?
        }
    };
    info!(
        "Streaming {}x{} at {:.2} fps to {}",
        width,
        height,
        fps,
        session.path().display()
    );

    let (tx, rx) = bounded::<Frame>(DECODE_QUEUE);
    let decode_cancel = cancel.clone();
    let looping = options.looping;
    let decoder = std::thread::Builder::new()
        .name("vst-decoder".into())
        .spawn(move || -> color_eyre::Result<()> {
            while !decode_cancel.is_cancelled() {
                match source.next_frame()? {
                    Some(frame) => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    None if looping => {
                        debug!("Source exhausted, rewinding");
                        source.rewind()?;
                    }
                    None => break,
                }
            }
            Ok(())
        })
        .wrap_err("Failed to spawn decoder thread")?;

    let clock = StreamClock::start();
    let mut published = 0u64;
    let poll = Duration::from_millis(100);

    while !cancel.is_cancelled() {
        let frame = match rx.recv_timeout(poll) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let started = Instant::now();
        let info = FrameInfo {
            frame_index: (published % u32::MAX as u64) as u32,
            total_frames,
            fps,
            timestamp_ms: clock.elapsed_ms(),
        };
        if let Err(e) = session.push_frame(&frame, info) {
            warn!("Dropping frame {}: {}", published, e);
        } else {
            published += 1;
        }

        if let Some(remaining) = frame_delay.checked_sub(started.elapsed()) {
            if cancel.wait_timeout(remaining) {
                break;
            }
        }
    }
    drop(rx);

    let decoded = match decoder.join() {
        Ok(result) => result,
        Err(_) => Err(color_eyre::eyre::eyre!("Decoder thread panicked")),
    };
    if let Err(e) = decoded {
        session.shutdown()?;
        return Err(e.wrap_err(format!("Decoding stopped after {published} frames")));
    }

    if !cancel.is_cancelled() {
        info!("Source finished after {} frames", published);
        session.finish()?;
        if mode == TransportMode::DmaBuf {
            // DMA consumers keep rendering the last frame until the producer exits.
            cancel.wait();
        } else {
            // Leave the segment up long enough for a waiting reader to see the end.
            cancel.wait_timeout(config.shm.poll_policy().interval * 4);
        }
    }

    session.shutdown()?;
    Ok(published)
}

//! Frame sources feeding the producer: still images and image sequences.
//!
//! Decoding is an external concern to the transport; these sources only turn a
//! path into RGBA [`Frame`]s with known dimensions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use tracing::{debug, info};

use crate::media::{Frame, PixelFormat};

const SEQUENCE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Something that yields decoded frames of a fixed size
pub trait FrameSource: Send {
    fn dimensions(&self) -> (u32, u32);

    /// Native frame rate, if the container declares one
    fn fps(&self) -> Option<f64>;

    /// Total frame count, if known up front
    fn frame_count(&self) -> Option<u32>;

    /// Next frame, or `None` at end of stream
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Restart from the first frame
    fn rewind(&mut self) -> Result<()>;
}

/// Decode a still image into an RGBA frame.
pub fn load_image(path: &Path) -> Result<Frame> {
    let rgba = image::open(path)
        .wrap_err_with(|| format!("Failed to load image {}", path.display()))?
        .to_rgba8();
    let (width, height) = rgba.dimensions();
    info!("Loaded image {} ({}x{})", path.display(), width, height);
    Ok(Frame::packed(width, height, PixelFormat::Rgba32, rgba.into_raw())?)
}

/// A directory of numbered stills played back as a video
pub struct ImageSequenceSource {
    files: Vec<PathBuf>,
    position: usize,
    width: u32,
    height: u32,
    fps: Option<f64>,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path, fps: Option<f64>) -> Result<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .wrap_err_with(|| format!("Failed to read {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| SEQUENCE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        let first = files
            .first()
            .ok_or_else(|| eyre!("No images found in {}", dir.display()))?;
        let (width, height) = image::image_dimensions(first)
            .wrap_err_with(|| format!("Failed to probe {}", first.display()))?;

        info!(
            "Image sequence {}: {} frames at {}x{}",
            dir.display(),
            files.len(),
            width,
            height
        );

        Ok(Self {
            files,
            position: 0,
            width,
            height,
            fps,
        })
    }
}

impl FrameSource for ImageSequenceSource {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn frame_count(&self) -> Option<u32> {
        u32::try_from(self.files.len()).ok()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.files.get(self.position) else {
            return Ok(None);
        };

        let frame = load_image(path)?;
        if (frame.width(), frame.height()) != (self.width, self.height) {
            return Err(eyre!(
                "{} is {}x{}, sequence is {}x{}",
                path.display(),
                frame.width(),
                frame.height(),
                self.width,
                self.height
            ));
        }

        let index = self.position as u64;
        self.position += 1;
        debug!("Decoded sequence frame {}", index);

        let mut frame = frame.with_sequence(index);
        if let Some(fps) = self.fps.filter(|f| *f > 0.0) {
            frame = frame.with_source_timestamp(Duration::from_secs_f64(index as f64 / fps));
        }
        Ok(Some(frame))
    }

    fn rewind(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }
}

/// Open a video source: a directory is played as an image sequence, anything
/// else is handed to GStreamer when that feature is built in.
pub fn open_video(path: &Path, fps: Option<f64>) -> Result<Box<dyn FrameSource>> {
    if path.is_dir() {
        return Ok(Box::new(ImageSequenceSource::open(path, fps)?));
    }

    #[cfg(feature = "gstreamer-pipeline")]
    {
        Ok(Box::new(crate::media::gst_source::GstVideoSource::open(
            path, fps,
        )?))
    }

    #[cfg(not(feature = "gstreamer-pipeline"))]
    {
        Err(eyre!(
            "{} is not a directory; decoding video files requires the gstreamer-pipeline feature",
            path.display()
        ))
    }
}

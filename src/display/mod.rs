//! Where the consumer puts received frames.

#[cfg(feature = "sdl-display")]
pub mod sdl;

use std::path::{Path, PathBuf};
use std::time::Instant;

use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use tracing::info;

use crate::media::{convert, Frame};

#[cfg(feature = "sdl-display")]
pub use sdl::Sdl2Sink;

/// Consumer-side frame destination
pub trait FrameSink {
    fn present(&mut self, frame: &Frame) -> Result<()>;

    /// Whether the user asked to quit (window closed)
    fn should_close(&mut self) -> bool {
        false
    }

    /// Sinks with a window keep showing a still image until closed
    fn is_interactive(&self) -> bool {
        false
    }

    /// Called once after the last frame
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl FrameSink for Vec<Box<dyn FrameSink>> {
    fn present(&mut self, frame: &Frame) -> Result<()> {
        self.iter_mut().try_for_each(|sink| sink.present(frame))
    }

    fn should_close(&mut self) -> bool {
        self.iter_mut().any(|sink| sink.should_close())
    }

    fn is_interactive(&self) -> bool {
        self.iter().any(|sink| sink.is_interactive())
    }

    fn finish(&mut self) -> Result<()> {
        self.iter_mut().try_for_each(|sink| sink.finish())
    }
}

/// Counts frames and reports the achieved rate
#[derive(Debug, Default)]
pub struct StatsSink {
    frames: u64,
    first: Option<Instant>,
    last: Option<Instant>,
    dimensions: (u32, u32),
}

impl StatsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn fps(&self) -> f64 {
        match (self.first, self.last) {
            (Some(first), Some(last)) if self.frames > 1 => {
                let secs = last.duration_since(first).as_secs_f64();
                if secs > 0.0 {
                    (self.frames - 1) as f64 / secs
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }
}

impl FrameSink for StatsSink {
    fn present(&mut self, frame: &Frame) -> Result<()> {
        let now = Instant::now();
        self.first.get_or_insert(now);
        self.last = Some(now);
        self.frames += 1;
        self.dimensions = (frame.width(), frame.height());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        info!(
            "Received {} frames at {}x{} ({:.1} fps)",
            self.frames,
            self.dimensions.0,
            self.dimensions.1,
            self.fps()
        );
        Ok(())
    }
}

/// Writes the last presented frame to a PNG on finish
pub struct PngSink {
    path: PathBuf,
    last: Option<Frame>,
}

impl PngSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSink for PngSink {
    fn present(&mut self, frame: &Frame) -> Result<()> {
        self.last = Some(frame.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let Some(frame) = self.last.take() else {
            info!("No frame received, not writing {}", self.path.display());
            return Ok(());
        };

        let rgba = convert::to_packed(&frame, 4)?;
        let image = image::RgbaImage::from_raw(frame.width(), frame.height(), rgba)
            .ok_or_else(|| eyre!("Frame buffer does not match its dimensions"))?;
        image
            .save(&self.path)
            .wrap_err_with(|| format!("Failed to write {}", self.path.display()))?;

        info!(
            "Wrote frame {}x{} to {}",
            frame.width(),
            frame.height(),
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PixelFormat;

    #[test]
    fn png_sink_writes_last_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        let mut sink = PngSink::new(&path);

        let first = Frame::packed(1, 1, PixelFormat::Rgba32, vec![1, 1, 1, 255]).unwrap();
        let last = Frame::packed(1, 1, PixelFormat::Rgb24, vec![9, 8, 7]).unwrap();
        sink.present(&first).unwrap();
        sink.present(&last).unwrap();
        sink.finish().unwrap();

        let written = image::open(&path).unwrap().to_rgba8();
        assert_eq!(written.get_pixel(0, 0).0, [9, 8, 7, 255]);
    }

    #[test]
    fn sinks_fan_out() {
        let mut sinks: Vec<Box<dyn FrameSink>> = vec![Box::new(StatsSink::new())];
        let frame = Frame::packed(2, 1, PixelFormat::Gray8, vec![0, 0]).unwrap();
        sinks.present(&frame).unwrap();
        assert!(!sinks.should_close());
        assert!(!sinks.is_interactive());
        sinks.finish().unwrap();
    }
}

//! GStreamer-based video file decoding into RGBA frames

use std::path::Path;

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info};

use crate::media::source::FrameSource;
use crate::media::{Frame, PixelFormat};

/// Decodes a video file with `decodebin`, converted to RGBA on the way out
pub struct GstVideoSource {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    width: u32,
    height: u32,
    fps: Option<f64>,
    sequence: u64,
}

impl GstVideoSource {
    pub fn open(path: &Path, fps_override: Option<f64>) -> Result<Self> {
        gst::init().map_err(|e| eyre!("Failed to initialize GStreamer: {}", e))?;

        let pipeline_str = format!(
            "filesrc location=\"{}\" ! decodebin ! videoconvert ! \
             video/x-raw,format=RGBA ! \
             appsink name=appsink",
            path.display()
        );
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| eyre!("Failed to create pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| eyre!("Failed to find appsink element"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| eyre!("Failed to cast to AppSink"))?;

        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 3u32);
        appsink.set_property("sync", false); // The publisher paces frames itself

        // Preroll to learn the negotiated size and rate
        pipeline
            .set_state(gst::State::Paused)
            .map_err(|e| eyre!("Failed to preroll pipeline: {:?}", e))?;
        let preroll = appsink
            .pull_preroll()
            .map_err(|_| eyre!("Failed to preroll {}", path.display()))?;
        let caps = preroll
            .caps()
            .ok_or_else(|| eyre!("Preroll sample has no caps"))?;
        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| eyre!("Failed to parse video info from caps"))?;

        let rate = video_info.fps();
        let native_fps = (rate.numer() > 0 && rate.denom() > 0)
            .then(|| rate.numer() as f64 / rate.denom() as f64);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| eyre!("Failed to start pipeline: {:?}", e))?;

        info!(
            "Decoding {} at {}x{} ({:?} fps)",
            path.display(),
            video_info.width(),
            video_info.height(),
            native_fps
        );

        Ok(Self {
            pipeline,
            appsink,
            width: video_info.width(),
            height: video_info.height(),
            fps: fps_override.or(native_fps),
            sequence: 0,
        })
    }
}

impl FrameSource for GstVideoSource {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn frame_count(&self) -> Option<u32> {
        let duration = self.pipeline.query_duration::<gst::ClockTime>()?;
        let fps = self.fps?;
        Some((duration.seconds_f64() * fps).round() as u32)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(sample) = self
            .appsink
            .try_pull_sample(gst::ClockTime::from_seconds(5))
        else {
            if self.appsink.is_eos() {
                debug!("End of stream after {} frames", self.sequence);
                return Ok(None);
            }
            return Err(eyre!("Timed out pulling a decoded frame"));
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| eyre!("Sample contains no buffer"))?;
        let caps = sample.caps().ok_or_else(|| eyre!("Sample has no caps"))?;
        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| eyre!("Failed to parse video info from caps"))?;

        let map = buffer
            .map_readable()
            .map_err(|_| eyre!("Failed to map buffer"))?;
        let data = Bytes::copy_from_slice(map.as_slice());

        let stride = video_info.stride()[0] as usize;
        let mut frame = Frame::strided(
            video_info.width(),
            video_info.height(),
            stride,
            PixelFormat::Rgba32,
            data,
        )?
        .with_sequence(self.sequence);
        if let Some(pts) = buffer.pts() {
            frame = frame.with_source_timestamp(pts.into());
        }

        self.sequence += 1;
        Ok(Some(frame))
    }

    fn rewind(&mut self) -> Result<()> {
        self.pipeline
            .seek_simple(
                gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT,
                gst::ClockTime::ZERO,
            )
            .map_err(|e| eyre!("Failed to rewind: {}", e))?;
        self.sequence = 0;
        Ok(())
    }
}

impl Drop for GstVideoSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

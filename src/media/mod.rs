pub mod convert;
pub mod frame;
pub mod source;

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_source;

pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use source::{load_image, open_video, FrameSource, ImageSequenceSource};

//! Output backends for displaying processed video.

mod preview;

pub use preview::PreviewWindow;

use crate::frame::VideoFrame;
use anyhow::Result;

/// Trait for video output backends.
pub trait OutputBackend {
    /// Write a frame to the output.
    fn write_frame(&mut self, frame: &VideoFrame) -> Result<()>;
}

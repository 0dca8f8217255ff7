//! Frame sources for the face tracker: webcam capture and still images.

mod nokhwa_backend;

pub use nokhwa_backend::NokhwaCapture;

use crate::frame::{PixelFormat, VideoFrame};
use crate::tracking::FrameSource;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Trait for webcam capture backends.
pub trait CaptureBackend {
    /// Returns a list of available camera devices.
    fn list_devices() -> Result<Vec<CameraInfo>>
    where
        Self: Sized;

    /// Opens the camera with the specified configuration.
    fn open(config: CaptureConfig) -> Result<Self>
    where
        Self: Sized;

    /// Captures a single frame from the camera.
    fn capture_frame(&mut self) -> Result<VideoFrame>;

    /// Returns the current frame dimensions.
    fn frame_size(&self) -> (u32, u32);
}

/// Information about a camera device.
#[derive(Debug, Clone)]
pub struct CameraInfo {
    /// Device index
    pub index: u32,
    /// Human-readable name
    pub name: String,
}

/// Configuration for camera capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Camera device index
    pub device_index: u32,
    /// Desired frame width
    pub width: u32,
    /// Desired frame height
    pub height: u32,
    /// Desired frame rate
    pub fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

/// Upper bound on one blocking wait for the camera thread.
const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// Camera capture on its own thread. The device is opened on that thread,
/// frames arrive through a small channel.
pub struct AsyncCapture {
    rx: Receiver<Result<VideoFrame>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AsyncCapture {
    pub fn new(config: CaptureConfig) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(2);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let thread = thread::Builder::new()
            .name("camera".to_string())
            .spawn(move || {
                let mut camera = match NokhwaCapture::open(config) {
                    Ok(camera) => camera,
                    Err(e) => {
                        error!("Failed to open camera: {}", e);
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                while !thread_stop.load(Ordering::SeqCst) {
                    if tx.send(camera.capture_frame()).is_err() {
                        break;
                    }
                }
                info!("Camera thread exiting");
            })?;

        Ok(Self {
            rx,
            stop,
            thread: Some(thread),
        })
    }
}

impl FrameSource for AsyncCapture {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        match self.rx.recv_timeout(FRAME_TIMEOUT) {
            Ok(frame) => frame.map(Some),
            Err(RecvTimeoutError::Timeout) => Err(anyhow!("no frame from camera within {:?}", FRAME_TIMEOUT)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

impl Drop for AsyncCapture {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Unblock a pending send so the thread sees the flag.
        while self.rx.try_recv().is_ok() {}
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Replays one image at a fixed rate, optionally a limited number of times.
pub struct ImageSource {
    frame: VideoFrame,
    interval: Duration,
    remaining: Option<u64>,
    next_due: Option<Instant>,
}

impl ImageSource {
    pub fn new(frame: VideoFrame, fps: u32, limit: Option<u64>) -> Self {
        Self {
            frame,
            interval: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            remaining: limit,
            next_due: None,
        }
    }

    pub fn open(path: &Path, fps: u32, limit: Option<u64>) -> Result<Self> {
        let image = image::open(path).with_context(|| format!("Failed to open input image {:?}", path))?;
        let rgba = image.to_rgba8();
        info!("Using still image {:?} ({}x{})", path, rgba.width(), rgba.height());
        let frame = VideoFrame::from_data(rgba.width(), rgba.height(), PixelFormat::Rgba, rgba.into_raw());
        Ok(Self::new(frame, fps, limit))
    }
}

impl FrameSource for ImageSource {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>> {
        match self.remaining.as_mut() {
            Some(0) => return Ok(None),
            Some(n) => *n -= 1,
            None => {}
        }
        if let Some(due) = self.next_due {
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + self.interval);
        Ok(Some(self.frame.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_source_honours_limit() {
        let mut source = ImageSource::new(VideoFrame::solid(2, 2, [1, 2, 3, 255]), 1000, Some(2));
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn image_source_paces_frames() {
        let mut source = ImageSource::new(VideoFrame::solid(1, 1, [0, 0, 0, 255]), 50, None);
        let start = Instant::now();
        for _ in 0..3 {
            source.next_frame().unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn capture_config_defaults_fill_gaps() {
        let config: CaptureConfig = serde_yaml::from_str("width: 640\nheight: 480\n").unwrap();
        assert_eq!(config.fps, 30);
        assert_eq!(config.device_index, 0);
    }
}

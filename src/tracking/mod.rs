//! Face tracking adapter: pulls frames from a source, runs the landmark
//! detector and hands results to a sink on a dedicated capture thread.

mod onnx;

pub use onnx::{DetectorConfig, OnnxLandmarkDetector};

use crate::error::EffectError;
use crate::frame::VideoFrame;
use crate::landmark::Landmark;
use crate::utils::lock;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause before retrying after a capture error.
const CAPTURE_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    Stopped,
    Starting,
    Running,
}

/// Produces frames for the capture loop. `Ok(None)` ends the stream.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>>;
}

/// The external face-landmark model. Returns one landmark list per face.
pub trait LandmarkDetector: Send {
    fn detect(&mut self, frame: &VideoFrame) -> Result<Vec<Vec<Landmark>>>;
}

/// Receives every processed frame. `landmarks` is empty when no face was found.
pub trait ResultSink: Send + Sync {
    fn on_results(&self, landmarks: &[Landmark], frame: &VideoFrame);
}

/// Detector for runs without a model: never finds a face.
pub struct NoFaceDetector;

impl LandmarkDetector for NoFaceDetector {
    fn detect(&mut self, _frame: &VideoFrame) -> Result<Vec<Vec<Landmark>>> {
        Ok(Vec::new())
    }
}

/// What the capture thread owns while running and hands back on exit.
struct LoopParts {
    source: Box<dyn FrameSource>,
    detector: Box<dyn LandmarkDetector>,
}

pub struct FaceTracker {
    parts: Option<LoopParts>,
    sink: Arc<dyn ResultSink>,
    state: Arc<Mutex<TrackingState>>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<LoopParts>>,
}

impl FaceTracker {
    pub fn new(source: Box<dyn FrameSource>, detector: Box<dyn LandmarkDetector>, sink: Arc<dyn ResultSink>) -> Self {
        Self {
            parts: Some(LoopParts { source, detector }),
            sink,
            state: Arc::new(Mutex::new(TrackingState::Stopped)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn state(&self) -> TrackingState {
        *lock(&self.state)
    }

    /// Starts the capture loop. Does nothing unless the tracker is stopped.
    pub fn initialize(&mut self) -> Result<(), EffectError> {
        if self.state() != TrackingState::Stopped {
            return Ok(());
        }
        // A loop that ended on its own still holds the parts.
        self.reclaim();
        let parts = self
            .parts
            .take()
            .ok_or_else(|| EffectError::TrackerUnavailable("capture loop did not shut down cleanly".to_string()))?;

        *lock(&self.state) = TrackingState::Starting;
        self.stop_flag.store(false, Ordering::SeqCst);

        let sink = self.sink.clone();
        let state = self.state.clone();
        let stop_flag = self.stop_flag.clone();
        let spawned = thread::Builder::new()
            .name("face-tracker".to_string())
            .spawn(move || capture_loop(parts, sink, state, stop_flag));

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                info!("Face tracker started");
                Ok(())
            }
            Err(e) => {
                *lock(&self.state) = TrackingState::Stopped;
                Err(EffectError::TrackerUnavailable(e.to_string()))
            }
        }
    }

    /// Halts the capture loop. Safe from any state and from the sink itself.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        *lock(&self.state) = TrackingState::Stopped;
        let on_capture_thread = self
            .thread
            .as_ref()
            .is_some_and(|handle| handle.thread().id() == thread::current().id());
        if !on_capture_thread {
            self.reclaim();
        }
        info!("Face tracker stopped");
    }

    /// Blocks until the capture loop exits on its own, e.g. at end of stream.
    pub fn wait(&mut self) {
        self.reclaim();
        *lock(&self.state) = TrackingState::Stopped;
    }

    fn reclaim(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        match handle.join() {
            Ok(parts) => self.parts = Some(parts),
            Err(_) => warn!("Capture loop panicked; tracker cannot restart"),
        }
    }
}

impl Drop for FaceTracker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

fn capture_loop(
    mut parts: LoopParts,
    sink: Arc<dyn ResultSink>,
    state: Arc<Mutex<TrackingState>>,
    stop_flag: Arc<AtomicBool>,
) -> LoopParts {
    let mut frames: u64 = 0;
    while !stop_flag.load(Ordering::SeqCst) {
        let frame = match parts.source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Frame source ended after {} frames", frames);
                break;
            }
            Err(e) => {
                warn!("Capture failed: {}", e);
                thread::sleep(CAPTURE_BACKOFF);
                continue;
            }
        };

        {
            let mut state = lock(&state);
            if *state == TrackingState::Starting {
                *state = TrackingState::Running;
            }
        }

        let faces = parts.detector.detect(&frame).unwrap_or_else(|e| {
            warn!("Landmark detection failed: {}", e);
            Vec::new()
        });
        let landmarks = faces.into_iter().next().unwrap_or_default();

        if stop_flag.load(Ordering::SeqCst) {
            break;
        }
        sink.on_results(&landmarks, &frame);
        frames += 1;
        debug!(frame = frames, faces = !landmarks.is_empty(), "Frame processed");
    }

    *lock(&state) = TrackingState::Stopped;
    parts
}

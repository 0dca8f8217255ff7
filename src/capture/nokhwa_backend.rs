//! Nokhwa-based webcam capture backend.

use super::{CameraInfo, CaptureBackend, CaptureConfig};
use crate::frame::{PixelFormat, VideoFrame};
use anyhow::Result;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;

/// Webcam capture using the nokhwa library.
pub struct NokhwaCapture {
    camera: Camera,
    width: u32,
    height: u32,
}

/// Frame formats in order of preference. Built-in macOS cameras do not offer
/// MJPEG, USB webcams usually do.
const FORMATS: [FrameFormat; 3] = [FrameFormat::NV12, FrameFormat::YUYV, FrameFormat::MJPEG];

/// Scores how well `format` matches the request. Higher is better.
fn format_score(format: &CameraFormat, config: &CaptureConfig) -> i64 {
    let requested_pixels = config.width as i64 * config.height as i64;
    let pixels = format.width() as i64 * format.height() as i64;
    let mut score = -(pixels - requested_pixels).abs();
    score -= (format.frame_rate() as i64 - config.fps as i64).abs() * 1000;
    score += match format.format() {
        FrameFormat::NV12 => 30,
        FrameFormat::YUYV => 20,
        FrameFormat::MJPEG => 10,
        _ => 0,
    };
    score
}

impl CaptureBackend for NokhwaCapture {
    fn list_devices() -> Result<Vec<CameraInfo>> {
        let devices = nokhwa::query(nokhwa::utils::ApiBackend::Auto)?;
        Ok(devices
            .into_iter()
            .map(|d| CameraInfo {
                index: d.index().as_index().unwrap_or(0),
                name: d.human_name().to_string(),
            })
            .collect())
    }

    fn open(config: CaptureConfig) -> Result<Self> {
        // Some drivers reject a "closest" request whose hint is far from
        // anything they support, so try the request first, then common modes.
        let mut seeds: Vec<CameraFormat> = FORMATS
            .iter()
            .map(|&f| CameraFormat::new(Resolution::new(config.width, config.height), f, config.fps))
            .collect();
        for (width, height) in [(1280, 720), (640, 480)] {
            for &f in &FORMATS {
                seeds.push(CameraFormat::new(Resolution::new(width, height), f, 30));
            }
        }

        let mut opened = None;
        for seed in seeds {
            let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(seed));
            if let Ok(mut cam) = Camera::new(CameraIndex::Index(config.device_index), requested) {
                // Creating the camera is not enough for some drivers.
                if cam.open_stream().is_ok() {
                    tracing::info!("Verified connection with seed format: {:?}", seed);
                    opened = Some((cam, seed));
                    break;
                }
            }
        }

        let (mut camera, seed) = opened.ok_or_else(|| {
            anyhow::anyhow!(
                "Could not connect to and open stream on camera index {} with any standard format.",
                config.device_index
            )
        })?;

        // Switch to the supported mode closest to the request, if it differs.
        if let Ok(supported) = camera.compatible_camera_formats() {
            let best = supported.iter().max_by_key(|f| format_score(f, &config)).copied();
            match best {
                Some(best) if best != seed => {
                    tracing::info!("Switching to closest supported format: {:?}", best);
                    let _ = camera.stop_stream();
                    let switched = camera
                        .set_camera_requset(RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(best)))
                        .is_ok()
                        && camera.open_stream().is_ok();
                    if !switched {
                        tracing::warn!("Failed to open stream with {:?}, falling back to seed format", best);
                        let _ = camera
                            .set_camera_requset(RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(seed)));
                        camera.open_stream()?;
                    }
                }
                Some(_) => {}
                None => tracing::warn!("Device reported empty supported formats list. Using seed format."),
            }
        }

        let resolution = camera.resolution();
        tracing::info!("Camera opened with resolution: {}", resolution);

        Ok(Self {
            camera,
            width: resolution.width(),
            height: resolution.height(),
        })
    }

    fn capture_frame(&mut self) -> Result<VideoFrame> {
        let frame = self.camera.frame()?;
        let decoded = frame.decode_image::<RgbFormat>()?;
        let (width, height) = (decoded.width(), decoded.height());
        let mut captured = VideoFrame::from_data(width, height, PixelFormat::Rgb, decoded.into_raw());
        captured.timestamp_us = Some(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_micros() as u64)
                .unwrap_or(0),
        );
        Ok(captured)
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

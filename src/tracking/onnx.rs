//! Face-mesh landmark model through ONNX Runtime.

use super::LandmarkDetector;
use crate::frame::VideoFrame;
use crate::landmark::{Landmark, FACE_MESH_POINTS};
use anyhow::{anyhow, bail, Result};
use image::{imageops::FilterType, DynamicImage, ImageBuffer, Rgba};
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

/// Model file and tensor names. Defaults match the 192x192 face-mesh model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub model: PathBuf,
    pub input_size: u32,
    pub input_name: String,
    pub landmarks_output: String,
    pub score_output: String,
    /// Faces scoring below this are dropped.
    pub min_confidence: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::from("models/face_landmark.onnx"),
            input_size: 192,
            input_name: "input_1".to_string(),
            landmarks_output: "conv2d_21".to_string(),
            score_output: "conv2d_31".to_string(),
            min_confidence: 0.5,
        }
    }
}

/// Letterbox placement of the frame inside the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    x_offset: u32,
    y_offset: u32,
    width: u32,
    height: u32,
}

impl Letterbox {
    fn fit(frame_width: u32, frame_height: u32, size: u32) -> Self {
        let scale = (size as f32 / frame_width as f32).min(size as f32 / frame_height as f32);
        let width = ((frame_width as f32 * scale).round() as u32).clamp(1, size);
        let height = ((frame_height as f32 * scale).round() as u32).clamp(1, size);
        Self {
            scale,
            x_offset: (size - width) / 2,
            y_offset: (size - height) / 2,
            width,
            height,
        }
    }

    /// Maps a point in model input pixels to normalized frame coordinates.
    fn to_frame(&self, x: f32, y: f32, z: f32, frame_width: u32, frame_height: u32) -> Landmark {
        Landmark::new(
            (x - self.x_offset as f32) / self.scale / frame_width as f32,
            (y - self.y_offset as f32) / self.scale / frame_height as f32,
            z / self.scale / frame_width as f32,
        )
    }
}

/// Single-face landmark detector.
pub struct OnnxLandmarkDetector {
    session: Session,
    config: DetectorConfig,
}

impl OnnxLandmarkDetector {
    /// Initialize the ONNX Runtime environment. Call once at startup.
    pub fn init() -> Result<()> {
        ort::init().with_name("facefx").commit();
        Ok(())
    }

    /// Loads the model. Returns `None` when the model file is missing.
    pub fn new(config: DetectorConfig) -> Result<Option<Self>> {
        if !config.model.exists() {
            return Ok(None);
        }

        info!("Loading face landmark model from {:?}", config.model);
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&config.model)?;

        Ok(Some(Self { session, config }))
    }

    fn input_tensor(&self, frame: &VideoFrame) -> Result<(Array4<f32>, Letterbox)> {
        let size = self.config.input_size;
        let rgba = frame.as_rgba();
        let buffer = ImageBuffer::<Rgba<u8>, _>::from_raw(rgba.width, rgba.height, rgba.data.clone())
            .ok_or_else(|| anyhow!("Failed to create image buffer"))?;
        let image = DynamicImage::ImageRgba8(buffer);

        let letterbox = Letterbox::fit(frame.width, frame.height, size);
        let resized = image.resize_exact(letterbox.width, letterbox.height, FilterType::Triangle);
        let mut padded = ImageBuffer::from_pixel(size, size, Rgba([0, 0, 0, 255]));
        image::imageops::overlay(&mut padded, &resized, letterbox.x_offset as i64, letterbox.y_offset as i64);

        // NHWC, channels in [0, 1].
        let mut tensor = Array4::<f32>::zeros((1, size as usize, size as usize, 3));
        for (x, y, pixel) in padded.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
            }
        }
        Ok((tensor, letterbox))
    }
}

impl LandmarkDetector for OnnxLandmarkDetector {
    fn detect(&mut self, frame: &VideoFrame) -> Result<Vec<Vec<Landmark>>> {
        if frame.width == 0 || frame.height == 0 {
            return Ok(Vec::new());
        }
        let (tensor, letterbox) = self.input_tensor(frame)?;

        let shape = tensor.shape().iter().map(|&x| x as i64).collect::<Vec<_>>();
        let input_value = Value::from_array((shape, tensor.into_raw_vec()))?;
        let inputs = ort::inputs![self.config.input_name.as_str() => &input_value];
        let outputs = self.session.run(inputs)?;

        let (_, score) = outputs[self.config.score_output.as_str()].try_extract_tensor::<f32>()?;
        let confidence = score.first().map(|&logit| sigmoid(logit)).unwrap_or(0.0);
        if confidence < self.config.min_confidence {
            debug!(confidence, "No face");
            return Ok(Vec::new());
        }

        let (_, points) = outputs[self.config.landmarks_output.as_str()].try_extract_tensor::<f32>()?;
        if points.len() < FACE_MESH_POINTS * 3 {
            bail!("expected {} landmark values, got {}", FACE_MESH_POINTS * 3, points.len());
        }
        let landmarks = points
            .chunks_exact(3)
            .take(FACE_MESH_POINTS)
            .map(|p| letterbox.to_frame(p[0], p[1], p[2], frame.width, frame.height))
            .collect();
        Ok(vec![landmarks])
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letterbox_centers_wide_frames() {
        let letterbox = Letterbox::fit(640, 480, 192);
        assert_eq!((letterbox.width, letterbox.height), (192, 144));
        assert_eq!((letterbox.x_offset, letterbox.y_offset), (0, 24));
    }

    #[test]
    fn letterbox_maps_back_to_frame() {
        let letterbox = Letterbox::fit(640, 480, 192);
        let center = letterbox.to_frame(96.0, 96.0, 0.0, 640, 480);
        assert!((center.x - 0.5).abs() < 1e-5);
        assert!((center.y - 0.5).abs() < 1e-5);
        let corner = letterbox.to_frame(0.0, 24.0, 0.0, 640, 480);
        assert!(corner.x.abs() < 1e-5 && corner.y.abs() < 1e-5);
    }

    #[test]
    fn missing_model_is_not_an_error() {
        let config = DetectorConfig {
            model: PathBuf::from("does/not/exist.onnx"),
            ..Default::default()
        };
        assert!(OnnxLandmarkDetector::new(config).unwrap().is_none());
    }

    #[test]
    fn sigmoid_midpoint() {
        assert_eq!(sigmoid(0.0), 0.5);
    }
}

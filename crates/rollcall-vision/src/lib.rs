//! rollcall-vision: ONNX Runtime face model for the attendance scanner.
//!
//! Three networks run per frame: a single-face detector, a 68-point
//! landmark regressor (for the eye contours) and a 128-d descriptor network.
//! [`OnnxFaceModel`] chains them behind the [`rollcall_core::FaceModel`]
//! capability.

pub mod descriptor;
pub mod detector;
pub mod landmarks;
pub mod preprocess;

use rollcall_core::{Detection, FaceModel, FaceModelError};
use rollcall_hw::Frame;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use descriptor::DescriptorModel;
pub use detector::FaceDetector;
pub use landmarks::LandmarkModel;

pub const DETECTOR_FILE: &str = "det_10g.onnx";
pub const LANDMARK_FILE: &str = "landmarks_68.onnx";
pub const DESCRIPTOR_FILE: &str = "face_descriptor_128.onnx";

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("model file not found: {0} (place the ONNX models in the model directory)")]
    ModelNotFound(String),
    #[error("unexpected model layout: {0}")]
    UnexpectedModel(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Default model directory: `$XDG_DATA_HOME/rollcall/models`, falling back
/// to `~/.local/share/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}

/// Detector, landmark and descriptor networks chained into one face model.
pub struct OnnxFaceModel {
    detector: FaceDetector,
    landmarks: LandmarkModel,
    descriptor: DescriptorModel,
}

impl OnnxFaceModel {
    /// Load all three networks from `model_dir`. Fails if any file is missing.
    pub fn load(model_dir: &Path, min_confidence: f32) -> Result<Self, VisionError> {
        let model = Self {
            detector: FaceDetector::load(&model_dir.join(DETECTOR_FILE), min_confidence)?,
            landmarks: LandmarkModel::load(&model_dir.join(LANDMARK_FILE))?,
            descriptor: DescriptorModel::load(&model_dir.join(DESCRIPTOR_FILE))?,
        };
        tracing::info!(dir = %model_dir.display(), "face model ready");
        Ok(model)
    }

    fn run(&mut self, frame: &Frame) -> Result<Option<Detection>, VisionError> {
        let Some(candidate) = self.detector.detect(&frame.data, frame.width, frame.height)? else {
            return Ok(None);
        };
        let eyes = self
            .landmarks
            .eyes(&frame.data, frame.width, frame.height, &candidate.face)?;
        let embedding = self
            .descriptor
            .compute(&frame.data, frame.width, frame.height, &candidate.face)?;

        Ok(Some(Detection {
            confidence: candidate.confidence,
            face: candidate.face,
            eyes,
            embedding,
        }))
    }
}

impl FaceModel for OnnxFaceModel {
    type Frame = Frame;

    fn detect(&mut self, frame: &Frame) -> Result<Option<Detection>, FaceModelError> {
        if frame.data.len() < frame.width as usize * frame.height as usize {
            return Err(FaceModelError::InvalidFrame(format!(
                "{}x{} frame with {} bytes",
                frame.width,
                frame.height,
                frame.data.len()
            )));
        }
        self.run(frame)
            .map_err(|e| FaceModelError::Inference(e.to_string()))
    }
}

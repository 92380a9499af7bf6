//! Face descriptor network (ResNet-34, 128-d, 150x150 input).
//!
//! Descriptors are compared by Euclidean distance; two captures of the same
//! person typically land well under 0.6 apart.

use crate::preprocess::{self, Region};
use crate::VisionError;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::{Embedding, FaceBox};
use std::path::Path;

const INPUT_SIZE: usize = 150;
pub const DESCRIPTOR_DIM: usize = 128;
/// Per-channel training means (R, G, B). Grayscale input is replicated.
const CHANNEL_MEAN: [f32; 3] = [122.782, 117.001, 104.298];
const SCALE: f32 = 256.0;

pub struct DescriptorModel {
    session: Session,
}

impl DescriptorModel {
    pub fn load(model_path: &Path) -> Result<Self, VisionError> {
        if !model_path.exists() {
            return Err(VisionError::ModelNotFound(model_path.display().to_string()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        tracing::info!(path = %model_path.display(), dim = DESCRIPTOR_DIM, "descriptor model loaded");
        Ok(Self { session })
    }

    pub fn compute(&mut self, frame: &[u8], width: u32, height: u32, face: &FaceBox) -> Result<Embedding, VisionError> {
        let region = Region::around(face, 1.0);
        let crop = preprocess::crop_resize(frame, width as usize, height as usize, region, INPUT_SIZE, 0);
        let input = preprocess::to_nchw(&crop, INPUT_SIZE, CHANNEL_MEAN, SCALE);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| VisionError::Inference(format!("descriptor: {e}")))?;

        validate(raw.to_vec())
    }
}

fn validate(values: Vec<f32>) -> Result<Embedding, VisionError> {
    if values.len() != DESCRIPTOR_DIM {
        return Err(VisionError::Inference(format!(
            "expected {DESCRIPTOR_DIM}-dim descriptor, got {}",
            values.len()
        )));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(VisionError::Inference("descriptor contains non-finite values".into()));
    }
    Ok(Embedding::new(values))
}

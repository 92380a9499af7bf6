//! 68-point facial landmark regressor.
//!
//! The network sees a square crop around the detected face and returns 136
//! values: `(x, y)` pairs in iBUG-68 order, normalized to the crop.

use crate::preprocess::{self, Region};
use crate::VisionError;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::{EyeLandmarks, FaceBox, Point};
use std::ops::Range;
use std::path::Path;

const INPUT_SIZE: usize = 112;
const POINTS: usize = 68;
/// Crop margin around the detector box; the jawline sits outside tight boxes.
const CROP_SCALE: f32 = 1.2;
const LEFT_EYE: Range<usize> = 36..42;
const RIGHT_EYE: Range<usize> = 42..48;

pub struct LandmarkModel {
    session: Session,
}

impl LandmarkModel {
    pub fn load(model_path: &Path) -> Result<Self, VisionError> {
        if !model_path.exists() {
            return Err(VisionError::ModelNotFound(model_path.display().to_string()));
        }
        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;
        tracing::info!(path = %model_path.display(), "landmark model loaded");
        Ok(Self { session })
    }

    /// Regress landmarks for `face` and return both eye contours in frame
    /// coordinates.
    pub fn eyes(&mut self, frame: &[u8], width: u32, height: u32, face: &FaceBox) -> Result<EyeLandmarks, VisionError> {
        let region = Region::around(face, CROP_SCALE);
        let crop = preprocess::crop_resize(frame, width as usize, height as usize, region, INPUT_SIZE, 0);
        let input = preprocess::to_nchw(&crop, INPUT_SIZE, [0.0; 3], 255.0);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| VisionError::Inference(format!("landmarks: {e}")))?;

        eyes_from_raw(raw, &region)
    }
}

fn eyes_from_raw(raw: &[f32], region: &Region) -> Result<EyeLandmarks, VisionError> {
    if raw.len() < POINTS * 2 {
        return Err(VisionError::Inference(format!(
            "expected {} landmark values, got {}",
            POINTS * 2,
            raw.len()
        )));
    }
    let point = |i: usize| {
        let (x, y) = region.to_frame(raw[i * 2], raw[i * 2 + 1]);
        Point::new(x, y)
    };
    Ok(EyeLandmarks {
        left: LEFT_EYE.map(point).collect(),
        right: RIGHT_EYE.map(point).collect(),
    })
}

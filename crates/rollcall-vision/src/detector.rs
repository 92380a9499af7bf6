//! Single-face detector (SCRFD, anchor-free, three strides).
//!
//! Only the most confident face is of interest at an attendance kiosk, so
//! decoding keeps a running maximum instead of collecting candidates for NMS.

use crate::preprocess::{self, Letterbox};
use crate::VisionError;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::FaceBox;
use std::path::Path;

const INPUT_SIZE: usize = 640;
const MEAN: f32 = 127.5;
const STD: f32 = 128.0;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;

/// Best face found in a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceCandidate {
    pub face: FaceBox,
    pub confidence: f32,
}

pub struct FaceDetector {
    session: Session,
    /// `(score, bbox)` output indices per stride.
    outputs: [(usize, usize); 3],
    min_confidence: f32,
}

impl FaceDetector {
    pub fn load(model_path: &Path, min_confidence: f32) -> Result<Self, VisionError> {
        if !model_path.exists() {
            return Err(VisionError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 6 {
            return Err(VisionError::UnexpectedModel(format!(
                "face detector needs score and bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }
        let outputs = output_layout(&names);
        tracing::info!(path = %model_path.display(), ?outputs, "face detector loaded");

        Ok(Self {
            session,
            outputs,
            min_confidence,
        })
    }

    /// Highest-confidence face above the configured minimum, if any.
    pub fn detect(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Option<FaceCandidate>, VisionError> {
        let (width, height) = (width as usize, height as usize);
        let letterbox = Letterbox::fit(width, height, INPUT_SIZE);
        let input: Array4<f32> = {
            let square = preprocess::crop_resize(
                frame,
                width,
                height,
                letterbox.region(INPUT_SIZE),
                INPUT_SIZE,
                MEAN as u8,
            );
            preprocess::to_nchw(&square, INPUT_SIZE, [MEAN; 3], STD)
        };

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut best: Option<FaceCandidate> = None;
        for (level, &stride) in STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.outputs[level];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| VisionError::Inference(format!("scores, stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| VisionError::Inference(format!("bboxes, stride {stride}: {e}")))?;

            if let Some(candidate) = best_in_stride(scores, bboxes, stride, &letterbox, self.min_confidence) {
                if best.map_or(true, |b| candidate.confidence > b.confidence) {
                    best = Some(candidate);
                }
            }
        }

        Ok(best)
    }
}

/// Map strides to output tensors. Exports either name them `score_8`,
/// `bbox_8`, ... or use the insightface positional order
/// `[scores 8/16/32, bboxes 8/16/32, kps 8/16/32]`.
fn output_layout(names: &[String]) -> [(usize, usize); 3] {
    let find = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut layout = [(0, 3), (1, 4), (2, 5)];
    for (slot, &stride) in STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(score), Some(bbox)) => layout[slot] = (score, bbox),
            _ => {
                tracing::debug!(?names, "detector outputs not named by stride; using positional layout");
                return [(0, 3), (1, 4), (2, 5)];
            }
        }
    }
    layout
}

fn best_in_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    min_confidence: f32,
) -> Option<FaceCandidate> {
    let grid_w = INPUT_SIZE / stride;
    let anchors = (INPUT_SIZE / stride) * grid_w * ANCHORS_PER_CELL;

    let (idx, score) = scores
        .iter()
        .take(anchors)
        .copied()
        .enumerate()
        .filter(|&(i, s)| s > min_confidence && i * 4 + 3 < bboxes.len())
        .fold(None, |best: Option<(usize, f32)>, (i, s)| match best {
            Some((_, b)) if b >= s => best,
            _ => Some((i, s)),
        })?;

    let cell = idx / ANCHORS_PER_CELL;
    let cx = ((cell % grid_w) * stride) as f32;
    let cy = ((cell / grid_w) * stride) as f32;
    let s = stride as f32;
    let d = &bboxes[idx * 4..idx * 4 + 4];

    let (x1, y1) = letterbox.unmap(cx - d[0] * s, cy - d[1] * s);
    let (x2, y2) = letterbox.unmap(cx + d[2] * s, cy + d[3] * s);

    Some(FaceCandidate {
        face: FaceBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        },
        confidence: score,
    })
}

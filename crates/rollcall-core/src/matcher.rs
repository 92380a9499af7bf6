use crate::types::{Embedding, Gallery, LabeledDescriptor};

pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Outcome of comparing a live descriptor against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// Best label is strictly closer than the threshold.
    Matched { label: String, distance: f32 },
    /// Nearest label (if any) is at or beyond the threshold.
    Unknown { distance: f32 },
}

impl MatchOutcome {
    pub fn distance(&self) -> f32 {
        match self {
            Self::Matched { distance, .. } | Self::Unknown { distance } => *distance,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Matched { label, .. } => Some(label),
            Self::Unknown { .. } => None,
        }
    }
}

/// Strategy for picking the best gallery label for a probe descriptor.
pub trait Matcher {
    fn best_match(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchOutcome;
}

/// Minimum Euclidean distance matcher.
///
/// A label's distance is the mean distance to each of its reference
/// descriptors. The earliest label wins ties, so the result depends only on
/// the probe and the gallery order.
pub struct EuclideanMatcher;

impl EuclideanMatcher {
    fn label_distance(probe: &Embedding, labeled: &LabeledDescriptor) -> f32 {
        if labeled.descriptors.is_empty() {
            return f32::INFINITY;
        }
        let total: f32 = labeled
            .descriptors
            .iter()
            .map(|reference| probe.euclidean_distance(reference))
            .sum();
        total / labeled.descriptors.len() as f32
    }
}

impl Matcher for EuclideanMatcher {
    fn best_match(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchOutcome {
        let mut best_distance = f32::INFINITY;
        let mut best: Option<&LabeledDescriptor> = None;

        for labeled in gallery.labeled() {
            let distance = Self::label_distance(probe, labeled);
            if distance < best_distance {
                best_distance = distance;
                best = Some(labeled);
            }
        }

        tracing::debug!(
            nearest = best.map(|l| l.label.as_str()),
            distance = best_distance,
            threshold,
            labels = gallery.len(),
            "gallery compared"
        );

        match best {
            Some(labeled) if best_distance < threshold => MatchOutcome::Matched {
                label: labeled.label.clone(),
                distance: best_distance,
            },
            _ => MatchOutcome::Unknown {
                distance: best_distance,
            },
        }
    }
}

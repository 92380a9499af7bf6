//! Blink liveness gate based on the Eye Aspect Ratio (EAR).
//!
//! A printed photo held up to the camera never blinks. The gate watches the
//! EAR of both eyes across ticks and opens once it dips below the blink
//! threshold. The open state is remembered until a match attempt fails, the
//! session ends, or the blink goes stale.

use crate::types::{EyeLandmarks, Point};
use std::time::{Duration, Instant};

/// EAR reported for unusable landmark data. Reads as "eyes open" so bad
/// landmarks never count as a blink.
pub const FALLBACK_EAR: f32 = 0.5;

pub const DEFAULT_BLINK_THRESHOLD: f32 = 0.30;

/// Eye aspect ratio for one six-point eye contour:
///
/// ```text
/// EAR = (|p2 - p6| + |p3 - p5|) / (2 * |p1 - p4|)
/// ```
///
/// Returns `None` for fewer than six points or a contour with no horizontal
/// extent.
pub fn eye_aspect_ratio(eye: &[Point]) -> Option<f32> {
    if eye.len() < 6 {
        return None;
    }
    let vertical_a = eye[1].distance(&eye[5]);
    let vertical_b = eye[2].distance(&eye[4]);
    let horizontal = eye[0].distance(&eye[3]);
    if horizontal <= f32::EPSILON {
        return None;
    }
    Some((vertical_a + vertical_b) / (2.0 * horizontal))
}

/// Mean EAR of both eyes, or [`FALLBACK_EAR`] if either eye is degenerate.
pub fn combined_ear(eyes: &EyeLandmarks) -> f32 {
    match (eye_aspect_ratio(&eyes.left), eye_aspect_ratio(&eyes.right)) {
        (Some(left), Some(right)) => (left + right) / 2.0,
        _ => {
            tracing::debug!(
                left_points = eyes.left.len(),
                right_points = eyes.right.len(),
                "degenerate eye landmarks; using fallback EAR"
            );
            FALLBACK_EAR
        }
    }
}

/// Per-session liveness flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Liveness {
    blink_at: Option<Instant>,
}

impl Liveness {
    pub fn blink_observed(&self) -> bool {
        self.blink_at.is_some()
    }

    pub fn blink_at(&self) -> Option<Instant> {
        self.blink_at
    }

    pub fn reset(&mut self) {
        self.blink_at = None;
    }
}

/// Result of feeding one tick's EAR through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// A blink was already observed on an earlier tick.
    Passed,
    /// The flag flipped to true on this tick.
    Blinked,
    /// No blink yet; matching must not be attempted.
    AwaitingBlink,
}

impl Gate {
    pub fn is_open(&self) -> bool {
        !matches!(self, Gate::AwaitingBlink)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessGate {
    pub threshold: f32,
    /// A blink older than this no longer counts. `None` keeps it forever.
    pub blink_timeout: Option<Duration>,
}

impl Default for LivenessGate {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_BLINK_THRESHOLD,
            blink_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl LivenessGate {
    pub fn observe(&self, state: &mut Liveness, ear: f32, now: Instant) -> Gate {
        if let Some(at) = state.blink_at {
            if !self.is_stale(at, now) {
                return Gate::Passed;
            }
            tracing::debug!(
                age_ms = now.saturating_duration_since(at).as_millis() as u64,
                "blink expired; liveness reset"
            );
            state.reset();
        }

        if ear < self.threshold {
            state.blink_at = Some(now);
            Gate::Blinked
        } else {
            Gate::AwaitingBlink
        }
    }

    fn is_stale(&self, blink_at: Instant, now: Instant) -> bool {
        match self.blink_timeout {
            Some(timeout) => now.saturating_duration_since(blink_at) > timeout,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Six points on a horizontal ellipse with semi-axes `a` (x) and `b` (y),
    /// ordered p1 (left corner), p2, p3 (upper lid), p4 (right corner),
    /// p5, p6 (lower lid).
    fn ellipse_eye(cx: f32, cy: f32, a: f32, b: f32) -> Vec<Point> {
        let h = b * (3.0f32).sqrt() / 2.0;
        vec![
            Point::new(cx - a, cy),
            Point::new(cx - a / 2.0, cy - h),
            Point::new(cx + a / 2.0, cy - h),
            Point::new(cx + a, cy),
            Point::new(cx + a / 2.0, cy + h),
            Point::new(cx - a / 2.0, cy + h),
        ]
    }

    fn eyes(b_over_a: f32) -> EyeLandmarks {
        EyeLandmarks {
            left: ellipse_eye(100.0, 80.0, 20.0, 20.0 * b_over_a),
            right: ellipse_eye(160.0, 80.0, 20.0, 20.0 * b_over_a),
        }
    }

    #[test]
    fn test_ear_matches_closed_form_for_ellipse() {
        // Points at x = ±a/2 sit at y = ±b·√3/2, so EAR = (√3/2)·(b/a).
        for ratio in [0.1f32, 0.25, 0.4, 0.6, 1.0] {
            let eye = ellipse_eye(0.0, 0.0, 30.0, 30.0 * ratio);
            let expected = (3.0f32).sqrt() / 2.0 * ratio;
            let ear = eye_aspect_ratio(&eye).unwrap();
            assert!((ear - expected).abs() < 1e-5, "ratio {ratio}: got {ear}, expected {expected}");
        }
    }

    #[test]
    fn test_combined_ear_averages_both_eyes() {
        let landmarks = EyeLandmarks {
            left: ellipse_eye(0.0, 0.0, 10.0, 2.0),
            right: ellipse_eye(50.0, 0.0, 10.0, 6.0),
        };
        let expected = (3.0f32).sqrt() / 2.0 * (0.2 + 0.6) / 2.0;
        assert!((combined_ear(&landmarks) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_degenerate_landmarks_use_fallback() {
        let full = ellipse_eye(0.0, 0.0, 10.0, 1.0);
        let cases = [
            EyeLandmarks::default(),
            EyeLandmarks { left: full.clone(), right: vec![] },
            EyeLandmarks { left: vec![], right: full.clone() },
            EyeLandmarks { left: full[..5].to_vec(), right: full.clone() },
            EyeLandmarks { left: full.clone(), right: vec![Point::new(1.0, 1.0); 6] },
        ];
        for eyes in &cases {
            assert_eq!(combined_ear(eyes), FALLBACK_EAR);
        }
    }

    #[test]
    fn test_gate_flips_once_on_first_blink() {
        let gate = LivenessGate { threshold: 0.3, blink_timeout: None };
        let mut state = Liveness::default();
        let t0 = Instant::now();

        let ears = [0.45, 0.41, 0.12, 0.05, 0.44, 0.10];
        let gates: Vec<Gate> = ears
            .iter()
            .enumerate()
            .map(|(i, &ear)| gate.observe(&mut state, ear, t0 + Duration::from_millis(500 * i as u64)))
            .collect();

        assert_eq!(
            gates,
            vec![
                Gate::AwaitingBlink,
                Gate::AwaitingBlink,
                Gate::Blinked,
                Gate::Passed,
                Gate::Passed,
                Gate::Passed,
            ]
        );
        assert_eq!(state.blink_at(), Some(t0 + Duration::from_millis(1000)));
    }

    #[test]
    fn test_gate_threshold_is_strict() {
        let gate = LivenessGate { threshold: 0.3, blink_timeout: None };
        let mut state = Liveness::default();
        assert_eq!(gate.observe(&mut state, 0.3, Instant::now()), Gate::AwaitingBlink);
        assert!(!state.blink_observed());
        assert_eq!(gate.observe(&mut state, 0.2999, Instant::now()), Gate::Blinked);
    }

    #[test]
    fn test_fallback_never_opens_gate() {
        let gate = LivenessGate::default();
        let mut state = Liveness::default();
        let ear = combined_ear(&EyeLandmarks::default());
        assert_eq!(gate.observe(&mut state, ear, Instant::now()), Gate::AwaitingBlink);
    }

    #[test]
    fn test_closed_eyes_open_gate() {
        let gate = LivenessGate::default();
        let mut state = Liveness::default();
        let now = Instant::now();
        assert_eq!(gate.observe(&mut state, combined_ear(&eyes(0.5)), now), Gate::AwaitingBlink);
        assert_eq!(gate.observe(&mut state, combined_ear(&eyes(0.1)), now), Gate::Blinked);
    }

    #[test]
    fn test_stale_blink_requires_new_blink() {
        let gate = LivenessGate { threshold: 0.3, blink_timeout: Some(Duration::from_secs(10)) };
        let mut state = Liveness::default();
        let t0 = Instant::now();

        assert_eq!(gate.observe(&mut state, 0.1, t0), Gate::Blinked);
        assert_eq!(gate.observe(&mut state, 0.4, t0 + Duration::from_secs(10)), Gate::Passed);
        assert_eq!(gate.observe(&mut state, 0.4, t0 + Duration::from_secs(11)), Gate::AwaitingBlink);
        assert!(!state.blink_observed());

        // A closed eye on the expiring tick counts as a fresh blink.
        let t1 = t0 + Duration::from_secs(30);
        assert_eq!(gate.observe(&mut state, 0.1, t1), Gate::Blinked);
        assert_eq!(gate.observe(&mut state, 0.1, t1 + Duration::from_secs(11)), Gate::Blinked);
    }

    #[test]
    fn test_reset_clears_flag() {
        let gate = LivenessGate::default();
        let mut state = Liveness::default();
        gate.observe(&mut state, 0.0, Instant::now());
        assert!(state.blink_observed());
        state.reset();
        assert!(!state.blink_observed());
    }
}

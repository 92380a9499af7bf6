//! Scan session state machine.
//!
//! ```text
//! Scanning ──(blink + match)──▶ Matched ──(recorder replied)──▶ Cooldown ──(cooldown elapsed)──▶ Scanning
//!    ▲   │
//!    └───┘ no face / awaiting blink / unknown face (liveness reset)
//! ```
//!
//! All per-session state lives in [`SessionState`], which [`step`] and
//! [`complete`] take by value and hand back. Nothing here touches a timer,
//! a camera or the store.

use crate::liveness::{combined_ear, Gate, Liveness, LivenessGate, DEFAULT_BLINK_THRESHOLD};
use crate::matcher::{EuclideanMatcher, MatchOutcome, Matcher, DEFAULT_MATCH_THRESHOLD};
use crate::scanner::RecordError;
use crate::types::{AttendanceRecord, Detection, Gallery, StudentRef};
use std::time::{Duration, Instant};

pub const MSG_SCANNING: &str = "Scanning... Please ensure good lighting.";
pub const MSG_NO_FACE: &str = "No face detected.";
pub const MSG_BLINK: &str = "Please BLINK to verify liveness.";
pub const MSG_VERIFYING: &str = "Blink detected! Verifying identity...";
pub const MSG_UNKNOWN: &str = "Unknown face. Registered?";
pub const MSG_NO_REFERENCES: &str = "No registered faces to compare against.";

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// EAR strictly below this counts as a blink.
    pub blink_threshold: f32,
    /// Descriptor distance strictly below this counts as a match.
    pub match_threshold: f32,
    pub tick_interval: Duration,
    /// Time spent showing the result before scanning resumes.
    pub cooldown: Duration,
    /// Age after which an observed blink no longer counts. `None` disables expiry.
    pub blink_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            blink_threshold: DEFAULT_BLINK_THRESHOLD,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            tick_interval: Duration::from_millis(500),
            cooldown: Duration::from_secs(3),
            blink_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl SessionConfig {
    pub fn gate(&self) -> LivenessGate {
        LivenessGate {
            threshold: self.blink_threshold,
            blink_timeout: self.blink_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Scanning,
    /// A student was recognized; waiting for the recorder to reply.
    Matched { student: StudentRef, distance: f32 },
    /// Showing the result until `until`.
    Cooldown { until: Instant },
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Scanning => "scanning",
            Phase::Matched { .. } => "matched",
            Phase::Cooldown { .. } => "cooldown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub phase: Phase,
    pub liveness: Liveness,
    /// Text for whoever is standing in front of the camera.
    pub message: String,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: Phase::Scanning,
            liveness: Liveness::default(),
            message: MSG_SCANNING.to_string(),
        }
    }
}

impl SessionState {
    pub fn is_scanning(&self) -> bool {
        self.phase == Phase::Scanning
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    NoFace,
    AwaitingBlink { ear: f32 },
    /// Liveness passed but the gallery is empty, so nothing was compared.
    NoReferences,
    /// Nearest reference is too far away. Liveness was reset.
    Unknown { distance: f32 },
    Matched { student: StudentRef, distance: f32 },
    /// Matched or cooling down; the frame was ignored.
    Busy,
    /// Cooldown elapsed; a fresh scanning session began.
    Resumed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    /// The liveness flag flipped to true on this tick.
    pub blinked: bool,
    pub outcome: TickOutcome,
}

impl Tick {
    fn of(outcome: TickOutcome) -> Self {
        Self { blinked: false, outcome }
    }
}

/// Advance the session by one tick.
pub fn step(
    mut state: SessionState,
    detection: Option<&Detection>,
    gallery: &Gallery,
    config: &SessionConfig,
    now: Instant,
) -> (SessionState, Tick) {
    match state.phase {
        Phase::Scanning => {}
        Phase::Matched { .. } => return (state, Tick::of(TickOutcome::Busy)),
        Phase::Cooldown { until } => {
            if now < until {
                return (state, Tick::of(TickOutcome::Busy));
            }
            tracing::debug!("cooldown elapsed; scanning resumed");
            return (SessionState::default(), Tick::of(TickOutcome::Resumed));
        }
    }

    let Some(detection) = detection else {
        state.message = MSG_NO_FACE.to_string();
        return (state, Tick::of(TickOutcome::NoFace));
    };

    let ear = combined_ear(&detection.eyes);
    let gate = config.gate().observe(&mut state.liveness, ear, now);
    tracing::trace!(ear, threshold = config.blink_threshold, ?gate, "liveness");

    let blinked = match gate {
        Gate::AwaitingBlink => {
            state.message = MSG_BLINK.to_string();
            return (state, Tick::of(TickOutcome::AwaitingBlink { ear }));
        }
        Gate::Blinked => {
            tracing::info!(ear, "blink detected");
            state.message = MSG_VERIFYING.to_string();
            true
        }
        Gate::Passed => false,
    };

    if gallery.is_empty() {
        state.message = MSG_NO_REFERENCES.to_string();
        return (state, Tick { blinked, outcome: TickOutcome::NoReferences });
    }

    let outcome = match EuclideanMatcher.best_match(&detection.embedding, gallery, config.match_threshold) {
        MatchOutcome::Matched { label, distance } => match gallery.student(&label) {
            Some(student) => {
                tracing::info!(roll_no = %student.roll_no, distance, "face matched");
                state.phase = Phase::Matched {
                    student: student.clone(),
                    distance,
                };
                state.message = MSG_VERIFYING.to_string();
                TickOutcome::Matched {
                    student: student.clone(),
                    distance,
                }
            }
            None => {
                tracing::warn!(%label, "matched label missing from gallery lookup");
                unknown(&mut state, distance)
            }
        },
        MatchOutcome::Unknown { distance } => unknown(&mut state, distance),
    };

    (state, Tick { blinked, outcome })
}

fn unknown(state: &mut SessionState, distance: f32) -> TickOutcome {
    tracing::info!(distance, "face not recognized; liveness reset");
    state.liveness.reset();
    state.message = MSG_UNKNOWN.to_string();
    TickOutcome::Unknown { distance }
}

/// Apply the recorder's reply to a matched session and start the cooldown.
///
/// Outside of [`Phase::Matched`] the state is returned unchanged.
pub fn complete(
    mut state: SessionState,
    result: &Result<AttendanceRecord, RecordError>,
    config: &SessionConfig,
    now: Instant,
) -> SessionState {
    let Phase::Matched { student, .. } = &state.phase else {
        tracing::warn!(phase = state.phase.name(), "recorder reply outside of a match; ignored");
        return state;
    };

    state.message = match result {
        Ok(_) => format!("Welcome, {}! Attendance Marked.", student.full_name),
        Err(RecordError::AlreadyMarkedToday) => {
            format!("{}: attendance already marked for today.", student.full_name)
        }
        Err(err) => format!("Error marking attendance: {err}"),
    };
    state.phase = Phase::Cooldown {
        until: now + config.cooldown,
    };
    state.liveness.reset();
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttendanceStatus, Embedding, EyeLandmarks, FaceBox, Point, Student};
    use chrono::Local;

    fn eye(open: bool) -> Vec<Point> {
        let h = if open { 8.0 } else { 1.0 };
        vec![
            Point::new(0.0, 0.0),
            Point::new(5.0, -h),
            Point::new(15.0, -h),
            Point::new(20.0, 0.0),
            Point::new(15.0, h),
            Point::new(5.0, h),
        ]
    }

    fn detection(open: bool, embedding: Vec<f32>) -> Detection {
        Detection {
            confidence: 0.9,
            face: FaceBox { x: 0.0, y: 0.0, width: 100.0, height: 100.0 },
            eyes: EyeLandmarks { left: eye(open), right: eye(open) },
            embedding: Embedding::new(embedding),
        }
    }

    fn gallery() -> Gallery {
        let mk = |roll_no: &str, name: &str, v: Vec<f32>| Student {
            id: format!("id-{roll_no}"),
            roll_no: roll_no.into(),
            full_name: name.into(),
            descriptor: Some(Embedding::new(v)),
            created_at: Local::now(),
        };
        Gallery::from_students(&[mk("A", "Ada", vec![0.0, 0.0]), mk("B", "Bo", vec![0.9, 0.0])])
    }

    fn config() -> SessionConfig {
        SessionConfig { blink_timeout: None, ..SessionConfig::default() }
    }

    fn record() -> AttendanceRecord {
        AttendanceRecord {
            id: "r1".into(),
            student_id: "id-A".into(),
            date: Local::now().date_naive(),
            recorded_at: Local::now(),
            status: AttendanceStatus::Present,
        }
    }

    #[test]
    fn test_no_face_keeps_phase() {
        let (state, tick) = step(SessionState::default(), None, &gallery(), &config(), Instant::now());
        assert_eq!(tick.outcome, TickOutcome::NoFace);
        assert!(state.is_scanning());
        assert_eq!(state.message, MSG_NO_FACE);
    }

    #[test]
    fn test_open_eyes_wait_for_blink() {
        let d = detection(true, vec![0.1, 0.0]);
        let (state, tick) = step(SessionState::default(), Some(&d), &gallery(), &config(), Instant::now());
        assert!(matches!(tick.outcome, TickOutcome::AwaitingBlink { .. }));
        assert!(!tick.blinked);
        assert!(!state.liveness.blink_observed());
        assert_eq!(state.message, MSG_BLINK);
    }

    #[test]
    fn test_blink_and_match_on_same_tick() {
        let d = detection(false, vec![0.1, 0.0]);
        let (state, tick) = step(SessionState::default(), Some(&d), &gallery(), &config(), Instant::now());
        assert!(tick.blinked);
        match tick.outcome {
            TickOutcome::Matched { student, distance } => {
                assert_eq!(student.roll_no, "A");
                assert!((distance - 0.1).abs() < 1e-6);
            }
            other => panic!("expected match, got {other:?}"),
        }
        assert_eq!(state.phase.name(), "matched");
    }

    #[test]
    fn test_blink_persists_across_open_eye_ticks() {
        let cfg = config();
        let now = Instant::now();
        let empty = Gallery::default();

        let (state, tick) = step(SessionState::default(), Some(&detection(false, vec![0.0, 0.0])), &empty, &cfg, now);
        assert!(tick.blinked);
        assert_eq!(tick.outcome, TickOutcome::NoReferences);

        // Eyes open again: the flag stays set and does not flip a second time.
        let (state, tick) = step(state, Some(&detection(true, vec![0.0, 0.0])), &empty, &cfg, now);
        assert!(!tick.blinked);
        assert_eq!(tick.outcome, TickOutcome::NoReferences);
        assert!(state.liveness.blink_observed());
    }

    #[test]
    fn test_unknown_face_resets_liveness() {
        let cfg = config();
        let now = Instant::now();
        // 0.65 from A, about 1.1 from B.
        let stranger = detection(false, vec![0.0, 0.65]);

        let (state, tick) = step(SessionState::default(), Some(&stranger), &gallery(), &cfg, now);
        assert!(tick.blinked);
        assert!(matches!(tick.outcome, TickOutcome::Unknown { distance } if (distance - 0.65).abs() < 1e-6));
        assert!(!state.liveness.blink_observed());
        assert_eq!(state.message, MSG_UNKNOWN);
        assert!(state.is_scanning());

        // Known face with open eyes is not matched until the user blinks again.
        let known_open = detection(true, vec![0.0, 0.0]);
        let (state, tick) = step(state, Some(&known_open), &gallery(), &cfg, now);
        assert!(matches!(tick.outcome, TickOutcome::AwaitingBlink { .. }));
        assert!(state.is_scanning());
    }

    #[test]
    fn test_matched_session_ignores_frames() {
        let cfg = config();
        let now = Instant::now();
        let d = detection(false, vec![0.0, 0.0]);
        let (state, _) = step(SessionState::default(), Some(&d), &gallery(), &cfg, now);
        let (state, tick) = step(state, Some(&d), &gallery(), &cfg, now);
        assert_eq!(tick.outcome, TickOutcome::Busy);
        assert_eq!(state.phase.name(), "matched");
    }

    #[test]
    fn test_success_then_cooldown_then_resume() {
        let cfg = config();
        let t0 = Instant::now();
        let d = detection(false, vec![0.0, 0.0]);

        let (state, _) = step(SessionState::default(), Some(&d), &gallery(), &cfg, t0);
        let state = complete(state, &Ok(record()), &cfg, t0);
        assert_eq!(state.phase, Phase::Cooldown { until: t0 + Duration::from_secs(3) });
        assert_eq!(state.message, "Welcome, Ada! Attendance Marked.");

        let (state, tick) = step(state, Some(&d), &gallery(), &cfg, t0 + Duration::from_millis(2999));
        assert_eq!(tick.outcome, TickOutcome::Busy);

        let (state, tick) = step(state, Some(&d), &gallery(), &cfg, t0 + Duration::from_secs(3));
        assert_eq!(tick.outcome, TickOutcome::Resumed);
        assert_eq!(state, SessionState::default());
    }

    #[test]
    fn test_already_marked_is_benign() {
        let cfg = config();
        let t0 = Instant::now();
        let d = detection(false, vec![0.0, 0.0]);

        let (state, _) = step(SessionState::default(), Some(&d), &gallery(), &cfg, t0);
        let state = complete(state, &Err(RecordError::AlreadyMarkedToday), &cfg, t0);
        assert_eq!(state.message, "Ada: attendance already marked for today.");
        assert_eq!(state.phase.name(), "cooldown");

        let (state, tick) = step(state, None, &gallery(), &cfg, t0 + cfg.cooldown);
        assert_eq!(tick.outcome, TickOutcome::Resumed);
        assert!(state.is_scanning());
    }

    #[test]
    fn test_recorder_failure_surfaces_detail() {
        let cfg = config();
        let t0 = Instant::now();
        let d = detection(false, vec![0.0, 0.0]);

        let (state, _) = step(SessionState::default(), Some(&d), &gallery(), &cfg, t0);
        let state = complete(state, &Err(RecordError::Storage("disk I/O error".into())), &cfg, t0);
        assert_eq!(state.message, "Error marking attendance: storage failure: disk I/O error");
        assert_eq!(state.phase.name(), "cooldown");
    }

    #[test]
    fn test_complete_outside_match_is_ignored() {
        let state = complete(SessionState::default(), &Ok(record()), &config(), Instant::now());
        assert_eq!(state, SessionState::default());
    }

    #[test]
    fn test_stale_blink_is_not_reused() {
        let cfg = SessionConfig { blink_timeout: Some(Duration::from_secs(10)), ..SessionConfig::default() };
        let t0 = Instant::now();
        let empty = Gallery::default();

        let (state, _) = step(SessionState::default(), Some(&detection(false, vec![0.0, 0.0])), &empty, &cfg, t0);
        assert!(state.liveness.blink_observed());

        // User walks away and comes back a minute later with eyes open.
        let later = t0 + Duration::from_secs(60);
        let (state, tick) = step(state, Some(&detection(true, vec![0.0, 0.0])), &gallery(), &cfg, later);
        assert!(matches!(tick.outcome, TickOutcome::AwaitingBlink { .. }));
        assert!(!state.liveness.blink_observed());
    }
}

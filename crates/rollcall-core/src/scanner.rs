//! Tick driver that connects the session state machine to its collaborators.

use crate::session::{self, SessionConfig, SessionState, Tick, TickOutcome};
use crate::types::{AttendanceRecord, AttendanceStatus, Detection, Gallery};
use chrono::{DateTime, Local};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaceModelError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Face detection capability: one frame in, at most one face out.
///
/// Implementations may keep internal buffers, hence `&mut self`. Calls are
/// never made concurrently.
pub trait FaceModel {
    type Frame;

    fn detect(&mut self, frame: &Self::Frame) -> Result<Option<Detection>, FaceModelError>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Attendance already marked for today")]
    AlreadyMarkedToday,
    #[error("Student not found")]
    StudentNotFound,
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Day-scoped attendance writer.
pub trait AttendanceRecorder {
    fn record(
        &self,
        student_id: &str,
        status: AttendanceStatus,
        at: DateTime<Local>,
    ) -> Result<AttendanceRecord, RecordError>;
}

/// What happened on one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub tick: Tick,
    /// Recorder reply, present only on the tick that produced a match.
    pub recorded: Option<Result<AttendanceRecord, RecordError>>,
}

/// One scanning session: the reference gallery, the session state and its
/// configuration.
///
/// The face model and recorder are borrowed per tick so that the owner can
/// keep using the model (e.g. for registration) between sessions.
pub struct Scanner {
    gallery: Gallery,
    config: SessionConfig,
    state: SessionState,
}

impl Scanner {
    pub fn new(gallery: Gallery, config: SessionConfig) -> Self {
        tracing::info!(references = gallery.len(), "scan session started");
        Self {
            gallery,
            config,
            state: SessionState::default(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run one detect-and-decide cycle against the current frame, if any.
    ///
    /// Detection errors count as "no face". Recorder errors end up in the
    /// session message and the report; neither escapes the tick.
    pub fn tick<M, R>(
        &mut self,
        model: &mut M,
        recorder: &R,
        frame: Option<&M::Frame>,
        now: Instant,
    ) -> TickReport
    where
        M: FaceModel,
        R: AttendanceRecorder + ?Sized,
    {
        let detection = match frame {
            Some(frame) if self.state.is_scanning() => match model.detect(frame) {
                Ok(detection) => detection,
                Err(e) => {
                    tracing::warn!(error = %e, "face detection failed; retrying next tick");
                    None
                }
            },
            _ => None,
        };

        let state = std::mem::take(&mut self.state);
        let (state, tick) = session::step(state, detection.as_ref(), &self.gallery, &self.config, now);

        let (state, recorded) = match &tick.outcome {
            TickOutcome::Matched { student, .. } => {
                let result = recorder.record(&student.id, AttendanceStatus::Present, Local::now());
                match &result {
                    Ok(record) => tracing::info!(
                        roll_no = %student.roll_no,
                        record_id = %record.id,
                        "attendance recorded"
                    ),
                    Err(RecordError::AlreadyMarkedToday) => {
                        tracing::info!(roll_no = %student.roll_no, "attendance already marked today")
                    }
                    Err(e) => tracing::warn!(roll_no = %student.roll_no, error = %e, "attendance write failed"),
                }
                let state = session::complete(state, &result, &self.config, now);
                (state, Some(result))
            }
            _ => (state, None),
        };

        self.state = state;
        TickReport { tick, recorded }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Embedding, EyeLandmarks, FaceBox, Point, Student};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Replays scripted detections, one per call. The frame value is ignored.
    struct ScriptedModel {
        script: VecDeque<Result<Option<Detection>, FaceModelError>>,
        calls: usize,
    }

    impl ScriptedModel {
        fn new(script: Vec<Result<Option<Detection>, FaceModelError>>) -> Self {
            Self { script: script.into(), calls: 0 }
        }
    }

    impl FaceModel for ScriptedModel {
        type Frame = ();

        fn detect(&mut self, _frame: &()) -> Result<Option<Detection>, FaceModelError> {
            self.calls += 1;
            self.script.pop_front().unwrap_or(Ok(None))
        }
    }

    /// Records calls and answers with a fixed reply.
    struct FakeRecorder {
        reply: Result<(), RecordError>,
        calls: RefCell<Vec<(String, AttendanceStatus)>>,
    }

    impl FakeRecorder {
        fn replying(reply: Result<(), RecordError>) -> Self {
            Self { reply, calls: RefCell::new(Vec::new()) }
        }
    }

    impl AttendanceRecorder for FakeRecorder {
        fn record(
            &self,
            student_id: &str,
            status: AttendanceStatus,
            at: DateTime<Local>,
        ) -> Result<AttendanceRecord, RecordError> {
            self.calls.borrow_mut().push((student_id.to_string(), status));
            self.reply.clone().map(|()| AttendanceRecord {
                id: format!("rec-{}", self.calls.borrow().len()),
                student_id: student_id.to_string(),
                date: at.date_naive(),
                recorded_at: at,
                status,
            })
        }
    }

    fn eye(height: f32) -> Vec<Point> {
        vec![
            Point::new(0.0, 0.0),
            Point::new(5.0, -height),
            Point::new(15.0, -height),
            Point::new(20.0, 0.0),
            Point::new(15.0, height),
            Point::new(5.0, height),
        ]
    }

    fn face(closed: bool, embedding: &[f32]) -> Result<Option<Detection>, FaceModelError> {
        let h = if closed { 1.0 } else { 8.0 };
        Ok(Some(Detection {
            confidence: 0.95,
            face: FaceBox { x: 10.0, y: 10.0, width: 120.0, height: 120.0 },
            eyes: EyeLandmarks { left: eye(h), right: eye(h) },
            embedding: Embedding::new(embedding.to_vec()),
        }))
    }

    fn scanner() -> Scanner {
        let students = vec![
            Student {
                id: "uuid-a".into(),
                roll_no: "CS-001".into(),
                full_name: "Ada Lovelace".into(),
                descriptor: Some(Embedding::new(vec![0.0, 0.0, 0.0])),
                created_at: Local::now(),
            },
            Student {
                id: "uuid-b".into(),
                roll_no: "CS-002".into(),
                full_name: "Alan Turing".into(),
                descriptor: Some(Embedding::new(vec![0.9, 0.0, 0.0])),
                created_at: Local::now(),
            },
        ];
        let config = SessionConfig { blink_timeout: None, ..SessionConfig::default() };
        Scanner::new(Gallery::from_students(&students), config)
    }

    fn run(
        scanner: &mut Scanner,
        model: &mut ScriptedModel,
        recorder: &FakeRecorder,
        ticks: usize,
        start: Instant,
    ) -> Vec<TickReport> {
        (0..ticks)
            .map(|i| scanner.tick(model, recorder, Some(&()), start + Duration::from_millis(500 * i as u64)))
            .collect()
    }

    #[test]
    fn test_blink_then_match_records_once() {
        let mut scanner = scanner();
        let mut model = ScriptedModel::new(vec![
            Ok(None),
            face(false, &[0.1, 0.0, 0.0]),
            face(true, &[0.1, 0.0, 0.0]),
            face(true, &[0.1, 0.0, 0.0]),
        ]);
        let recorder = FakeRecorder::replying(Ok(()));

        let reports = run(&mut scanner, &mut model, &recorder, 4, Instant::now());

        assert_eq!(reports[0].tick.outcome, TickOutcome::NoFace);
        assert!(matches!(reports[1].tick.outcome, TickOutcome::AwaitingBlink { .. }));
        assert!(reports[2].tick.blinked);
        assert!(matches!(&reports[2].tick.outcome, TickOutcome::Matched { student, .. } if student.roll_no == "CS-001"));
        assert!(matches!(reports[2].recorded, Some(Ok(_))));
        assert_eq!(reports[3].tick.outcome, TickOutcome::Busy);

        // Cooling down: the model is not consulted and the recorder was hit once.
        assert_eq!(model.calls, 3);
        assert_eq!(
            recorder.calls.borrow().as_slice(),
            &[("uuid-a".to_string(), AttendanceStatus::Present)]
        );
        assert_eq!(scanner.state().message, "Welcome, Ada Lovelace! Attendance Marked.");
    }

    #[test]
    fn test_already_marked_returns_to_scanning_after_cooldown() {
        let mut scanner = scanner();
        let mut model = ScriptedModel::new(vec![face(true, &[0.0, 0.0, 0.0])]);
        let recorder = FakeRecorder::replying(Err(RecordError::AlreadyMarkedToday));
        let t0 = Instant::now();

        let report = scanner.tick(&mut model, &recorder, Some(&()), t0);
        assert_eq!(report.recorded, Some(Err(RecordError::AlreadyMarkedToday)));
        assert_eq!(scanner.state().phase.name(), "cooldown");
        assert_eq!(scanner.state().message, "Ada Lovelace: attendance already marked for today.");

        let report = scanner.tick(&mut model, &recorder, Some(&()), t0 + Duration::from_secs(3));
        assert_eq!(report.tick.outcome, TickOutcome::Resumed);
        assert!(scanner.state().is_scanning());
        assert!(!scanner.state().liveness.blink_observed());
    }

    #[test]
    fn test_unknown_face_requires_new_blink() {
        let mut scanner = scanner();
        let mut model = ScriptedModel::new(vec![
            face(true, &[0.0, 0.65, 0.0]),
            face(false, &[0.0, 0.0, 0.0]),
            face(true, &[0.0, 0.0, 0.0]),
        ]);
        let recorder = FakeRecorder::replying(Ok(()));

        let reports = run(&mut scanner, &mut model, &recorder, 3, Instant::now());

        assert!(matches!(reports[0].tick.outcome, TickOutcome::Unknown { .. }));
        assert!(matches!(reports[1].tick.outcome, TickOutcome::AwaitingBlink { .. }));
        assert!(matches!(reports[2].tick.outcome, TickOutcome::Matched { .. }));
        assert_eq!(recorder.calls.borrow().len(), 1);
    }

    #[test]
    fn test_model_error_is_treated_as_no_face() {
        let mut scanner = scanner();
        let mut model = ScriptedModel::new(vec![Err(FaceModelError::Inference("timeout".into()))]);
        let recorder = FakeRecorder::replying(Ok(()));

        let report = scanner.tick(&mut model, &recorder, Some(&()), Instant::now());
        assert_eq!(report.tick.outcome, TickOutcome::NoFace);
        assert!(scanner.state().is_scanning());
    }

    #[test]
    fn test_missing_frame_skips_detection() {
        let mut scanner = scanner();
        let mut model = ScriptedModel::new(vec![face(true, &[0.0, 0.0, 0.0])]);
        let recorder = FakeRecorder::replying(Ok(()));

        let report = scanner.tick(&mut model, &recorder, None, Instant::now());
        assert_eq!(report.tick.outcome, TickOutcome::NoFace);
        assert_eq!(model.calls, 0);
    }

    #[test]
    fn test_storage_failure_does_not_escape_tick() {
        let mut scanner = scanner();
        let mut model = ScriptedModel::new(vec![face(true, &[0.0, 0.0, 0.0])]);
        let recorder = FakeRecorder::replying(Err(RecordError::Storage("database is locked".into())));
        let t0 = Instant::now();

        let report = scanner.tick(&mut model, &recorder, Some(&()), t0);
        assert!(matches!(report.recorded, Some(Err(RecordError::Storage(_)))));
        assert_eq!(
            scanner.state().message,
            "Error marking attendance: storage failure: database is locked"
        );

        let report = scanner.tick(&mut model, &recorder, Some(&()), t0 + Duration::from_secs(3));
        assert_eq!(report.tick.outcome, TickOutcome::Resumed);
    }
}

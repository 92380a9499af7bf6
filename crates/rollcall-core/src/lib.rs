//! rollcall-core: Liveness-gated face matching for attendance capture.
//!
//! A blink gate (eye aspect ratio over six-point eye contours) guards a
//! nearest-descriptor matcher. The per-session state machine is a pure
//! function of its inputs; cameras, face models and storage plug in through
//! the [`FaceModel`] and [`AttendanceRecorder`] traits.

pub mod liveness;
pub mod matcher;
pub mod scanner;
pub mod session;
pub mod types;

pub use matcher::{EuclideanMatcher, MatchOutcome, Matcher};
pub use scanner::{AttendanceRecorder, FaceModel, FaceModelError, RecordError, Scanner, TickReport};
pub use session::{Phase, SessionConfig, SessionState, TickOutcome};
pub use types::{
    AttendanceRecord, AttendanceStatus, Detection, Embedding, EyeLandmarks, FaceBox, Gallery, Point,
    Student, StudentRef,
};

//! Camera and face model on a dedicated OS thread.
//!
//! The thread owns the frame source and the face model. D-Bus handlers talk
//! to it through an mpsc channel with oneshot replies; scan progress is
//! published on a watch channel so readers never wait on inference.

use crate::config::Config;
use crate::store::{SharedStore, StoreError};
use chrono::{DateTime, Local};
use rollcall_core::{FaceModel, FaceModelError, Gallery, Scanner, SessionConfig, Student, TickOutcome};
use rollcall_hw::{Camera, CameraError, Frame, FrameError};
use rollcall_vision::{OnnxFaceModel, VisionError};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("face model error: {0}")]
    Vision(#[from] VisionError),
    #[error("{0}")]
    Model(#[from] FaceModelError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("No face detected. Please try again.")]
    NoFaceDetected,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Where the engine gets its frames.
///
/// Sources may keep a capture stream running between calls; the engine
/// calls [`FrameSource::release`] when it no longer needs frames.
pub trait FrameSource {
    /// The next frame, as captured.
    fn frame(&mut self) -> Result<Frame, CameraError>;
    /// A frame that is not mostly black, trying up to `max_attempts` captures.
    fn usable_frame(&mut self, max_attempts: usize) -> Result<Frame, CameraError>;
    /// Stop capturing until the next request for a frame.
    fn release(&mut self) {}
}

impl FrameSource for Camera {
    fn frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }

    fn usable_frame(&mut self, max_attempts: usize) -> Result<Frame, CameraError> {
        self.capture_usable_frame(max_attempts)
    }

    fn release(&mut self) {
        Camera::release(self);
    }
}

/// Snapshot of the scan loop, as seen by D-Bus clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanStatus {
    pub active: bool,
    /// `idle`, `scanning`, `matched` or `cooldown`.
    pub phase: String,
    pub message: String,
    pub references: usize,
    pub last_outcome: Option<String>,
    pub ticks: u64,
    /// Attendance rows written by this scan session.
    pub marked: u64,
    pub updated_at: DateTime<Local>,
}

impl ScanStatus {
    fn idle() -> Self {
        Self {
            active: false,
            phase: "idle".into(),
            message: "Scanner stopped.".into(),
            references: 0,
            last_outcome: None,
            ticks: 0,
            marked: 0,
            updated_at: Local::now(),
        }
    }
}

enum EngineRequest {
    Register {
        full_name: String,
        roll_no: String,
        reply: oneshot::Sender<Result<Student, EngineError>>,
    },
    RegisterFromImage {
        full_name: String,
        roll_no: String,
        path: PathBuf,
        reply: oneshot::Sender<Result<Student, EngineError>>,
    },
    StartScan {
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    StopScan {
        reply: oneshot::Sender<bool>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    status: watch::Receiver<ScanStatus>,
}

impl EngineHandle {
    /// Capture a frame from the camera and register its face descriptor.
    pub async fn register(&self, full_name: &str, roll_no: &str) -> Result<Student, EngineError> {
        self.request(|reply| EngineRequest::Register {
            full_name: full_name.to_string(),
            roll_no: roll_no.to_string(),
            reply,
        })
        .await?
    }

    /// Register from a still image on disk instead of the camera.
    pub async fn register_from_image(
        &self,
        full_name: &str,
        roll_no: &str,
        path: PathBuf,
    ) -> Result<Student, EngineError> {
        self.request(|reply| EngineRequest::RegisterFromImage {
            full_name: full_name.to_string(),
            roll_no: roll_no.to_string(),
            path,
            reply,
        })
        .await?
    }

    /// Start (or restart) a scan session. Returns the number of reference
    /// labels loaded.
    pub async fn start_scan(&self) -> Result<usize, EngineError> {
        self.request(|reply| EngineRequest::StartScan { reply }).await?
    }

    /// Stop scanning. Returns false if no session was running.
    pub async fn stop_scan(&self) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::StopScan { reply }).await
    }

    pub fn status(&self) -> ScanStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanStatus> {
        self.status.clone()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Open the camera, load the face model and spawn the engine thread.
///
/// Fails fast if the camera or any model is unavailable.
pub fn spawn_engine(config: &Config, store: SharedStore) -> Result<EngineHandle, EngineError> {
    let camera = Camera::open(&config.camera_device)?.with_warmup(config.warmup_frames);
    let model = OnnxFaceModel::load(&config.model_dir, config.detection_confidence)?;

    spawn_with(camera, model, store, config.session(), config.register_attempts)
}

/// Spawn the engine thread around an already-initialised source and model.
pub fn spawn_with<S, M>(
    source: S,
    model: M,
    store: SharedStore,
    session: SessionConfig,
    register_attempts: usize,
) -> Result<EngineHandle, EngineError>
where
    S: FrameSource + Send + 'static,
    M: FaceModel<Frame = Frame> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<EngineRequest>(8);
    let (status_tx, status_rx) = watch::channel(ScanStatus::idle());

    let engine = Engine {
        source,
        model,
        store,
        session,
        register_attempts,
        scanner: None,
        status: status_tx,
        ticks: 0,
        marked: 0,
    };

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            engine.run(rx);
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, status: status_rx })
}

struct Engine<S, M> {
    source: S,
    model: M,
    store: SharedStore,
    session: SessionConfig,
    register_attempts: usize,
    scanner: Option<Scanner>,
    status: watch::Sender<ScanStatus>,
    ticks: u64,
    marked: u64,
}

impl<S, M> Engine<S, M>
where
    S: FrameSource,
    M: FaceModel<Frame = Frame>,
{
    fn run(mut self, mut rx: mpsc::Receiver<EngineRequest>) {
        let mut deadline = Instant::now();

        'outer: loop {
            if self.scanner.is_none() {
                match rx.blocking_recv() {
                    Some(req) => self.handle(req),
                    None => break,
                }
                deadline = Instant::now();
                continue;
            }

            loop {
                match rx.try_recv() {
                    Ok(req) => self.handle(req),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'outer,
                }
            }
            if self.scanner.is_none() {
                continue;
            }

            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
            self.tick();
            deadline = next_deadline(deadline, self.session.tick_interval, Instant::now());
        }
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Register { full_name, roll_no, reply } => {
                let result = self
                    .precheck(&full_name, &roll_no)
                    .and_then(|()| Ok(self.source.usable_frame(self.register_attempts)?))
                    .and_then(|frame| self.enroll(&full_name, &roll_no, &frame));
                if self.scanner.is_none() {
                    self.source.release();
                }
                let _ = reply.send(result);
            }
            EngineRequest::RegisterFromImage { full_name, roll_no, path, reply } => {
                let result = self
                    .precheck(&full_name, &roll_no)
                    .and_then(|()| load_image(&path))
                    .and_then(|frame| self.enroll(&full_name, &roll_no, &frame));
                let _ = reply.send(result);
            }
            EngineRequest::StartScan { reply } => {
                let _ = reply.send(self.start_scan());
            }
            EngineRequest::StopScan { reply } => {
                let was_running = self.scanner.take().is_some();
                self.source.release();
                if was_running {
                    tracing::info!(ticks = self.ticks, marked = self.marked, "scan session stopped");
                }
                self.publish(None);
                let _ = reply.send(was_running);
            }
        }
    }

    /// Cheap checks that spare a capture when registration would fail anyway.
    fn precheck(&self, full_name: &str, roll_no: &str) -> Result<(), EngineError> {
        if full_name.trim().is_empty() || roll_no.trim().is_empty() {
            return Err(StoreError::InvalidInput("Full name and Roll No are required".into()).into());
        }
        if self.store.lock()?.roll_no_taken(roll_no)? {
            return Err(StoreError::DuplicateRollNo(roll_no.trim().to_string()).into());
        }
        Ok(())
    }

    fn enroll(&mut self, full_name: &str, roll_no: &str, frame: &Frame) -> Result<Student, EngineError> {
        let detection = self.model.detect(frame)?.ok_or(EngineError::NoFaceDetected)?;
        tracing::debug!(confidence = detection.confidence, "registration face detected");

        let student = self
            .store
            .lock()?
            .create_student(full_name, roll_no, Some(&detection.embedding), Local::now())?;

        if self.scanner.is_some() {
            tracing::info!(roll_no = %student.roll_no, "student registered mid-scan; restart the scan to include them");
        }
        Ok(student)
    }

    fn start_scan(&mut self) -> Result<usize, EngineError> {
        let students = self.store.lock()?.list_students()?;
        let gallery = Gallery::from_students(&students);
        let references = gallery.len();
        if references == 0 {
            tracing::warn!("no registered descriptors; every face will be unknown");
        }

        if self.scanner.is_some() {
            tracing::info!("restarting scan session");
        }
        self.scanner = Some(Scanner::new(gallery, self.session.clone()));
        self.ticks = 0;
        self.marked = 0;
        self.publish(None);
        Ok(references)
    }

    fn tick(&mut self) {
        let Some(scanner) = self.scanner.as_mut() else {
            return;
        };

        let frame = if scanner.state().is_scanning() {
            match self.source.frame() {
                Ok(frame) if frame.is_dark() => {
                    tracing::debug!(sequence = frame.sequence, "dark frame; treating as no face");
                    None
                }
                Ok(frame) => Some(frame),
                Err(e) => {
                    tracing::warn!(error = %e, "frame capture failed");
                    None
                }
            }
        } else {
            None
        };

        let previous = scanner.state().message.clone();
        let report = scanner.tick(&mut self.model, &self.store, frame.as_ref(), Instant::now());
        if scanner.state().message != previous {
            tracing::debug!(message = %scanner.state().message, "scan message changed");
        }

        self.ticks += 1;
        if matches!(report.recorded, Some(Ok(_))) {
            self.marked += 1;
        }
        self.publish(Some(outcome_label(&report.tick.outcome)));
    }

    fn publish(&self, last_outcome: Option<&str>) {
        let status = match &self.scanner {
            Some(scanner) => ScanStatus {
                active: true,
                phase: scanner.state().phase.name().to_string(),
                message: scanner.state().message.clone(),
                references: scanner.gallery().len(),
                last_outcome: last_outcome.map(str::to_string),
                ticks: self.ticks,
                marked: self.marked,
                updated_at: Local::now(),
            },
            None => ScanStatus::idle(),
        };
        self.status.send_replace(status);
    }
}

fn load_image(path: &std::path::Path) -> Result<Frame, EngineError> {
    let gray = image::open(path)?.to_luma8();
    let (width, height) = gray.dimensions();
    tracing::debug!(path = %path.display(), width, height, "registration image decoded");
    Ok(Frame::from_luma(width, height, gray.into_raw())?)
}

fn outcome_label(outcome: &TickOutcome) -> &'static str {
    match outcome {
        TickOutcome::NoFace => "no_face",
        TickOutcome::AwaitingBlink { .. } => "awaiting_blink",
        TickOutcome::NoReferences => "no_references",
        TickOutcome::Unknown { .. } => "unknown",
        TickOutcome::Matched { .. } => "matched",
        TickOutcome::Busy => "busy",
        TickOutcome::Resumed => "resumed",
    }
}

/// Next tick deadline on the `interval` grid anchored at `previous`.
/// Deadlines already in the past are skipped, never run back to back.
fn next_deadline(previous: Instant, interval: Duration, now: Instant) -> Instant {
    if interval.is_zero() {
        return now;
    }
    let next = previous + interval;
    if next > now {
        return next;
    }
    let behind = now.duration_since(previous).as_nanos() / interval.as_nanos();
    let skipped = behind.saturating_sub(1) as u64;
    tracing::debug!(skipped, "tick overran; skipping missed ticks");
    previous + interval * (behind as u32 + 1)
}

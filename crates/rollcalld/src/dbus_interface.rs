use crate::engine::{EngineError, EngineHandle};
use crate::store::{SharedStore, Store, StoreError};
use chrono::{DateTime, Local};
use rollcall_core::{AttendanceStatus, Student};
use serde::Serialize;
use std::path::PathBuf;
use zbus::fdo;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
    store: SharedStore,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle, store: SharedStore) -> Self {
        Self { engine, store }
    }

    /// Run a store operation on the blocking pool.
    async fn with_store<T, F>(&self, f: F) -> fdo::Result<T>
    where
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&*store.lock()?))
            .await
            .map_err(|e| fdo::Error::Failed(format!("store task failed: {e}")))?
            .map_err(store_error)
    }
}

/// Student as listed over the bus; the raw descriptor stays in the daemon.
#[derive(Serialize)]
struct StudentSummary<'a> {
    id: &'a str,
    roll_no: &'a str,
    full_name: &'a str,
    has_descriptor: bool,
    created_at: DateTime<Local>,
}

impl<'a> From<&'a Student> for StudentSummary<'a> {
    fn from(s: &'a Student) -> Self {
        Self {
            id: &s.id,
            roll_no: &s.roll_no,
            full_name: &s.full_name,
            has_descriptor: s.descriptor.is_some(),
            created_at: s.created_at,
        }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Capture a face from the camera and register it under `roll_no`.
    /// Returns the new student as JSON.
    async fn register_student(&self, full_name: &str, roll_no: &str) -> fdo::Result<String> {
        tracing::info!(roll_no, "register requested");
        let student = self
            .engine
            .register(full_name, roll_no)
            .await
            .map_err(engine_error)?;
        to_json(&StudentSummary::from(&student))
    }

    /// Register from an image file readable by the daemon.
    async fn register_student_from_image(
        &self,
        full_name: &str,
        roll_no: &str,
        path: &str,
    ) -> fdo::Result<String> {
        tracing::info!(roll_no, path, "register from image requested");
        let student = self
            .engine
            .register_from_image(full_name, roll_no, PathBuf::from(path))
            .await
            .map_err(engine_error)?;
        to_json(&StudentSummary::from(&student))
    }

    /// All registered students as a JSON array.
    async fn list_students(&self) -> fdo::Result<String> {
        let students = self.with_store(|store| store.list_students()).await?;
        let summaries: Vec<StudentSummary<'_>> = students.iter().map(StudentSummary::from).collect();
        to_json(&summaries)
    }

    /// Start scanning. Returns the number of reference labels loaded.
    async fn start_scan(&self) -> fdo::Result<u32> {
        tracing::info!("start scan requested");
        let references = self.engine.start_scan().await.map_err(engine_error)?;
        Ok(u32::try_from(references).unwrap_or(u32::MAX))
    }

    /// Stop scanning. Returns false if no session was running.
    async fn stop_scan(&self) -> fdo::Result<bool> {
        tracing::info!("stop scan requested");
        self.engine.stop_scan().await.map_err(engine_error)
    }

    /// Manually mark attendance for today. An empty `status` means Present.
    async fn mark_attendance(&self, student_id: &str, status: &str) -> fdo::Result<String> {
        let status = match status.trim() {
            "" => AttendanceStatus::default(),
            raw => raw
                .parse::<AttendanceStatus>()
                .map_err(|e| fdo::Error::InvalidArgs(e.to_string()))?,
        };
        tracing::info!(student_id, %status, "manual mark requested");

        let student_id = student_id.to_string();
        let record = self
            .with_store(move |store| store.mark_attendance(&student_id, status, Local::now()))
            .await?;
        to_json(&record)
    }

    /// Today's attendance joined with student details, as a JSON array.
    async fn attendance_today(&self) -> fdo::Result<String> {
        let today = Local::now().date_naive();
        let entries = self
            .with_store(move |store| store.attendance_for_day(today))
            .await?;
        to_json(&entries)
    }

    /// Daemon and scan status as JSON.
    async fn status(&self) -> fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "scan": self.engine.status(),
        })
        .to_string())
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialization failed: {e}")))
}

fn engine_error(e: EngineError) -> fdo::Error {
    match e {
        EngineError::Store(e) => store_error(e),
        e @ (EngineError::NoFaceDetected | EngineError::Image(_) | EngineError::Frame(_)) => {
            fdo::Error::InvalidArgs(e.to_string())
        }
        e => {
            tracing::error!(error = %e, "engine request failed");
            fdo::Error::Failed(e.to_string())
        }
    }
}

fn store_error(e: StoreError) -> fdo::Error {
    match e {
        StoreError::DuplicateRollNo(_) | StoreError::InvalidInput(_) | StoreError::AlreadyMarkedToday => {
            fdo::Error::InvalidArgs(e.to_string())
        }
        StoreError::StudentNotFound(_) => fdo::Error::UnknownObject(e.to_string()),
        e => {
            tracing::error!(error = %e, "store operation failed");
            fdo::Error::Failed(e.to_string())
        }
    }
}

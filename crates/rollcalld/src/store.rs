//! SQLite-backed student registry and attendance log.
//!
//! Descriptors are stored as JSON arrays. Day-scoped uniqueness is enforced
//! by the `UNIQUE(student_id, date)` constraint rather than a prior read, so
//! concurrent marks for the same student cannot both succeed.
//!
//! Timestamps are written as fixed-width UTC RFC 3339 text so that ordering
//! by the column is chronological across offset changes.

use chrono::{DateTime, Local, NaiveDate, SecondsFormat, TimeZone, Utc};
use rollcall_core::{AttendanceRecord, AttendanceRecorder, AttendanceStatus, Embedding, RecordError, Student};
use rusqlite::types::Type;
use rusqlite::{ffi, params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;
    CREATE TABLE IF NOT EXISTS students (
        id              TEXT PRIMARY KEY,
        roll_no         TEXT NOT NULL UNIQUE,
        full_name       TEXT NOT NULL,
        face_descriptor TEXT,
        created_at      TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS attendance (
        id          TEXT PRIMARY KEY,
        student_id  TEXT NOT NULL REFERENCES students(id) ON DELETE CASCADE,
        date        TEXT NOT NULL,
        recorded_at TEXT NOT NULL,
        status      TEXT NOT NULL DEFAULT 'Present',
        UNIQUE(student_id, date)
    );
    CREATE INDEX IF NOT EXISTS attendance_date ON attendance(date);
";

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Student with this Roll No already exists")]
    DuplicateRollNo(String),
    #[error("Student not found")]
    StudentNotFound(String),
    #[error("Attendance already marked for today")]
    AlreadyMarkedToday,
    #[error("{0}")]
    InvalidInput(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("descriptor encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for RecordError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AlreadyMarkedToday => RecordError::AlreadyMarkedToday,
            StoreError::StudentNotFound(_) => RecordError::StudentNotFound,
            other => RecordError::Storage(other.to_string()),
        }
    }
}

/// One row of a day's attendance sheet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyEntry {
    #[serde(flatten)]
    pub record: AttendanceRecord,
    pub roll_no: String,
    pub full_name: String,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self::init(Connection::open(path)?)?;
        tracing::info!(path = %path.display(), "attendance store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Insert a student. Name and roll number are trimmed and must be non-empty.
    pub fn create_student(
        &self,
        full_name: &str,
        roll_no: &str,
        descriptor: Option<&Embedding>,
        now: DateTime<Local>,
    ) -> Result<Student, StoreError> {
        let (full_name, roll_no) = (full_name.trim(), roll_no.trim());
        if full_name.is_empty() || roll_no.is_empty() {
            return Err(StoreError::InvalidInput("Full name and Roll No are required".into()));
        }

        let student = Student {
            id: uuid::Uuid::new_v4().to_string(),
            roll_no: roll_no.to_string(),
            full_name: full_name.to_string(),
            descriptor: descriptor.cloned(),
            created_at: now,
        };
        let encoded = student.descriptor.as_ref().map(serde_json::to_string).transpose()?;

        self.conn
            .execute(
                "INSERT INTO students (id, roll_no, full_name, face_descriptor, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    student.id,
                    student.roll_no,
                    student.full_name,
                    encoded,
                    encode_timestamp(&student.created_at)
                ],
            )
            .map_err(|e| match is_unique_violation(&e) {
                true => StoreError::DuplicateRollNo(roll_no.to_string()),
                false => e.into(),
            })?;

        tracing::info!(id = %student.id, roll_no = %student.roll_no, "student registered");
        Ok(student)
    }

    pub fn roll_no_taken(&self, roll_no: &str) -> Result<bool, StoreError> {
        let found = self
            .conn
            .query_row("SELECT 1 FROM students WHERE roll_no = ?1", [roll_no.trim()], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// All students, oldest first.
    pub fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, roll_no, full_name, face_descriptor, created_at
             FROM students ORDER BY created_at, roll_no",
        )?;
        let students = stmt
            .query_map([], student_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(students)
    }

    pub fn get_student(&self, id: &str) -> Result<Option<Student>, StoreError> {
        let student = self
            .conn
            .query_row(
                "SELECT id, roll_no, full_name, face_descriptor, created_at
                 FROM students WHERE id = ?1",
                [id],
                student_from_row,
            )
            .optional()?;
        Ok(student)
    }

    /// Record `status` for `student_id` on the calendar day of `at`.
    pub fn mark_attendance(
        &self,
        student_id: &str,
        status: AttendanceStatus,
        at: DateTime<Local>,
    ) -> Result<AttendanceRecord, StoreError> {
        if self.get_student(student_id)?.is_none() {
            return Err(StoreError::StudentNotFound(student_id.to_string()));
        }

        let record = AttendanceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            student_id: student_id.to_string(),
            date: at.date_naive(),
            recorded_at: at,
            status,
        };

        self.conn
            .execute(
                "INSERT INTO attendance (id, student_id, date, recorded_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id,
                    record.student_id,
                    record.date.format(DATE_FORMAT).to_string(),
                    encode_timestamp(&record.recorded_at),
                    record.status.as_str()
                ],
            )
            .map_err(|e| match is_unique_violation(&e) {
                true => StoreError::AlreadyMarkedToday,
                false => e.into(),
            })?;

        tracing::debug!(student_id, %status, date = %record.date, "attendance row inserted");
        Ok(record)
    }

    /// The day's marks joined with student details, in recording order.
    pub fn attendance_for_day(&self, date: NaiveDate) -> Result<Vec<DailyEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT a.id, a.student_id, a.date, a.recorded_at, a.status, s.roll_no, s.full_name
             FROM attendance a JOIN students s ON s.id = a.student_id
             WHERE a.date = ?1
             ORDER BY a.recorded_at",
        )?;
        let entries = stmt
            .query_map([date.format(DATE_FORMAT).to_string()], |row| {
                Ok(DailyEntry {
                    record: AttendanceRecord {
                        id: row.get(0)?,
                        student_id: row.get(1)?,
                        date: parse_date(2, row.get(2)?)?,
                        recorded_at: parse_timestamp(3, row.get(3)?)?,
                        status: row
                            .get::<_, String>(4)?
                            .parse()
                            .map_err(|e| conversion_error(4, e))?,
                    },
                    roll_no: row.get(5)?,
                    full_name: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

impl AttendanceRecorder for Store {
    fn record(
        &self,
        student_id: &str,
        status: AttendanceStatus,
        at: DateTime<Local>,
    ) -> Result<AttendanceRecord, RecordError> {
        Ok(self.mark_attendance(student_id, status, at)?)
    }
}

/// Store handle shared between the engine thread and the D-Bus service.
#[derive(Clone)]
pub struct SharedStore(Arc<Mutex<Store>>);

impl SharedStore {
    pub fn new(store: Store) -> Self {
        Self(Arc::new(Mutex::new(store)))
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Store>, StoreError> {
        self.0.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl AttendanceRecorder for SharedStore {
    fn record(
        &self,
        student_id: &str,
        status: AttendanceStatus,
        at: DateTime<Local>,
    ) -> Result<AttendanceRecord, RecordError> {
        Ok(self.lock()?.mark_attendance(student_id, status, at)?)
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || f.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    let descriptor = row
        .get::<_, Option<String>>(3)?
        .map(|raw| serde_json::from_str::<Embedding>(&raw).map_err(|e| conversion_error(3, e)))
        .transpose()?;
    Ok(Student {
        id: row.get(0)?,
        roll_no: row.get(1)?,
        full_name: row.get(2)?,
        descriptor,
        created_at: parse_timestamp(4, row.get(4)?)?,
    })
}

fn encode_timestamp<Tz: TimeZone>(t: &DateTime<Tz>) -> String {
    t.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(idx: usize, raw: String) -> rusqlite::Result<DateTime<Local>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Local))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_date(idx: usize, raw: String) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(&raw, DATE_FORMAT).map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

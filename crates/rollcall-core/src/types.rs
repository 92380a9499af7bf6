use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A 2-D landmark position in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Six contour points per eye, in canonical order (outer corner, two upper
/// lid points, inner corner, two lower lid points).
///
/// Stored as vectors so that a detector returning a short or empty contour
/// can still be represented; the liveness gate treats that as degenerate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EyeLandmarks {
    pub left: Vec<Point>,
    pub right: Vec<Point>,
}

/// Axis-aligned face box in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Face descriptor vector (128-dimensional for the bundled descriptor network).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance between two descriptors.
    ///
    /// Descriptors of different dimensionality were produced by different
    /// models and are never comparable: the distance is `f32::INFINITY`.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Everything the face model reports for the single face in a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub confidence: f32,
    pub face: FaceBox,
    pub eyes: EyeLandmarks,
    pub embedding: Embedding,
}

/// A registered student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub roll_no: String,
    pub full_name: String,
    /// Absent for rows created without a usable capture.
    pub descriptor: Option<Embedding>,
    pub created_at: DateTime<Local>,
}

/// Attendance status. Only `Present` is produced by the scanner; the other
/// two come from manual marks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttendanceStatus {
    #[default]
    Present,
    Absent,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "Present",
            Self::Absent => "Absent",
            Self::Late => "Late",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown attendance status: {0:?} (expected Present, Absent or Late)")]
pub struct ParseStatusError(pub String);

impl FromStr for AttendanceStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Ok(Self::Present),
            "absent" => Ok(Self::Absent),
            "late" => Ok(Self::Late),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

/// One attendance mark. At most one exists per student per calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub student_id: String,
    pub date: NaiveDate,
    pub recorded_at: DateTime<Local>,
    pub status: AttendanceStatus,
}

/// A label (the student's roll number) with its reference descriptors.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledDescriptor {
    pub label: String,
    pub descriptors: Vec<Embedding>,
}

/// Identity attached to a successful match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRef {
    pub id: String,
    pub roll_no: String,
    pub full_name: String,
}

/// Reference descriptors for one scanning session.
///
/// Built once from the student list when scanning starts and read-only
/// afterwards. Label order follows the student list, which keeps tie
/// breaking in the matcher deterministic.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    labeled: Vec<LabeledDescriptor>,
    students: HashMap<String, StudentRef>,
}

impl Gallery {
    /// Build the gallery, skipping students registered without a descriptor.
    pub fn from_students(students: &[Student]) -> Self {
        let mut gallery = Self::default();
        for student in students {
            let Some(descriptor) = &student.descriptor else {
                tracing::debug!(roll_no = %student.roll_no, "student has no descriptor; skipped");
                continue;
            };
            gallery.labeled.push(LabeledDescriptor {
                label: student.roll_no.clone(),
                descriptors: vec![descriptor.clone()],
            });
            gallery.students.insert(
                student.roll_no.clone(),
                StudentRef {
                    id: student.id.clone(),
                    roll_no: student.roll_no.clone(),
                    full_name: student.full_name.clone(),
                },
            );
        }
        gallery
    }

    pub fn labeled(&self) -> &[LabeledDescriptor] {
        &self.labeled
    }

    pub fn student(&self, label: &str) -> Option<&StudentRef> {
        self.students.get(label)
    }

    pub fn len(&self) -> usize {
        self.labeled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labeled.is_empty()
    }
}

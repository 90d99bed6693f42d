//! Row types, input validation and gallery-label conventions.

use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::Serialize;

use crate::StoreError;

/// The only status written by this crate.
pub const STATUS_PRESENT: &str = "Present";

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";
pub(crate) const TIME_FORMAT: &str = "%H:%M:%S";

/// A registered student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Student {
    pub id: i64,
    pub student_id: String,
    pub name: String,
    pub registered_date: NaiveDate,
}

/// One row of the `attendance` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub student_id: String,
    pub name: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: String,
}

/// Outcome of a single attendance mark. None of these are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
    /// A new record was written.
    Marked(AttendanceRecord),
    /// The student already has a record for that date.
    AlreadyMarked { student_id: String, name: String },
    /// No registered student has this ID.
    UnknownStudent(String),
}

impl MarkOutcome {
    pub fn is_marked(&self) -> bool {
        matches!(self, MarkOutcome::Marked(_))
    }
}

/// Result of marking a selection of students at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkSummary {
    pub marked: Vec<String>,
    pub already_marked: Vec<String>,
    pub unknown: Vec<String>,
}

impl MarkSummary {
    pub fn marked_count(&self) -> usize {
        self.marked.len()
    }
}

/// Check a registration form: non-blank name, non-blank alphanumeric ID.
pub fn validate_student(name: &str, student_id: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::InvalidName);
    }
    if student_id.trim().is_empty() {
        return Err(StoreError::InvalidStudentId);
    }
    if !student_id.chars().all(char::is_alphanumeric) {
        return Err(StoreError::NonAlphanumericId(student_id.to_string()));
    }
    Ok(())
}

/// Split a gallery label `"<student_id>_<name>"` into its parts.
///
/// A label without `_` is both the ID and the name.
pub fn parse_label(label: &str) -> (&str, &str) {
    match label.split_once('_') {
        Some((id, name)) if !name.is_empty() => (id, name),
        Some((id, _)) => (id, id),
        None => (label, label),
    }
}

/// Wall-clock time at one-second resolution, as stored.
pub(crate) fn truncate_to_seconds(time: NaiveTime) -> NaiveTime {
    time.with_nanosecond(0).unwrap_or(time)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_student_ok() {
        assert!(validate_student("Ada Lovelace", "S1815").is_ok());
        assert!(validate_student("Émile", "É42").is_ok());
    }

    #[test]
    fn test_validate_student_blank_name() {
        assert!(matches!(validate_student("   ", "S1"), Err(StoreError::InvalidName)));
    }

    #[test]
    fn test_validate_student_blank_id() {
        assert!(matches!(validate_student("Ada", " "), Err(StoreError::InvalidStudentId)));
    }

    #[test]
    fn test_validate_student_non_alphanumeric() {
        for id in ["S-1", "S_1", "S 1", " S1"] {
            assert!(
                matches!(validate_student("Ada", id), Err(StoreError::NonAlphanumericId(_))),
                "{id:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_label() {
        assert_eq!(parse_label("42_Ada Lovelace"), ("42", "Ada Lovelace"));
        assert_eq!(parse_label("42_Ada_Byron"), ("42", "Ada_Byron"));
        assert_eq!(parse_label("42"), ("42", "42"));
        assert_eq!(parse_label("42_"), ("42", "42"));
    }

    #[test]
    fn test_truncate_to_seconds() {
        let t = NaiveTime::from_hms_milli_opt(8, 30, 15, 999).unwrap();
        assert_eq!(truncate_to_seconds(t), NaiveTime::from_hms_opt(8, 30, 15).unwrap());
    }
}

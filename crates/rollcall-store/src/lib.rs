//! rollcall-store — Student registry and attendance log on SQLite.
//!
//! Two tables, `students` and `attendance`. A student has at most one
//! attendance record per calendar date.

pub mod records;
pub mod report;
pub mod store;

pub use records::{
    parse_label, validate_student, AttendanceRecord, MarkOutcome, MarkSummary, Student,
    STATUS_PRESENT,
};
pub use report::{default_report_name, AttendanceStats, Report, StudentFrequency};
pub use store::{AttendanceStore, StoreError};

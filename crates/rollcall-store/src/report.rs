//! Attendance statistics and report export.

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::records::{AttendanceRecord, Student};
use crate::store::{AttendanceStore, StoreError};

const TOP_STUDENTS: usize = 10;

/// How often one student appears in the attendance log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudentFrequency {
    pub student_id: String,
    pub name: String,
    pub days: usize,
}

/// Aggregate view over every attendance record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceStats {
    pub generated_at: NaiveDateTime,
    pub total_records: usize,
    pub unique_students: usize,
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
    /// Mean number of records per date that has any records.
    pub daily_mean: f64,
    pub daily_max: usize,
    pub daily_min: usize,
    /// Most frequent attendees, at most ten.
    pub top_students: Vec<StudentFrequency>,
}

impl AttendanceStats {
    /// `None` when there are no records.
    pub fn from_records(records: &[AttendanceRecord], generated_at: NaiveDateTime) -> Option<Self> {
        if records.is_empty() {
            return None;
        }

        let mut per_day: BTreeMap<NaiveDate, usize> = BTreeMap::new();
        let mut per_student: BTreeMap<(&str, &str), usize> = BTreeMap::new();
        let mut students = HashSet::new();
        for r in records {
            *per_day.entry(r.date).or_default() += 1;
            *per_student.entry((r.student_id.as_str(), r.name.as_str())).or_default() += 1;
            students.insert(r.student_id.as_str());
        }

        let (&first_date, _) = per_day.first_key_value()?;
        let (&last_date, _) = per_day.last_key_value()?;
        let daily_max = per_day.values().copied().max().unwrap_or(0);
        let daily_min = per_day.values().copied().min().unwrap_or(0);
        let daily_mean = records.len() as f64 / per_day.len() as f64;

        let mut top_students: Vec<StudentFrequency> = per_student
            .into_iter()
            .map(|((student_id, name), days)| StudentFrequency {
                student_id: student_id.to_string(),
                name: name.to_string(),
                days,
            })
            .collect();
        // Stable sort keeps (student_id, name) order among equal counts.
        top_students.sort_by(|a, b| b.days.cmp(&a.days));
        top_students.truncate(TOP_STUDENTS);

        Some(Self {
            generated_at,
            total_records: records.len(),
            unique_students: students.len(),
            first_date,
            last_date,
            daily_mean,
            daily_max,
            daily_min,
            top_students,
        })
    }
}

impl fmt::Display for AttendanceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ATTENDANCE STATISTICS REPORT")?;
        writeln!(f, "Generated on: {}", self.generated_at.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(f)?;
        writeln!(f, "OVERVIEW:")?;
        writeln!(f, "Total attendance records: {}", self.total_records)?;
        writeln!(f, "Unique students: {}", self.unique_students)?;
        writeln!(f, "Date range: {} to {}", self.first_date, self.last_date)?;
        writeln!(f)?;
        writeln!(f, "DAILY ATTENDANCE STATISTICS:")?;
        writeln!(f, "Average daily attendance: {:.2}", self.daily_mean)?;
        writeln!(f, "Maximum daily attendance: {}", self.daily_max)?;
        writeln!(f, "Minimum daily attendance: {}", self.daily_min)?;
        writeln!(f)?;
        writeln!(f, "STUDENT ATTENDANCE FREQUENCY:")?;
        for s in &self.top_students {
            writeln!(f, "{} ({}): {} days", s.name, s.student_id, s.days)?;
        }
        Ok(())
    }
}

/// Full dump of both tables.
#[derive(Debug, Serialize)]
pub struct Report {
    pub generated_at: NaiveDateTime,
    pub attendance: Vec<AttendanceRecord>,
    pub students: Vec<Student>,
}

/// `attendance_report_YYYYmmdd_HHMMSS.json`
pub fn default_report_name(at: NaiveDateTime) -> String {
    format!("attendance_report_{}.json", at.format("%Y%m%d_%H%M%S"))
}

impl AttendanceStore {
    pub fn statistics(
        &self,
        generated_at: NaiveDateTime,
    ) -> Result<Option<AttendanceStats>, StoreError> {
        let records = self.list_attendance()?;
        Ok(AttendanceStats::from_records(&records, generated_at))
    }

    pub fn report(&self, generated_at: NaiveDateTime) -> Result<Report, StoreError> {
        Ok(Report {
            generated_at,
            attendance: self.list_attendance()?,
            students: self.list_students()?,
        })
    }

    /// Write the JSON report to `path`. Fails if both tables are empty.
    pub fn export_report(
        &self,
        path: &Path,
        generated_at: NaiveDateTime,
    ) -> Result<Report, StoreError> {
        let report = self.report(generated_at)?;
        if report.attendance.is_empty() && report.students.is_empty() {
            return Err(StoreError::NothingToExport);
        }

        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).map_err(|source| StoreError::Io {
            path: PathBuf::from(path),
            source,
        })?;

        tracing::info!(
            path = %path.display(),
            attendance = report.attendance.len(),
            students = report.students.len(),
            "report exported"
        );
        Ok(report)
    }
}

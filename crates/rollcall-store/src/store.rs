//! SQLite-backed student registry and attendance log.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::records::{
    truncate_to_seconds, validate_student, AttendanceRecord, MarkOutcome, MarkSummary, Student,
    DATE_FORMAT, STATUS_PRESENT, TIME_FORMAT,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("please enter a valid name")]
    InvalidName,
    #[error("please enter a valid student ID")]
    InvalidStudentId,
    #[error("student ID should contain only letters and numbers: {0:?}")]
    NonAlphanumericId(String),
    #[error("student ID {0} already exists")]
    DuplicateStudent(String),
    #[error("no students selected")]
    EmptySelection,
    #[error("no data to export")]
    NothingToExport,
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

const STUDENT_COLUMNS: &str = "id, student_id, name, registered_date";
const ATTENDANCE_COLUMNS: &str = "id, student_id, name, date, time, status";

/// Handle to the attendance database.
pub struct AttendanceStore {
    conn: Connection,
}

impl AttendanceStore {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(db_path)?;
        let store = Self { conn };
        store.ensure_schema()?;
        tracing::debug!(path = %db_path.display(), "attendance store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS attendance (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              student_id TEXT,
              name TEXT,
              date TEXT,
              time TEXT,
              status TEXT
            );

            CREATE TABLE IF NOT EXISTS students (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              student_id TEXT UNIQUE,
              name TEXT,
              registered_date TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_attendance_student_date
              ON attendance(student_id, date);
            "#,
        )?;
        Ok(())
    }

    /// Register a new student. The ID must be unique.
    pub fn register_student(
        &self,
        name: &str,
        student_id: &str,
        registered_on: NaiveDate,
    ) -> Result<Student, StoreError> {
        validate_student(name, student_id)?;
        let name = name.trim();

        let inserted = self.conn.execute(
            "INSERT INTO students (student_id, name, registered_date) VALUES (?1, ?2, ?3)",
            params![student_id, name, registered_on.format(DATE_FORMAT).to_string()],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(StoreError::DuplicateStudent(student_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(student_id, name, "student registered");
        Ok(Student {
            id: self.conn.last_insert_rowid(),
            student_id: student_id.to_string(),
            name: name.to_string(),
            registered_date: registered_on,
        })
    }

    pub fn find_student(&self, student_id: &str) -> Result<Option<Student>, StoreError> {
        let student = self
            .conn
            .query_row(
                &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE student_id = ?1"),
                [student_id],
                student_from_row,
            )
            .optional()?;
        Ok(student)
    }

    /// All registered students, ordered by name.
    pub fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {STUDENT_COLUMNS} FROM students ORDER BY name, student_id"))?;
        let rows = stmt.query_map([], student_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Record `student_id` present at `at`, unless already marked that day.
    pub fn mark_present(
        &self,
        student_id: &str,
        name: &str,
        at: NaiveDateTime,
    ) -> Result<MarkOutcome, StoreError> {
        insert_present(&self.conn, student_id, name, at)
    }

    /// Quick entry: mark a registered student by ID, using the stored name.
    pub fn mark_registered(
        &self,
        student_id: &str,
        at: NaiveDateTime,
    ) -> Result<MarkOutcome, StoreError> {
        let student_id = student_id.trim();
        match self.find_student(student_id)? {
            Some(student) => self.mark_present(&student.student_id, &student.name, at),
            None => {
                tracing::debug!(student_id, "quick entry for unregistered ID");
                Ok(MarkOutcome::UnknownStudent(student_id.to_string()))
            }
        }
    }

    /// Manual selection: mark every selected registered student in one
    /// transaction.
    pub fn mark_many<S: AsRef<str>>(
        &mut self,
        student_ids: &[S],
        at: NaiveDateTime,
    ) -> Result<MarkSummary, StoreError> {
        if student_ids.is_empty() {
            return Err(StoreError::EmptySelection);
        }

        let tx = self.conn.transaction()?;
        let mut summary = MarkSummary::default();
        for student_id in student_ids {
            let student_id = student_id.as_ref().trim();
            let student = tx
                .query_row(
                    &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE student_id = ?1"),
                    [student_id],
                    student_from_row,
                )
                .optional()?;
            let Some(student) = student else {
                summary.unknown.push(student_id.to_string());
                continue;
            };

            match insert_present(&tx, &student.student_id, &student.name, at)? {
                MarkOutcome::Marked(_) => summary.marked.push(student.student_id),
                _ => summary.already_marked.push(student.student_id),
            }
        }
        tx.commit()?;

        tracing::info!(
            marked = summary.marked.len(),
            already_marked = summary.already_marked.len(),
            unknown = summary.unknown.len(),
            "manual attendance committed"
        );
        Ok(summary)
    }

    pub fn is_marked(&self, student_id: &str, date: NaiveDate) -> Result<bool, StoreError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM attendance WHERE student_id = ?1 AND date = ?2",
                params![student_id, date.format(DATE_FORMAT).to_string()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// All attendance records, newest first.
    pub fn list_attendance(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ATTENDANCE_COLUMNS} FROM attendance ORDER BY date DESC, time DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], attendance_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

/// Insert a `Present` row unless one exists for (student, date).
fn insert_present(
    conn: &Connection,
    student_id: &str,
    name: &str,
    at: NaiveDateTime,
) -> Result<MarkOutcome, StoreError> {
    let date = at.date();
    let time = truncate_to_seconds(at.time());

    let changed = conn.execute(
        "INSERT INTO attendance (student_id, name, date, time, status)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(student_id, date) DO NOTHING",
        params![
            student_id,
            name,
            date.format(DATE_FORMAT).to_string(),
            time.format(TIME_FORMAT).to_string(),
            STATUS_PRESENT,
        ],
    )?;

    if changed == 0 {
        tracing::debug!(student_id, %date, "already marked");
        return Ok(MarkOutcome::AlreadyMarked {
            student_id: student_id.to_string(),
            name: name.to_string(),
        });
    }

    tracing::info!(student_id, name, %date, %time, "marked present");
    Ok(MarkOutcome::Marked(AttendanceRecord {
        id: conn.last_insert_rowid(),
        student_id: student_id.to_string(),
        name: name.to_string(),
        date,
        time,
        status: STATUS_PRESENT.to_string(),
    }))
}

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: row.get(0)?,
        student_id: row.get(1)?,
        name: row.get(2)?,
        registered_date: parse_date(row, 3)?,
    })
}

fn attendance_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        id: row.get(0)?,
        student_id: row.get(1)?,
        name: row.get(2)?,
        date: parse_date(row, 3)?,
        time: parse_time(row, 4)?,
        status: row.get(5)?,
    })
}

fn parse_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, DATE_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveTime> {
    let raw: String = row.get(idx)?;
    NaiveTime::parse_from_str(&raw, TIME_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

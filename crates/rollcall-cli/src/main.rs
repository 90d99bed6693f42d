use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use clap::{Parser, Subcommand};
use rollcall_core::{enroll_references, Embedding, Gallery, Matcher, NearestMatcher};
use rollcall_store::{default_report_name, validate_student, AttendanceStore, MarkOutcome, StoreError};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

mod config;
mod session;

use config::Config;
use session::{FaceOutcome, SessionError, StoreRecorder};

#[derive(Parser)]
#[command(name = "rollcall", about = "Classroom attendance with face-embedding matching")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new student
    Register {
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Student ID (letters and digits only)
        #[arg(short, long)]
        id: String,
    },
    /// Register a student and create their enrollment folder from reference embeddings
    Enroll {
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Student ID (letters and digits only)
        #[arg(short, long)]
        id: String,
        /// JSON files, one reference embedding each
        #[arg(required = true)]
        embeddings: Vec<PathBuf>,
    },
    /// List registered students
    Students,
    /// Build the reference gallery from the enrollment directory
    Encode {
        /// Enrollment directory (defaults to the configured students dir)
        #[arg(long)]
        students_dir: Option<PathBuf>,
    },
    /// Match a single query embedding against the gallery
    Identify {
        /// JSON file holding one embedding
        #[arg(short, long)]
        embedding: PathBuf,
    },
    /// Mark attendance from per-frame face embeddings
    Mark {
        /// JSON-lines file, one array of embeddings per frame ("-" for stdin)
        #[arg(short, long, default_value = "-")]
        frames: String,
    },
    /// Mark the selected registered students present
    Manual {
        /// Student IDs
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Mark one registered student present by ID
    Quick {
        /// Student ID
        id: String,
    },
    /// List attendance records, newest first
    Records {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show attendance statistics
    Stats,
    /// Export attendance and students as a JSON report
    Export {
        /// Output file (defaults to attendance_report_<timestamp>.json)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Register { name, id } => {
            let store = open_store(&config)?;
            let student = store.register_student(&name, &id, now().date())?;
            println!(
                "Student {} (ID: {}) registered successfully",
                student.name, student.student_id
            );
        }
        Commands::Enroll {
            name,
            id,
            embeddings,
        } => {
            let (dir, registered) = enroll(&config, &name, &id, &embeddings)?;
            if !registered {
                println!("Student ID {id} was already registered");
            }
            println!(
                "Enrolled {} reference embeddings into {}; run `rollcall encode` to update the gallery",
                embeddings.len(),
                dir.display()
            );
        }
        Commands::Students => {
            let students = open_store(&config)?.list_students()?;
            if students.is_empty() {
                println!("No students registered yet");
            }
            for s in students {
                println!("{:<12} {:<30} {}", s.student_id, s.name, s.registered_date);
            }
        }
        Commands::Encode { students_dir } => {
            let dir = students_dir.unwrap_or_else(|| config.students_dir.clone());
            let gallery = Gallery::build_from_dir(&dir)?;
            if gallery.is_empty() {
                anyhow::bail!("no usable reference embeddings under {}", dir.display());
            }
            gallery.save(&config.gallery_path)?;
            println!(
                "Encodings generated for {} students -> {}",
                gallery.len(),
                config.gallery_path.display()
            );
        }
        Commands::Identify { embedding } => {
            let gallery = load_gallery(&config)?;
            let query = read_embedding(&embedding)?;
            let matcher = NearestMatcher::new(config.distance);
            let result = matcher.compare(&query, &gallery, config.match_threshold)?;
            match (result.label, result.distance) {
                (Some(label), Some(d)) => println!("{label} (distance {d:.4})"),
                (_, Some(d)) => println!("Unknown (nearest distance {d:.4})"),
                _ => println!("Unknown"),
            }
        }
        Commands::Mark { frames } => run_mark(&config, &frames).await?,
        Commands::Manual { ids } => {
            let mut store = open_store(&config)?;
            let summary = store.mark_many(ids.as_slice(), now())?;
            for id in &summary.already_marked {
                println!("{id}: already marked today");
            }
            for id in &summary.unknown {
                println!("{id}: not registered");
            }
            println!("Marked {} students as present", summary.marked_count());
        }
        Commands::Quick { id } => {
            let store = open_store(&config)?;
            match store.mark_registered(&id, now())? {
                MarkOutcome::Marked(r) => println!("{} ({}) marked present", r.name, r.student_id),
                MarkOutcome::AlreadyMarked { student_id, name } => {
                    println!("{name} ({student_id}) already marked today")
                }
                MarkOutcome::UnknownStudent(id) => println!("Student ID {id} not found"),
            }
        }
        Commands::Records { json } => {
            let records = open_store(&config)?.list_attendance()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No attendance records found");
            } else {
                for r in records {
                    println!(
                        "{:>5}  {:<12} {:<30} {} {} {}",
                        r.id, r.student_id, r.name, r.date, r.time, r.status
                    );
                }
            }
        }
        Commands::Stats => match open_store(&config)?.statistics(now())? {
            Some(stats) => print!("{stats}"),
            None => println!("No attendance data available"),
        },
        Commands::Export { out } => {
            let at = now();
            let path = out.unwrap_or_else(|| PathBuf::from(default_report_name(at)));
            let report = open_store(&config)?.export_report(&path, at)?;
            println!(
                "Exported {} attendance records and {} students to {}",
                report.attendance.len(),
                report.students.len(),
                path.display()
            );
        }
    }

    Ok(())
}

/// Feed every frame of the input through a session and print what happened.
async fn run_mark(config: &Config, frames: &str) -> Result<()> {
    let gallery = load_gallery(config)?;
    if gallery.is_empty() {
        anyhow::bail!("gallery is empty; run `rollcall encode` first");
    }
    let handle = session::spawn_session(
        gallery,
        config.match_threshold,
        config.distance,
        StoreRecorder::new(&config.db_path),
    )?;

    let input: Box<dyn AsyncBufRead + Unpin + Send> = if frames == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = tokio::fs::File::open(frames)
            .await
            .with_context(|| format!("opening {frames}"))?;
        Box::new(BufReader::new(file))
    };
    let mut lines = input.lines();

    let (mut marked, mut repeated, mut unknown, mut failed, mut rejected) =
        (0usize, 0usize, 0usize, 0usize, 0usize);
    let mut lineno = 0usize;
    while let Some(faces) = next_frame(&mut lines, &mut lineno).await? {
        match handle.submit(faces, now()).await {
            Ok(outcomes) => {
                for outcome in outcomes {
                    match outcome {
                        FaceOutcome::Marked { label, record } => {
                            marked += 1;
                            println!("{label} marked present at {}", record.time);
                        }
                        FaceOutcome::AlreadyMarked { .. } => repeated += 1,
                        FaceOutcome::Unknown { .. } => unknown += 1,
                        FaceOutcome::Failed { label, error } => {
                            failed += 1;
                            eprintln!("{label}: could not record attendance: {error}");
                        }
                    }
                }
            }
            Err(SessionError::Match(e)) => {
                rejected += 1;
                tracing::warn!(frame = lineno, error = %e, "frame rejected");
            }
            Err(e) => return Err(e.into()),
        }
    }

    println!(
        "Attendance marking completed: {marked} marked, {repeated} already present, {unknown} unknown faces, {failed} failed writes, {rejected} rejected frames"
    );
    Ok(())
}

/// Read the next non-blank frame: a JSON array of embeddings per line.
///
/// `lineno` tracks the 1-based line last read. Returns `None` at end of input.
async fn next_frame<R: AsyncBufRead + Unpin>(
    lines: &mut Lines<R>,
    lineno: &mut usize,
) -> Result<Option<Vec<Embedding>>> {
    while let Some(line) = lines
        .next_line()
        .await
        .with_context(|| format!("reading frame {}", *lineno + 1))?
    {
        *lineno += 1;
        if line.trim().is_empty() {
            continue;
        }
        let faces: Vec<Vec<f32>> =
            serde_json::from_str(&line).with_context(|| format!("parsing frame {lineno}"))?;
        return Ok(Some(faces.into_iter().map(Embedding::new).collect()));
    }
    Ok(None)
}

/// Create `<students_dir>/<id>_<name>/` from the given reference files and
/// register the student. Returns the folder and whether the student was newly
/// registered; an ID already in the registry is kept as is.
fn enroll(config: &Config, name: &str, id: &str, paths: &[PathBuf]) -> Result<(PathBuf, bool)> {
    validate_student(name, id)?;
    let references = paths
        .iter()
        .map(|p| read_embedding(p))
        .collect::<Result<Vec<_>>>()?;

    let label = format!("{id}_{}", name.trim());
    let dir = enroll_references(&config.students_dir, &label, &references)?;

    match open_store(config)?.register_student(name, id, now().date()) {
        Ok(_) => Ok((dir, true)),
        Err(StoreError::DuplicateStudent(_)) => Ok((dir, false)),
        Err(e) => Err(e.into()),
    }
}

fn open_store(config: &Config) -> Result<AttendanceStore> {
    AttendanceStore::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))
}

fn load_gallery(config: &Config) -> Result<Gallery> {
    Gallery::load(&config.gallery_path).with_context(|| {
        format!(
            "loading gallery {}; run `rollcall encode` first",
            config.gallery_path.display()
        )
    })
}

fn read_embedding(path: &Path) -> Result<Embedding> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str::<Vec<f32>>(&raw)
        .map(Embedding::new)
        .or_else(|_| serde_json::from_str::<Embedding>(&raw))
        .with_context(|| format!("parsing {}", path.display()))
}

/// Local wall-clock time; attendance dates follow the local calendar.
fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::GalleryError;

    #[tokio::test]
    async fn test_next_frame_skips_blank_lines() {
        let input: &[u8] = b"[[0.0, 1.0]]\n\n   \n[]\n[[1.0, 2.0], [3.0]]\n";
        let mut lines = input.lines();
        let mut lineno = 0;

        let first = next_frame(&mut lines, &mut lineno).await.unwrap().unwrap();
        assert_eq!(first, vec![Embedding::new(vec![0.0, 1.0])]);
        assert_eq!(lineno, 1);

        let empty = next_frame(&mut lines, &mut lineno).await.unwrap().unwrap();
        assert!(empty.is_empty());
        assert_eq!(lineno, 4);

        let pair = next_frame(&mut lines, &mut lineno).await.unwrap().unwrap();
        assert_eq!(pair.len(), 2);
        assert_eq!(pair[1].dim(), 1);

        assert!(next_frame(&mut lines, &mut lineno).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_frame_reports_bad_line() {
        let input: &[u8] = b"[[0.0]]\nnot json\n";
        let mut lines = input.lines();
        let mut lineno = 0;
        next_frame(&mut lines, &mut lineno).await.unwrap();
        let err = next_frame(&mut lines, &mut lineno).await.unwrap_err();
        assert!(err.to_string().contains("parsing frame 2"));
    }

    #[test]
    fn test_enroll_creates_folder_and_registers() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_data_dir(dir.path());
        let reference = dir.path().join("face.json");
        std::fs::write(&reference, "[0.5, 0.5]").unwrap();

        let (folder, registered) = enroll(&config, "Dana", "D7", &[reference.clone()]).unwrap();
        assert!(registered);
        assert_eq!(folder, config.students_dir.join("D7_Dana"));

        let gallery = Gallery::build_from_dir(&config.students_dir).unwrap();
        assert_eq!(gallery.labels().collect::<Vec<_>>(), vec!["D7_Dana"]);
        let student = open_store(&config).unwrap().find_student("D7").unwrap().unwrap();
        assert_eq!(student.name, "Dana");

        let err = enroll(&config, "Dana", "D7", &[reference]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GalleryError>(),
            Some(GalleryError::AlreadyEnrolled(_))
        ));
    }

    #[test]
    fn test_enroll_rejects_invalid_id_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_data_dir(dir.path());
        let reference = dir.path().join("face.json");
        std::fs::write(&reference, "[0.5, 0.5]").unwrap();

        let err = enroll(&config, "Dana", "D-7", &[reference]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::NonAlphanumericId(_))
        ));
        assert!(!config.students_dir.exists());
    }
}

use anyhow::{Context, Result};
use rollcall_core::{DistanceKind, DEFAULT_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Runtime configuration.
///
/// Resolved as defaults, then an optional TOML file, then `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Path to the saved reference gallery (JSON).
    pub gallery_path: PathBuf,
    /// Enrollment directory: one subfolder of reference embeddings per student.
    pub students_dir: PathBuf,
    /// Maximum (exclusive) distance accepted as a match.
    pub match_threshold: f32,
    /// Distance metric used by the matcher.
    pub distance: DistanceKind,
}

/// Optional keys of the TOML config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    gallery_path: Option<PathBuf>,
    students_dir: Option<PathBuf>,
    match_threshold: Option<f32>,
    distance: Option<DistanceKind>,
}

impl Config {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            db_path: data_dir.join("attendance.db"),
            gallery_path: data_dir.join("gallery.json"),
            students_dir: data_dir.join("students"),
            match_threshold: DEFAULT_THRESHOLD,
            distance: DistanceKind::Euclidean,
        }
    }

    /// Load from the config file (if any) and `ROLLCALL_*` environment variables.
    pub fn load() -> Result<Self> {
        let data_dir = data_dir();
        let mut config = Self::with_data_dir(&data_dir);

        let explicit = std::env::var("ROLLCALL_CONFIG").ok().map(PathBuf::from);
        let config_path = explicit
            .clone()
            .unwrap_or_else(|| data_dir.join("rollcall.toml"));
        if config_path.exists() {
            config.apply_file(&config_path)?;
            tracing::debug!(path = %config_path.display(), "config file applied");
        } else if explicit.is_some() {
            anyhow::bail!("config file not found: {}", config_path.display());
        }

        config.apply_env();
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        self.apply_toml(&raw)
            .with_context(|| format!("parsing config {}", path.display()))
    }

    fn apply_toml(&mut self, raw: &str) -> Result<()> {
        let file: FileConfig = toml::from_str(raw)?;
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.gallery_path {
            self.gallery_path = v;
        }
        if let Some(v) = file.students_dir {
            self.students_dir = v;
        }
        if let Some(v) = file.match_threshold {
            self.match_threshold = v;
        }
        if let Some(v) = file.distance {
            self.distance = v;
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_GALLERY_PATH") {
            self.gallery_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_STUDENTS_DIR") {
            self.students_dir = PathBuf::from(v);
        }
        self.match_threshold = env_parse("ROLLCALL_MATCH_THRESHOLD", self.match_threshold);
        self.distance = env_parse("ROLLCALL_DISTANCE", self.distance);
    }
}

/// `$ROLLCALL_DATA_DIR`, else `$XDG_DATA_HOME/rollcall`, else `~/.local/share/rollcall`.
fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ROLLCALL_DATA_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "ignoring unparsable environment value");
            default
        }),
        Err(_) => default,
    }
}

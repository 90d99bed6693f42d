//! Reference gallery: one mean embedding per enrolled identity.
//!
//! Entries keep insertion order, which the matcher relies on for its
//! first-seen tie-break. Every entry has the same, positive dimensionality.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const GALLERY_FILE_VERSION: u32 = 1;
const REFERENCE_EXTENSION: &str = "json";

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("duplicate gallery label: {0}")]
    DuplicateLabel(String),
    #[error("empty embedding for {0}")]
    EmptyEmbedding(String),
    #[error("dimension mismatch for {label}: expected {expected}, got {actual}")]
    DimensionMismatch {
        label: String,
        expected: usize,
        actual: usize,
    },
    #[error("no embeddings to average")]
    NoEmbeddings,
    #[error("enrollment directory not found: {0}")]
    DirectoryNotFound(PathBuf),
    #[error("identity already enrolled: {0}")]
    AlreadyEnrolled(PathBuf),
    #[error("unsupported gallery file version {0}")]
    UnsupportedVersion(u32),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single known identity.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub label: String,
    pub embedding: Embedding,
}

/// Ordered, label-unique set of reference embeddings.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

/// On-disk layout of a saved gallery.
#[derive(Serialize, Deserialize)]
struct GalleryFile {
    version: u32,
    dimension: Option<usize>,
    entries: Vec<EntryRecord>,
}

#[derive(Serialize, Deserialize)]
struct EntryRecord {
    label: String,
    values: Vec<f32>,
}

/// A reference embedding file: either a bare array or `{"values": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ReferenceFile {
    Bare(Vec<f32>),
    Wrapped(Embedding),
}

impl ReferenceFile {
    fn into_embedding(self) -> Embedding {
        match self {
            ReferenceFile::Bare(values) => Embedding::new(values),
            ReferenceFile::Wrapped(embedding) => embedding,
        }
    }
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identity. Rejects duplicate labels, empty vectors and vectors
    /// whose length differs from the existing entries.
    pub fn insert(
        &mut self,
        label: impl Into<String>,
        embedding: Embedding,
    ) -> Result<(), GalleryError> {
        let label = label.into();
        if embedding.values.is_empty() {
            return Err(GalleryError::EmptyEmbedding(label));
        }
        if let Some(expected) = self.dimension() {
            if embedding.dim() != expected {
                return Err(GalleryError::DimensionMismatch {
                    label,
                    expected,
                    actual: embedding.dim(),
                });
            }
        }
        if self.entries.iter().any(|e| e.label == label) {
            return Err(GalleryError::DuplicateLabel(label));
        }
        self.entries.push(GalleryEntry { label, embedding });
        Ok(())
    }

    /// Shared dimensionality of all entries, or `None` for an empty gallery.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.dim())
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn get(&self, label: &str) -> Option<&Embedding> {
        self.entries
            .iter()
            .find(|e| e.label == label)
            .map(|e| &e.embedding)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    /// Build a gallery from an enrollment directory.
    ///
    /// Layout: `<dir>/<label>/*.json`, one reference embedding per file.
    /// Each identity's vector is the component-wise mean of its references.
    /// Unreadable files, references whose length differs from the folder's
    /// first usable one, identities without any usable reference and
    /// identities whose length differs from earlier ones are skipped with a
    /// warning.
    pub fn build_from_dir(dir: &Path) -> Result<Self, GalleryError> {
        if !dir.is_dir() {
            return Err(GalleryError::DirectoryNotFound(dir.to_path_buf()));
        }

        let mut identities = sorted_entries(dir)?;
        identities.retain(|p| p.is_dir());

        let mut gallery = Gallery::new();
        for identity_dir in identities {
            let Some(label) = identity_dir.file_name().and_then(|n| n.to_str()) else {
                tracing::warn!(path = %identity_dir.display(), "skipping non-UTF-8 identity folder");
                continue;
            };

            let references = load_references(&identity_dir)?;
            if references.is_empty() {
                tracing::warn!(label, "no usable reference embeddings; identity skipped");
                continue;
            }

            let mean = mean_embedding(&references)?;
            if let Some(expected) = gallery.dimension().filter(|&d| d != mean.dim()) {
                tracing::warn!(
                    label,
                    expected,
                    actual = mean.dim(),
                    "identity dimension mismatch; identity skipped"
                );
                continue;
            }
            tracing::debug!(label, references = references.len(), dim = mean.dim(), "identity encoded");
            gallery.insert(label, mean)?;
        }

        tracing::info!(
            dir = %dir.display(),
            identities = gallery.len(),
            dimension = ?gallery.dimension(),
            "gallery built"
        );
        Ok(gallery)
    }

    /// Load a gallery saved by [`save`](Self::save), re-checking all invariants.
    pub fn load(path: &Path) -> Result<Self, GalleryError> {
        let raw = fs::read_to_string(path).map_err(|source| GalleryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: GalleryFile = serde_json::from_str(&raw)?;
        if file.version != GALLERY_FILE_VERSION {
            return Err(GalleryError::UnsupportedVersion(file.version));
        }

        let mut gallery = Gallery::new();
        for record in file.entries {
            gallery.insert(record.label, Embedding::new(record.values))?;
        }
        if let (Some(expected), Some(actual)) = (file.dimension, gallery.dimension()) {
            if expected != actual {
                return Err(GalleryError::DimensionMismatch {
                    label: "gallery header".into(),
                    expected,
                    actual,
                });
            }
        }
        Ok(gallery)
    }

    /// Write the gallery as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), GalleryError> {
        let file = GalleryFile {
            version: GALLERY_FILE_VERSION,
            dimension: self.dimension(),
            entries: self
                .entries
                .iter()
                .map(|e| EntryRecord {
                    label: e.label.clone(),
                    values: e.embedding.values.clone(),
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| GalleryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, json).map_err(|source| GalleryError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Create the enrollment folder `<students_dir>/<label>/` and write each
/// reference as `0.json`, `1.json`, ...
///
/// Refuses an identity whose folder already exists. Returns the new folder.
pub fn enroll_references(
    students_dir: &Path,
    label: &str,
    references: &[Embedding],
) -> Result<PathBuf, GalleryError> {
    let first = references.first().ok_or(GalleryError::NoEmbeddings)?;
    for (i, reference) in references.iter().enumerate() {
        if reference.values.is_empty() {
            return Err(GalleryError::EmptyEmbedding(format!("reference #{i}")));
        }
        if reference.dim() != first.dim() {
            return Err(GalleryError::DimensionMismatch {
                label: format!("reference #{i}"),
                expected: first.dim(),
                actual: reference.dim(),
            });
        }
    }

    let identity_dir = students_dir.join(label);
    if identity_dir.exists() {
        return Err(GalleryError::AlreadyEnrolled(identity_dir));
    }
    fs::create_dir_all(&identity_dir).map_err(|source| GalleryError::Io {
        path: identity_dir.clone(),
        source,
    })?;

    for (i, reference) in references.iter().enumerate() {
        let path = identity_dir.join(format!("{i}.{REFERENCE_EXTENSION}"));
        let json = serde_json::to_string(&reference.values)?;
        fs::write(&path, json).map_err(|source| GalleryError::Io { path, source })?;
    }

    tracing::info!(label, references = references.len(), dir = %identity_dir.display(), "identity enrolled");
    Ok(identity_dir)
}

/// Component-wise mean of several embeddings of equal dimensionality.
pub fn mean_embedding(embeddings: &[Embedding]) -> Result<Embedding, GalleryError> {
    let first = embeddings.first().ok_or(GalleryError::NoEmbeddings)?;
    let dim = first.dim();
    if dim == 0 {
        return Err(GalleryError::EmptyEmbedding("mean".into()));
    }

    let mut sum = vec![0.0f32; dim];
    for (i, embedding) in embeddings.iter().enumerate() {
        if embedding.dim() != dim {
            return Err(GalleryError::DimensionMismatch {
                label: format!("reference #{i}"),
                expected: dim,
                actual: embedding.dim(),
            });
        }
        for (acc, v) in sum.iter_mut().zip(&embedding.values) {
            *acc += v;
        }
    }

    let n = embeddings.len() as f32;
    Ok(Embedding::new(sum.into_iter().map(|v| v / n).collect()))
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    let read = fs::read_dir(dir).map_err(|source| GalleryError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths: Vec<PathBuf> = read.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();
    Ok(paths)
}

fn load_references(identity_dir: &Path) -> Result<Vec<Embedding>, GalleryError> {
    let mut references = Vec::new();
    for path in sorted_entries(identity_dir)? {
        let is_reference = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(REFERENCE_EXTENSION));
        if !path.is_file() || !is_reference {
            continue;
        }

        let parsed = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<ReferenceFile>(&raw).map_err(|e| e.to_string()));
        match parsed {
            Ok(file) => {
                let embedding = file.into_embedding();
                if embedding.values.is_empty() {
                    tracing::warn!(path = %path.display(), "empty reference embedding skipped");
                    continue;
                }
                if let Some(expected) = references.first().map(Embedding::dim) {
                    if embedding.dim() != expected {
                        tracing::warn!(
                            path = %path.display(),
                            expected,
                            actual = embedding.dim(),
                            "reference dimension mismatch; reference skipped"
                        );
                        continue;
                    }
                }
                references.push(embedding);
            }
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "unreadable reference embedding skipped");
            }
        }
    }
    Ok(references)
}

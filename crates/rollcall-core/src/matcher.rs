//! Nearest-embedding identity matching.
//!
//! A query is compared against every gallery entry; the closest entry wins,
//! and is accepted only when its distance is strictly below the threshold.
//! Equal distances resolve to the entry that comes first in the gallery.

use crate::gallery::Gallery;
use crate::types::{Distance, Embedding, Euclidean};
use thiserror::Error;

/// Conventional acceptance threshold for 128-d Euclidean face encodings.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Result of matching a query embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance to the nearest entry, `None` when the gallery is empty.
    pub distance: Option<f32>,
    /// Label of the accepted entry.
    pub label: Option<String>,
}

impl MatchResult {
    fn no_match(distance: Option<f32>) -> Self {
        Self {
            matched: false,
            distance,
            label: None,
        }
    }
}

/// Strategy for comparing a query embedding against a gallery of known faces.
pub trait Matcher {
    fn compare(
        &self,
        query: &Embedding,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Nearest-neighbour matcher over a pluggable distance.
///
/// Always visits every gallery entry; there is no early exit on a close hit.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestMatcher<D = Euclidean> {
    distance: D,
}

impl NearestMatcher<Euclidean> {
    pub fn euclidean() -> Self {
        Self { distance: Euclidean }
    }
}

impl<D: Distance> NearestMatcher<D> {
    pub fn new(distance: D) -> Self {
        Self { distance }
    }
}

impl<D: Distance> Matcher for NearestMatcher<D> {
    fn compare(
        &self,
        query: &Embedding,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        let Some((idx, distance)) = nearest(&self.distance, query, gallery)? else {
            return Ok(MatchResult::no_match(None));
        };

        if distance < threshold {
            Ok(MatchResult {
                matched: true,
                distance: Some(distance),
                label: Some(gallery.entries()[idx].label.clone()),
            })
        } else {
            Ok(MatchResult::no_match(Some(distance)))
        }
    }
}

/// Match `query` against `gallery` with Euclidean distance.
///
/// Returns the accepted label, or `None` when the gallery is empty or the
/// nearest entry is not strictly closer than `threshold`.
pub fn match_identity<'g>(
    query: &Embedding,
    gallery: &'g Gallery,
    threshold: f32,
) -> Result<Option<&'g str>, MatchError> {
    match_identity_with(&Euclidean, query, gallery, threshold)
}

/// [`match_identity`] with an explicit distance function.
pub fn match_identity_with<'g, D: Distance>(
    distance: &D,
    query: &Embedding,
    gallery: &'g Gallery,
    threshold: f32,
) -> Result<Option<&'g str>, MatchError> {
    Ok(nearest(distance, query, gallery)?
        .filter(|&(_, d)| d < threshold)
        .map(|(idx, _)| gallery.entries()[idx].label.as_str()))
}

/// Index and distance of the closest entry. First-seen wins on ties.
fn nearest<D: Distance>(
    distance: &D,
    query: &Embedding,
    gallery: &Gallery,
) -> Result<Option<(usize, f32)>, MatchError> {
    let Some(expected) = gallery.dimension() else {
        return Ok(None);
    };
    if query.dim() != expected {
        return Err(MatchError::InvalidInput(format!(
            "query has {} dimensions, gallery has {expected}",
            query.dim()
        )));
    }

    let mut best: Option<(usize, f32)> = None;
    for (i, entry) in gallery.entries().iter().enumerate() {
        let d = distance.distance(query, &entry.embedding);
        let is_better = match best {
            None => !d.is_nan(),
            Some((_, best_d)) => d < best_d,
        };
        if is_better {
            best = Some((i, d));
        }
    }
    Ok(best)
}

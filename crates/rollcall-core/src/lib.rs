//! rollcall-core — Identity matching over face embeddings.
//!
//! Embeddings come from an external detection/embedding model and are
//! treated as plain vectors. A [`Gallery`] holds one mean embedding per
//! identity; the matcher picks the nearest entry under a fixed threshold.

pub mod gallery;
pub mod matcher;
pub mod types;

pub use gallery::{enroll_references, mean_embedding, Gallery, GalleryEntry, GalleryError};
pub use matcher::{
    match_identity, match_identity_with, MatchError, MatchResult, Matcher, NearestMatcher,
    DEFAULT_THRESHOLD,
};
pub use types::{Cosine, Distance, DistanceKind, Embedding, Euclidean};

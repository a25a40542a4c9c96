use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::recognizer::{l2_normalize, EMBEDDING_DIM};
use crate::types::Recognition;

/// Cosine similarity a match must reach to count as identified.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.4;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("failed to read gallery {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid gallery JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("entry {person_id} has a {actual}-dimensional embedding, expected {expected}")]
    Dimension {
        person_id: String,
        actual: usize,
        expected: usize,
    },
}

/// One enrolled person as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub person_id: String,
    pub name: String,
    pub embedding: Vec<f32>,
}

/// Enrolled embeddings, matched by cosine similarity.
#[derive(Debug, Clone)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    threshold: f32,
}

impl Gallery {
    /// Validates dimensions and normalizes every embedding.
    pub fn new(mut entries: Vec<GalleryEntry>, threshold: f32) -> Result<Self, GalleryError> {
        for entry in entries.iter_mut() {
            if entry.embedding.len() != EMBEDDING_DIM {
                return Err(GalleryError::Dimension {
                    person_id: entry.person_id.clone(),
                    actual: entry.embedding.len(),
                    expected: EMBEDDING_DIM,
                });
            }
            l2_normalize(&mut entry.embedding);
        }
        Ok(Self { entries, threshold })
    }

    pub fn empty(threshold: f32) -> Self {
        Self {
            entries: Vec::new(),
            threshold,
        }
    }

    pub fn load(path: &Path, threshold: f32) -> Result<Self, GalleryError> {
        let data = std::fs::read_to_string(path).map_err(|source| GalleryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let entries: Vec<GalleryEntry> = serde_json::from_str(&data)?;
        let gallery = Self::new(entries, threshold)?;
        tracing::info!(
            path = %path.display(),
            people = gallery.len(),
            "gallery loaded"
        );
        Ok(gallery)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Best match for a normalized probe embedding.
    pub fn best_match(&self, embedding: &[f32]) -> Recognition {
        let best = self
            .entries
            .iter()
            .map(|e| (e, cosine(&e.embedding, embedding)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((entry, similarity)) if similarity >= self.threshold => Recognition {
                person_id: Some(entry.person_id.clone()),
                member_name: Some(entry.name.clone()),
                similarity,
            },
            Some((_, similarity)) => Recognition::unknown(similarity),
            None => Recognition::unknown(0.0),
        }
    }
}

/// Dot product; both sides are unit vectors.
fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::matcher::MatchError;

/// Face region in pixel coordinates of the normalized image.
///
/// Edges follow the `(top, right, bottom, left)` convention; `right` and
/// `bottom` are exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceRegion {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

/// Face embedding vector produced by an [`EmbeddingProvider`](crate::EmbeddingProvider).
///
/// Values are fixed at construction; two embeddings are comparable only
/// when their dimensionality matches.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance to `other`.
    pub fn euclidean_distance(&self, other: &Embedding) -> Result<f32, MatchError> {
        if self.dimension() != other.dimension() {
            return Err(MatchError::IncompatibleEmbedding {
                expected: other.dimension(),
                actual: self.dimension(),
            });
        }
        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }
}

/// One enrolled reference shot.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub label: String,
    pub embedding: Embedding,
}

impl GalleryEntry {
    pub fn new(label: impl Into<String>, embedding: Embedding) -> Self {
        Self {
            label: label.into(),
            embedding,
        }
    }
}

/// Ordered collection of enrolled entries.
///
/// Insertion order is the first-match-wins tie-break, so entries are only
/// ever appended. Every embedding shares one dimensionality.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    model_version: Option<String>,
}

impl Gallery {
    pub fn new(model_version: Option<String>) -> Self {
        Self {
            entries: Vec::new(),
            model_version,
        }
    }

    /// Build a gallery from entries, rejecting mixed dimensionality.
    pub fn from_entries(
        model_version: Option<String>,
        entries: impl IntoIterator<Item = GalleryEntry>,
    ) -> Result<Self, MatchError> {
        let mut gallery = Self::new(model_version);
        for entry in entries {
            gallery.push(entry)?;
        }
        Ok(gallery)
    }

    pub fn push(&mut self, entry: GalleryEntry) -> Result<(), MatchError> {
        if let Some(expected) = self.dimension() {
            if entry.embedding.dimension() != expected {
                return Err(MatchError::IncompatibleEmbedding {
                    expected,
                    actual: entry.embedding.dimension(),
                });
            }
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Embedding dimensionality, or `None` for an empty gallery.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.dimension())
    }

    /// Identifier of the embedding model that produced the entries.
    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    pub fn set_model_version(&mut self, model_version: Option<String>) {
        self.model_version = model_version;
    }

    /// Distinct labels with their reference-shot counts, in first-seen order.
    pub fn labels(&self) -> Vec<(&str, usize)> {
        let mut out: Vec<(&str, usize)> = Vec::new();
        for entry in &self.entries {
            match out.iter_mut().find(|(label, _)| *label == entry.label) {
                Some((_, count)) => *count += 1,
                None => out.push((entry.label.as_str(), 1)),
            }
        }
        out
    }
}

/// Outcome of a match decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "label")]
pub enum Identity {
    Known(String),
    Unknown,
}

impl Identity {
    pub fn label(&self) -> Option<&str> {
        match self {
            Identity::Known(label) => Some(label),
            Identity::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Known(label) => f.write_str(label),
            Identity::Unknown => f.write_str("unknown"),
        }
    }
}

/// Identity decision for one detected face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub identity: Identity,
    /// Distance of the matched entry, or the closest distance seen when unknown.
    /// `None` when the gallery was empty.
    pub distance: Option<f32>,
    pub region: FaceRegion,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_euclidean_distance() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[3.0, 4.0]);
        assert!((a.euclidean_distance(&b).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_identical() {
        let a = emb(&[0.25, -0.5, 1.0]);
        assert_eq!(a.euclidean_distance(&a.clone()).unwrap(), 0.0);
    }

    #[test]
    fn test_euclidean_distance_dimension_mismatch() {
        let a = emb(&[1.0, 0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        let err = a.euclidean_distance(&b).unwrap_err();
        assert!(matches!(
            err,
            MatchError::IncompatibleEmbedding { expected: 2, actual: 3 }
        ));
    }

    #[test]
    fn test_gallery_rejects_mixed_dimensions() {
        let mut gallery = Gallery::new(None);
        gallery.push(GalleryEntry::new("a", emb(&[1.0, 0.0]))).unwrap();
        let err = gallery
            .push(GalleryEntry::new("b", emb(&[1.0, 0.0, 0.0])))
            .unwrap_err();
        assert!(matches!(err, MatchError::IncompatibleEmbedding { .. }));
        assert_eq!(gallery.len(), 1);
    }

    #[test]
    fn test_gallery_labels_grouped_in_order() {
        let gallery = Gallery::from_entries(
            None,
            vec![
                GalleryEntry::new("bob", emb(&[0.0])),
                GalleryEntry::new("alice", emb(&[1.0])),
                GalleryEntry::new("bob", emb(&[2.0])),
            ],
        )
        .unwrap();
        assert_eq!(gallery.labels(), vec![("bob", 2), ("alice", 1)]);
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(Identity::Known("alice".into()).to_string(), "alice");
        assert_eq!(Identity::Unknown.to_string(), "unknown");
    }

    #[test]
    fn test_region_size() {
        let region = FaceRegion {
            top: 10,
            right: 50,
            bottom: 70,
            left: 20,
            confidence: 0.9,
            landmarks: None,
        };
        assert_eq!(region.width(), 30);
        assert_eq!(region.height(), 60);
    }
}

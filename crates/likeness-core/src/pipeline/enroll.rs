//! Batch enrollment from a folder of labeled images.
//!
//! Each regular file is one reference shot; its stem becomes the label
//! (`alice.jpg` → "alice"). Per-image failures are recorded and skipped so
//! one bad file never aborts the batch.

use super::PipelineError;
use crate::gallery::GalleryStore;
use crate::normalize::Normalizer;
use crate::provider::{encode_checked, EmbeddingProvider};
use crate::types::{Gallery, GalleryEntry};
use std::fmt;
use std::path::{Path, PathBuf};

/// How a finished enrollment run is persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnrollMode {
    /// Replace the stored gallery with this run's entries.
    #[default]
    Rebuild,
    /// Add this run's entries after the existing ones. No duplicate detection.
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    InvalidImage(String),
    NoFaceDetected,
    Unreadable(String),
    Provider(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InvalidImage(e) => write!(f, "invalid image: {e}"),
            SkipReason::NoFaceDetected => f.write_str("no face detected"),
            SkipReason::Unreadable(e) => write!(f, "unreadable: {e}"),
            SkipReason::Provider(e) => write!(f, "embedding provider: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// Output of one enrollment run; nothing is persisted until [`commit`](Self::commit).
#[derive(Debug, Clone)]
pub struct EnrollReport {
    pub model_version: String,
    pub entries: Vec<GalleryEntry>,
    pub skipped: Vec<Skipped>,
}

impl EnrollReport {
    /// Persist the entries and return the stored gallery.
    pub fn commit(&self, store: &GalleryStore, mode: EnrollMode) -> Result<Gallery, PipelineError> {
        let gallery = match mode {
            EnrollMode::Rebuild => {
                let gallery =
                    Gallery::from_entries(Some(self.model_version.clone()), self.entries.clone())?;
                store.save(&gallery)?;
                gallery
            }
            EnrollMode::Append => {
                store.append(Some(&self.model_version), self.entries.clone())?
            }
        };

        tracing::info!(
            path = %store.path().display(),
            ?mode,
            enrolled = self.entries.len(),
            skipped = self.skipped.len(),
            total = gallery.len(),
            "enrollment committed"
        );
        Ok(gallery)
    }
}

pub struct Enrollment<'a, P: EmbeddingProvider + ?Sized> {
    provider: &'a mut P,
    normalizer: Normalizer,
}

impl<'a, P: EmbeddingProvider + ?Sized> Enrollment<'a, P> {
    pub fn new(provider: &'a mut P, normalizer: Normalizer) -> Self {
        Self {
            provider,
            normalizer,
        }
    }

    /// Enroll every regular file in `dir`, in file-name order.
    ///
    /// Only a failure to list the directory or an embedding of the wrong
    /// dimensionality is fatal; everything else becomes a [`Skipped`] record.
    pub fn run(&mut self, dir: &Path) -> Result<EnrollReport, PipelineError> {
        let source_err = |source| PipelineError::Source {
            path: dir.to_path_buf(),
            source,
        };

        let mut paths = Vec::new();
        for dirent in std::fs::read_dir(dir).map_err(source_err)? {
            let path = dirent.map_err(source_err)?.path();
            let hidden = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if path.is_file() && !hidden {
                paths.push(path);
            } else {
                tracing::debug!(path = %path.display(), "not an enrollment candidate");
            }
        }
        paths.sort();

        tracing::info!(dir = %dir.display(), candidates = paths.len(), "enrollment started");

        let mut entries = Vec::new();
        let mut skipped = Vec::new();

        for path in paths {
            let reason = match self.enroll_file(&path) {
                Ok(entry) => {
                    tracing::info!(path = %path.display(), label = %entry.label, "enrolled");
                    entries.push(entry);
                    continue;
                }
                Err(PipelineError::InvalidImage(e)) => SkipReason::InvalidImage(e.to_string()),
                Err(PipelineError::NoFaceDetected) => SkipReason::NoFaceDetected,
                Err(PipelineError::Source { source, .. }) => SkipReason::Unreadable(source.to_string()),
                Err(PipelineError::Provider(e)) => SkipReason::Provider(e.to_string()),
                Err(fatal) => return Err(fatal),
            };
            tracing::warn!(path = %path.display(), %reason, "skipping image");
            skipped.push(Skipped { path, reason });
        }

        Ok(EnrollReport {
            model_version: self.provider.model_version().to_string(),
            entries,
            skipped,
        })
    }

    fn enroll_file(&mut self, path: &Path) -> Result<GalleryEntry, PipelineError> {
        let bytes = std::fs::read(path).map_err(|source| PipelineError::Source {
            path: path.to_path_buf(),
            source,
        })?;
        let label = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.enroll_image(label, &bytes)
    }

    /// Normalize, detect and encode one training image.
    ///
    /// Only the first detected face is used; training images are assumed
    /// to show a single identity.
    pub fn enroll_image(
        &mut self,
        label: impl Into<String>,
        bytes: &[u8],
    ) -> Result<GalleryEntry, PipelineError> {
        let label = label.into();
        let image = self.normalizer.normalize_bytes(bytes)?;

        let regions = self.provider.detect_faces(&image)?;
        let Some(first) = regions.first() else {
            return Err(PipelineError::NoFaceDetected);
        };
        if regions.len() > 1 {
            tracing::warn!(
                label = %label,
                faces = regions.len(),
                "multiple faces in training image; using the first"
            );
        }

        let embedding = encode_checked(&mut *self.provider, &image, std::slice::from_ref(first))?
            .pop()
            .ok_or(PipelineError::NoFaceDetected)?;

        let expected = self.provider.dimension();
        if embedding.dimension() != expected {
            return Err(PipelineError::IncompatibleEmbedding {
                expected,
                actual: embedding.dimension(),
            });
        }

        Ok(GalleryEntry::new(label, embedding))
    }
}

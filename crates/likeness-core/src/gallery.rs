//! Persistent gallery store.
//!
//! The gallery lives in a single JSON file. Writes go to a temporary file in
//! the same directory which is fsynced and renamed over the target, so a
//! crash leaves either the previous or the new gallery on disk, never a mix.
//! Readers and writers coordinate through an advisory `flock` on a sibling
//! `.lock` file.

use crate::matcher::MatchError;
use crate::types::{Embedding, Gallery, GalleryEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// On-disk layout version written by this build.
const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed gallery file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("gallery encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("unsupported gallery format version {found} (expected {expected})", expected = FORMAT_VERSION)]
    UnsupportedFormat { found: u32 },
    #[error("corrupt gallery file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("gallery entry {index}: {source}")]
    IncompatibleEmbedding {
        index: usize,
        #[source]
        source: MatchError,
    },
    #[error("gallery was built with model {gallery}, refusing to add embeddings from {incoming}")]
    ModelMismatch { gallery: String, incoming: String },
}

impl GalleryError {
    fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        GalleryError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Serialized form: parallel label and embedding sequences with matching indices.
#[derive(Debug, Serialize, Deserialize)]
struct GalleryFile {
    format_version: u32,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    dimension: Option<usize>,
    updated_at: DateTime<Utc>,
    labels: Vec<String>,
    /// f32 values widened to f64 so the JSON text round-trips bit-exactly.
    embeddings: Vec<Vec<f64>>,
    checksum: String,
}

/// SHA-256 over labels and raw little-endian f32 bytes, hex encoded.
fn checksum(entries: &[GalleryEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update((entry.label.len() as u64).to_le_bytes());
        hasher.update(entry.label.as_bytes());
        hasher.update((entry.embedding.dimension() as u64).to_le_bytes());
        for v in entry.embedding.values() {
            hasher.update(v.to_le_bytes());
        }
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

impl GalleryFile {
    fn from_gallery(gallery: &Gallery) -> Self {
        let entries = gallery.entries();
        Self {
            format_version: FORMAT_VERSION,
            model_version: gallery.model_version().map(str::to_string),
            dimension: gallery.dimension(),
            updated_at: Utc::now(),
            labels: entries.iter().map(|e| e.label.clone()).collect(),
            embeddings: entries
                .iter()
                .map(|e| e.embedding.values().iter().map(|&v| v as f64).collect())
                .collect(),
            checksum: checksum(entries),
        }
    }

    fn into_gallery(self, path: &Path) -> Result<Gallery, GalleryError> {
        if self.format_version != FORMAT_VERSION {
            return Err(GalleryError::UnsupportedFormat {
                found: self.format_version,
            });
        }
        if self.labels.len() != self.embeddings.len() {
            return Err(GalleryError::Corrupt {
                path: path.to_path_buf(),
                reason: format!(
                    "{} labels but {} embeddings",
                    self.labels.len(),
                    self.embeddings.len()
                ),
            });
        }

        let mut gallery = Gallery::new(self.model_version);
        for (index, (label, values)) in self.labels.into_iter().zip(self.embeddings).enumerate() {
            if let Some(expected) = self.dimension {
                if values.len() != expected {
                    return Err(GalleryError::IncompatibleEmbedding {
                        index,
                        source: MatchError::IncompatibleEmbedding {
                            expected,
                            actual: values.len(),
                        },
                    });
                }
            }
            let embedding = Embedding::new(values.into_iter().map(|v| v as f32).collect());
            gallery
                .push(GalleryEntry::new(label, embedding))
                .map_err(|source| GalleryError::IncompatibleEmbedding { index, source })?;
        }

        let actual = checksum(gallery.entries());
        if actual != self.checksum {
            return Err(GalleryError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("checksum mismatch (stored {}, computed {actual})", self.checksum),
            });
        }

        Ok(gallery)
    }
}

/// Advisory `flock` held for the guard's lifetime.
struct FileLock {
    file: File,
}

impl FileLock {
    /// Exclusive lock for writers; creates the lock file when missing.
    fn exclusive(path: &Path) -> Result<Self, GalleryError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| GalleryError::io("opening lock", path, e))?;
        Self::lock(file, path, libc::LOCK_EX)
    }

    /// Shared lock for readers. Opens read-only and never creates the file.
    ///
    /// Returns `None` when the lock file is absent or cannot be opened on a
    /// read-only location. Such reads go unlocked; writers only ever rename
    /// complete files into place.
    fn shared(path: &Path) -> Result<Option<Self>, GalleryError> {
        match File::open(path) {
            Ok(file) => Self::lock(file, path, libc::LOCK_SH).map(Some),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                ) || e.raw_os_error() == Some(libc::EROFS) =>
            {
                tracing::debug!(path = %path.display(), error = %e, "reading gallery without lock");
                Ok(None)
            }
            Err(e) => Err(GalleryError::io("opening lock", path, e)),
        }
    }

    fn lock(file: File, path: &Path, op: libc::c_int) -> Result<Self, GalleryError> {
        // SAFETY: the fd is valid for the lifetime of `file`.
        let ret = unsafe { libc::flock(file.as_raw_fd(), op) };
        if ret < 0 {
            return Err(GalleryError::io(
                "locking",
                path,
                std::io::Error::last_os_error(),
            ));
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // SAFETY: the fd is still open; closing it would release the lock anyway.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Durable store for one gallery file.
#[derive(Debug, Clone)]
pub struct GalleryStore {
    path: PathBuf,
}

impl GalleryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn ensure_parent(&self) -> Result<(), GalleryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| GalleryError::io("creating directory", parent, e))?;
        }
        Ok(())
    }

    /// Read the persisted gallery. A missing file is an empty gallery.
    pub fn load(&self) -> Result<Gallery, GalleryError> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "no gallery on disk yet");
            return Ok(Gallery::default());
        }
        let _lock = FileLock::shared(&self.lock_path())?;
        self.read_unlocked()
    }

    /// Overwrite the persisted gallery.
    pub fn save(&self, gallery: &Gallery) -> Result<(), GalleryError> {
        self.ensure_parent()?;
        let _lock = FileLock::exclusive(&self.lock_path())?;
        self.write_unlocked(gallery)
    }

    /// Append entries produced by `model_version` and persist the result.
    ///
    /// The read-modify-write happens under one exclusive lock. Returns the
    /// updated gallery.
    pub fn append(
        &self,
        model_version: Option<&str>,
        entries: impl IntoIterator<Item = GalleryEntry>,
    ) -> Result<Gallery, GalleryError> {
        self.ensure_parent()?;
        let _lock = FileLock::exclusive(&self.lock_path())?;

        let mut gallery = if self.path.exists() {
            self.read_unlocked()?
        } else {
            Gallery::default()
        };

        match (gallery.model_version(), model_version) {
            (Some(existing), Some(incoming)) if existing != incoming => {
                return Err(GalleryError::ModelMismatch {
                    gallery: existing.to_string(),
                    incoming: incoming.to_string(),
                });
            }
            (Some(existing), None) => {
                return Err(GalleryError::ModelMismatch {
                    gallery: existing.to_string(),
                    incoming: "an unversioned provider".to_string(),
                });
            }
            (None, Some(incoming)) => gallery.set_model_version(Some(incoming.to_string())),
            _ => {}
        }

        let before = gallery.len();
        for entry in entries {
            let index = gallery.len();
            gallery
                .push(entry)
                .map_err(|source| GalleryError::IncompatibleEmbedding { index, source })?;
        }

        self.write_unlocked(&gallery)?;
        tracing::info!(
            path = %self.path.display(),
            added = gallery.len() - before,
            total = gallery.len(),
            "gallery appended"
        );
        Ok(gallery)
    }

    fn read_unlocked(&self) -> Result<Gallery, GalleryError> {
        let data = std::fs::read(&self.path)
            .map_err(|e| GalleryError::io("reading", &self.path, e))?;
        let file: GalleryFile =
            serde_json::from_slice(&data).map_err(|source| GalleryError::Parse {
                path: self.path.clone(),
                source,
            })?;
        let gallery = file.into_gallery(&self.path)?;
        tracing::debug!(
            path = %self.path.display(),
            entries = gallery.len(),
            model = ?gallery.model_version(),
            "gallery loaded"
        );
        Ok(gallery)
    }

    fn write_unlocked(&self, gallery: &Gallery) -> Result<(), GalleryError> {
        let data = serde_json::to_vec_pretty(&GalleryFile::from_gallery(gallery))
            .map_err(GalleryError::Encode)?;

        self.remove_stale_temps();

        let mut tmp_name = self.temp_prefix();
        tmp_name.push(std::process::id().to_string());
        let tmp_path = self.path.with_file_name(tmp_name);

        let result = write_synced(&tmp_path, &data)
            .and_then(|()| {
                std::fs::rename(&tmp_path, &self.path)
                    .map_err(|e| GalleryError::io("renaming", &tmp_path, e))
            })
            .and_then(|()| self.sync_parent());

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        result?;

        tracing::debug!(path = %self.path.display(), entries = gallery.len(), "gallery written");
        Ok(())
    }

    fn temp_prefix(&self) -> std::ffi::OsString {
        let mut prefix = self.path.file_name().unwrap_or_default().to_os_string();
        prefix.push(".tmp-");
        prefix
    }

    /// Delete temp files left by a writer that died before its rename.
    ///
    /// Only called under the exclusive lock, so no live writer owns them.
    fn remove_stale_temps(&self) {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let prefix = self.temp_prefix();
        let prefix = prefix.to_string_lossy();
        let Ok(dir) = std::fs::read_dir(parent) else {
            return;
        };
        for dirent in dir.flatten() {
            let is_file = dirent.file_type().is_ok_and(|t| t.is_file());
            if !is_file || !dirent.file_name().to_string_lossy().starts_with(prefix.as_ref()) {
                continue;
            }
            let stale = dirent.path();
            match std::fs::remove_file(&stale) {
                Ok(()) => tracing::warn!(path = %stale.display(), "removed stale gallery temp file"),
                Err(e) => tracing::debug!(path = %stale.display(), error = %e, "could not remove temp file"),
            }
        }
    }

    /// Persist the rename itself by syncing the containing directory.
    fn sync_parent(&self) -> Result<(), GalleryError> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        File::open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| GalleryError::io("syncing directory", parent, e))
    }
}

fn write_synced(path: &Path, data: &[u8]) -> Result<(), GalleryError> {
    let mut file = File::create(path).map_err(|e| GalleryError::io("creating", path, e))?;
    file.write_all(data)
        .map_err(|e| GalleryError::io("writing", path, e))?;
    file.sync_all()
        .map_err(|e| GalleryError::io("syncing", path, e))
}

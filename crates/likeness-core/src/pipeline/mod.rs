//! Enrollment and recognition pipelines: normalize → detect/encode → store or match.

pub mod enroll;
pub mod recognize;

pub use enroll::{EnrollMode, EnrollReport, Enrollment, SkipReason, Skipped};
pub use recognize::{GroupRecognition, Recognition};

use crate::gallery::GalleryError;
use crate::matcher::MatchError;
use crate::normalize::NormalizeError;
use crate::provider::ProviderError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid image: {0}")]
    InvalidImage(#[from] NormalizeError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("incompatible embedding: expected dimension {expected}, got {actual}")]
    IncompatibleEmbedding { expected: usize, actual: usize },
    #[error("gallery was enrolled with model {gallery} but the provider is {provider}")]
    ModelMismatch { gallery: String, provider: String },
    #[error("gallery persistence failed: {0}")]
    Persistence(#[from] GalleryError),
    #[error("embedding provider: {0}")]
    Provider(#[from] ProviderError),
    #[error("reading {path}: {source}")]
    Source {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<MatchError> for PipelineError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::IncompatibleEmbedding { expected, actual } => {
                PipelineError::IncompatibleEmbedding { expected, actual }
            }
        }
    }
}

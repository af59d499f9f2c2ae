//! likeness-core: face gallery matching engine.
//!
//! Images are normalized (width cap, luma equalization), handed to an
//! [`EmbeddingProvider`] for detection and encoding, and either enrolled into
//! a persistent [`Gallery`] or matched against one with first-match-wins
//! Euclidean comparison. The bundled provider runs SCRFD and ArcFace on ONNX
//! Runtime.

pub mod alignment;
pub mod detector;
pub mod gallery;
pub mod matcher;
pub mod normalize;
pub mod pipeline;
pub mod provider;
pub mod recognizer;
pub mod types;

pub use gallery::{GalleryError, GalleryStore};
pub use matcher::{MatchPolicy, Matcher, DEFAULT_TOLERANCE};
pub use normalize::{Normalizer, NormalizerConfig};
pub use pipeline::PipelineError;
pub use provider::{EmbeddingProvider, OnnxProvider, ProviderError};
pub use types::{Embedding, FaceRegion, Gallery, GalleryEntry, Identity, MatchResult};

//! Embedding provider seam: face detection plus embedding extraction.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError, ARCFACE_EMBEDDING_DIM, ARCFACE_MODEL_VERSION};
use crate::types::{Embedding, FaceRegion};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

/// SCRFD detection model file name inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("provider returned {embeddings} embeddings for {regions} regions")]
    Misaligned { regions: usize, embeddings: usize },
}

/// Maps a normalized image to face regions and one embedding per region.
///
/// Implementations must be deterministic for a fixed `model_version`, and
/// every embedding they produce has `dimension()` values.
pub trait EmbeddingProvider {
    /// Identifier of the model generation; galleries built from different
    /// versions are not comparable.
    fn model_version(&self) -> &str;

    fn dimension(&self) -> usize;

    /// Detected faces in provider order. The first region is the one used
    /// when a single face is expected.
    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, ProviderError>;

    /// One embedding per region, aligned 1:1 with `regions`.
    fn encode(
        &mut self,
        image: &RgbImage,
        regions: &[FaceRegion],
    ) -> Result<Vec<Embedding>, ProviderError>;
}

/// SCRFD + ArcFace over ONNX Runtime.
pub struct OnnxProvider {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxProvider {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ProviderError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?;
        tracing::info!(model_dir = %model_dir.display(), "embedding provider ready");
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl EmbeddingProvider for OnnxProvider {
    fn model_version(&self) -> &str {
        ARCFACE_MODEL_VERSION
    }

    fn dimension(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }

    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, ProviderError> {
        Ok(self.detector.detect(image)?)
    }

    fn encode(
        &mut self,
        image: &RgbImage,
        regions: &[FaceRegion],
    ) -> Result<Vec<Embedding>, ProviderError> {
        regions
            .iter()
            .map(|region| Ok(self.recognizer.extract(image, region)?))
            .collect()
    }
}

/// Encode `regions` and check the 1:1 contract.
pub(crate) fn encode_checked<P: EmbeddingProvider + ?Sized>(
    provider: &mut P,
    image: &RgbImage,
    regions: &[FaceRegion],
) -> Result<Vec<Embedding>, ProviderError> {
    let embeddings = provider.encode(image, regions)?;
    if embeddings.len() != regions.len() {
        return Err(ProviderError::Misaligned {
            regions: regions.len(),
            embeddings: embeddings.len(),
        });
    }
    Ok(embeddings)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic stand-in provider for pipeline tests.
    //!
    //! The face count is taken from the image width (`FACE_UNIT` pixels per
    //! face, so anything narrower has none). Each face occupies a vertical
    //! strip and its embedding is `[strip_index, red_of_top_left_pixel / 255]`.

    use super::*;

    pub const FACE_UNIT: u32 = 32;
    pub const MODEL: &str = "stub-v1";

    #[derive(Default)]
    pub struct StubProvider {
        pub detect_calls: usize,
    }

    impl EmbeddingProvider for StubProvider {
        fn model_version(&self) -> &str {
            MODEL
        }

        fn dimension(&self) -> usize {
            2
        }

        fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<FaceRegion>, ProviderError> {
            self.detect_calls += 1;
            let faces = image.width() / FACE_UNIT;
            Ok((0..faces)
                .map(|i| FaceRegion {
                    top: 0,
                    right: (i + 1) * FACE_UNIT,
                    bottom: image.height(),
                    left: i * FACE_UNIT,
                    confidence: 0.99,
                    landmarks: None,
                })
                .collect())
        }

        fn encode(
            &mut self,
            image: &RgbImage,
            regions: &[FaceRegion],
        ) -> Result<Vec<Embedding>, ProviderError> {
            let red = image.get_pixel(0, 0)[0] as f32 / 255.0;
            Ok(regions
                .iter()
                .map(|r| Embedding::new(vec![(r.left / FACE_UNIT) as f32, red]))
                .collect())
        }
    }
}

//! Recognition against a loaded gallery, in single-subject or group mode.

use super::PipelineError;
use crate::matcher::{Matcher, DEFAULT_TOLERANCE};
use crate::normalize::Normalizer;
use crate::provider::{encode_checked, EmbeddingProvider};
use crate::types::{FaceRegion, Gallery, MatchResult};
use image::{DynamicImage, RgbImage};

/// Every face found in one image, with the normalized image the regions refer to.
#[derive(Debug, Clone)]
pub struct GroupRecognition {
    pub image: RgbImage,
    pub results: Vec<MatchResult>,
}

/// A gallery bound to the provider that will produce probe embeddings.
///
/// Construction checks that the two are comparable, so per-image calls only
/// fail on the image itself.
pub struct Recognition<'a, P: EmbeddingProvider + ?Sized> {
    gallery: Gallery,
    provider: &'a mut P,
    normalizer: Normalizer,
    matcher: Box<dyn Matcher + Send + Sync>,
    tolerance: f32,
}

impl<'a, P: EmbeddingProvider + ?Sized> Recognition<'a, P> {
    pub fn new(
        gallery: Gallery,
        provider: &'a mut P,
        normalizer: Normalizer,
        matcher: Box<dyn Matcher + Send + Sync>,
        tolerance: f32,
    ) -> Result<Self, PipelineError> {
        if let Some(enrolled) = gallery.model_version() {
            if enrolled != provider.model_version() {
                return Err(PipelineError::ModelMismatch {
                    gallery: enrolled.to_string(),
                    provider: provider.model_version().to_string(),
                });
            }
        }
        if let Some(actual) = gallery.dimension() {
            let expected = provider.dimension();
            if actual != expected {
                return Err(PipelineError::IncompatibleEmbedding { expected, actual });
            }
        }
        if gallery.is_empty() {
            tracing::warn!("gallery is empty; every face will be unknown");
        }

        let tolerance = if tolerance.is_finite() && tolerance >= 0.0 {
            tolerance
        } else {
            tracing::warn!(tolerance, default = DEFAULT_TOLERANCE, "invalid tolerance, using default");
            DEFAULT_TOLERANCE
        };

        Ok(Self {
            gallery,
            provider,
            normalizer,
            matcher,
            tolerance,
        })
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    /// Identify the first detected face in `image`.
    pub fn recognize_single(&mut self, image: &DynamicImage) -> Result<MatchResult, PipelineError> {
        let normalized = self.normalizer.normalize(image)?;
        self.single_normalized(normalized)
    }

    pub fn recognize_single_bytes(&mut self, bytes: &[u8]) -> Result<MatchResult, PipelineError> {
        let normalized = self.normalizer.normalize_bytes(bytes)?;
        self.single_normalized(normalized)
    }

    fn single_normalized(&mut self, normalized: RgbImage) -> Result<MatchResult, PipelineError> {
        let regions = self.provider.detect_faces(&normalized)?;
        let Some(first) = regions.into_iter().next() else {
            tracing::debug!("no face in probe image");
            return Err(PipelineError::NoFaceDetected);
        };
        let mut results = self.match_regions(&normalized, vec![first])?;
        results.pop().ok_or(PipelineError::NoFaceDetected)
    }

    /// Identify every detected face in `image`, in detection order.
    ///
    /// An image without faces yields an empty result list, not an error.
    pub fn recognize_group(&mut self, image: &DynamicImage) -> Result<GroupRecognition, PipelineError> {
        let normalized = self.normalizer.normalize(image)?;
        self.group_normalized(normalized)
    }

    pub fn recognize_group_bytes(&mut self, bytes: &[u8]) -> Result<GroupRecognition, PipelineError> {
        let normalized = self.normalizer.normalize_bytes(bytes)?;
        self.group_normalized(normalized)
    }

    fn group_normalized(&mut self, normalized: RgbImage) -> Result<GroupRecognition, PipelineError> {
        let regions = self.provider.detect_faces(&normalized)?;
        let results = if regions.is_empty() {
            Vec::new()
        } else {
            self.match_regions(&normalized, regions)?
        };

        tracing::info!(
            faces = results.len(),
            known = results.iter().filter(|r| r.identity.is_known()).count(),
            "group recognition complete"
        );
        Ok(GroupRecognition {
            image: normalized,
            results,
        })
    }

    fn match_regions(
        &mut self,
        image: &RgbImage,
        regions: Vec<FaceRegion>,
    ) -> Result<Vec<MatchResult>, PipelineError> {
        let embeddings = encode_checked(&mut *self.provider, image, &regions)?;
        regions
            .into_iter()
            .zip(embeddings)
            .map(|(region, probe)| {
                let verdict = self.matcher.compare(&probe, &self.gallery, self.tolerance)?;
                tracing::debug!(
                    identity = %verdict.identity,
                    distance = ?verdict.distance,
                    entry = ?verdict.entry_index,
                    "face matched"
                );
                Ok(MatchResult {
                    identity: verdict.identity,
                    distance: verdict.distance,
                    region,
                })
            })
            .collect()
    }
}

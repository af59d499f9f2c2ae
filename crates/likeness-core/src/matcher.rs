//! Gallery matching: Euclidean distance with an inclusive tolerance.
//!
//! The default policy is first-match-wins: the earliest-inserted entry whose
//! distance is within tolerance decides the identity, even if a later entry
//! is closer. [`NearestMatcher`] is the nearest-distance alternative.

use crate::types::{Embedding, Gallery, Identity};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Default match tolerance. Smaller is stricter.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("incompatible embedding: expected dimension {expected}, got {actual}")]
    IncompatibleEmbedding { expected: usize, actual: usize },
}

/// Decision for a single probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub identity: Identity,
    /// Distance of the deciding entry, or the closest distance when unknown.
    pub distance: Option<f32>,
    /// Index of the deciding gallery entry.
    pub entry_index: Option<usize>,
}

impl Verdict {
    fn unknown(closest: Option<f32>) -> Self {
        Self {
            identity: Identity::Unknown,
            distance: closest,
            entry_index: None,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
        tolerance: f32,
    ) -> Result<Verdict, MatchError>;
}

/// Which decision rule to apply when several entries are within tolerance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// Earliest-inserted candidate wins.
    #[default]
    First,
    /// Closest candidate wins; ties go to the earliest-inserted.
    Nearest,
}

impl MatchPolicy {
    pub fn matcher(self) -> Box<dyn Matcher + Send + Sync> {
        match self {
            MatchPolicy::First => Box::new(FirstMatchMatcher),
            MatchPolicy::Nearest => Box::new(NearestMatcher),
        }
    }
}

impl FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(MatchPolicy::First),
            "nearest" => Ok(MatchPolicy::Nearest),
            other => Err(format!("unknown match policy {other:?} (expected first or nearest)")),
        }
    }
}

/// Distances from `probe` to every gallery entry, in insertion order.
fn distances(probe: &Embedding, gallery: &Gallery) -> Result<Vec<f32>, MatchError> {
    if let Some(expected) = gallery.dimension() {
        if probe.dimension() != expected {
            return Err(MatchError::IncompatibleEmbedding {
                expected,
                actual: probe.dimension(),
            });
        }
    }
    gallery
        .entries()
        .iter()
        .map(|entry| probe.euclidean_distance(&entry.embedding))
        .collect()
}

fn closest(distances: &[f32]) -> Option<f32> {
    distances.iter().copied().reduce(f32::min)
}

/// Boolean-match-then-first-index semantics.
pub struct FirstMatchMatcher;

impl Matcher for FirstMatchMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
        tolerance: f32,
    ) -> Result<Verdict, MatchError> {
        let distances = distances(probe, gallery)?;

        match distances.iter().position(|&d| d <= tolerance) {
            Some(idx) => Ok(Verdict {
                identity: Identity::Known(gallery.entries()[idx].label.clone()),
                distance: Some(distances[idx]),
                entry_index: Some(idx),
            }),
            None => Ok(Verdict::unknown(closest(&distances))),
        }
    }
}

/// Nearest-neighbour semantics with the same inclusive tolerance.
pub struct NearestMatcher;

impl Matcher for NearestMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
        tolerance: f32,
    ) -> Result<Verdict, MatchError> {
        let distances = distances(probe, gallery)?;

        let mut best: Option<(usize, f32)> = None;
        for (i, &d) in distances.iter().enumerate() {
            // Strict `<` keeps the earliest entry on ties.
            if best.map_or(true, |(_, best_d)| d < best_d) {
                best = Some((i, d));
            }
        }

        match best {
            Some((idx, d)) if d <= tolerance => Ok(Verdict {
                identity: Identity::Known(gallery.entries()[idx].label.clone()),
                distance: Some(d),
                entry_index: Some(idx),
            }),
            _ => Ok(Verdict::unknown(best.map(|(_, d)| d))),
        }
    }
}

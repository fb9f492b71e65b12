//! Fitness scoring of rendered candidates against a style's reference.
//!
//! Three similarity axes, each in `[0, 1]`, are folded into one 0-100
//! score with a weighted harmonic mean:
//!
//! ```text
//! overall = 100 / (w1/target + w2/self + w3/feature)      (0 if any axis <= 0)
//! ```
//!
//! The harmonic mean lets a single collapsed axis drag the whole score
//! down, and the zero veto makes a collapsed axis fatal.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audio::Waveform;
use crate::embedding::{cosine_similarity, mean_vector};
use crate::engine::{FeatureExtractor, SpeakerEncoder, millis};
use crate::features::AcousticDescriptors;

/// Weights and limits for [`FitnessScorer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    /// Weight of target similarity (default: 0.48).
    pub target_weight: f64,
    /// Weight of self similarity (default: 0.50).
    pub self_weight: f64,
    /// Weight of feature similarity (default: 0.02).
    pub feature_weight: f64,
    /// Audio shorter than this scores 0 on every axis it feeds (default: 1s).
    #[serde(with = "millis")]
    pub min_duration: Duration,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            target_weight: 0.48,
            self_weight: 0.50,
            feature_weight: 0.02,
            min_duration: Duration::from_secs(1),
        }
    }
}

/// Per-axis similarities and the combined score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FitnessReport {
    pub target_similarity: f64,
    pub self_similarity: f64,
    pub feature_similarity: f64,
    pub overall_score: f64,
}

/// `1 / Σ(w / x)` over `(weight, value)` pairs, or 0 if any value is
/// non-positive or non-finite.
pub fn weighted_harmonic_mean(pairs: &[(f64, f64)]) -> f64 {
    if pairs.is_empty() || pairs.iter().any(|&(_, x)| !(x > 0.0) || !x.is_finite()) {
        return 0.0;
    }
    let denom: f64 = pairs.iter().map(|&(w, x)| w / x).sum();
    if denom <= 0.0 {
        return 0.0;
    }
    1.0 / denom
}

/// Analysis of a reference waveform, computed once and reused for every
/// candidate. A field is `None` when the reference could not feed that
/// axis (too short or extraction failed).
#[derive(Debug, Clone, Default)]
pub struct ReferenceProfile {
    pub speaker: Option<Vec<f32>>,
    pub descriptors: Option<AcousticDescriptors>,
}

/// Scores rendered audio. Never fails: any extraction problem zeroes
/// the affected axis.
#[derive(Clone)]
pub struct FitnessScorer {
    encoder: Arc<dyn SpeakerEncoder>,
    extractor: Arc<dyn FeatureExtractor>,
    cfg: ScorerConfig,
}

impl FitnessScorer {
    pub fn new(
        encoder: Arc<dyn SpeakerEncoder>,
        extractor: Arc<dyn FeatureExtractor>,
        cfg: ScorerConfig,
    ) -> Self {
        Self {
            encoder,
            extractor,
            cfg,
        }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.cfg
    }

    /// Combines three axis values into a 0-100 score.
    pub fn overall(&self, target: f64, self_sim: f64, feature: f64) -> f64 {
        weighted_harmonic_mean(&[
            (self.cfg.target_weight, target),
            (self.cfg.self_weight, self_sim),
            (self.cfg.feature_weight, feature),
        ]) * 100.0
    }

    /// Analyzes a reference waveform.
    pub async fn profile(&self, reference: &Waveform) -> ReferenceProfile {
        if reference.duration() < self.cfg.min_duration {
            debug!(duration = ?reference.duration(), "reference below minimum duration");
            return ReferenceProfile::default();
        }
        let (speaker, descriptors) = futures::join!(
            self.encoder.encode(reference),
            self.extractor.describe(reference)
        );
        ReferenceProfile {
            speaker: speaker
                .inspect_err(|e| debug!(error = %e, "reference speaker encoding failed"))
                .ok(),
            descriptors: descriptors
                .inspect_err(|e| debug!(error = %e, "reference feature extraction failed"))
                .ok(),
        }
    }

    /// Scores a candidate rendered on one or more sentences.
    pub async fn score(&self, renders: &[Waveform], reference: &ReferenceProfile) -> FitnessReport {
        if renders.is_empty() || renders.iter().any(|r| r.duration() < self.cfg.min_duration) {
            return FitnessReport::default();
        }

        let embeddings = self.encode_all(renders).await;
        let target = match &reference.speaker {
            Some(ref_vec) if !embeddings.is_empty() => {
                (cosine_similarity(&mean_vector(&embeddings), ref_vec) as f64).max(0.0)
            }
            _ => 0.0,
        };
        let self_sim = if embeddings.len() == renders.len() {
            self_similarity(&embeddings)
        } else {
            // A sentence that failed to encode cannot vouch for stability.
            0.0
        };
        let feature = self.feature_similarity(renders, reference).await;

        FitnessReport {
            target_similarity: target,
            self_similarity: self_sim,
            feature_similarity: feature,
            overall_score: self.overall(target, self_sim, feature),
        }
    }

    /// The cheap single-axis score used to rank starting points.
    pub async fn target_only(&self, renders: &[Waveform], reference: &ReferenceProfile) -> f64 {
        let Some(ref_vec) = &reference.speaker else {
            return 0.0;
        };
        if renders.is_empty() || renders.iter().any(|r| r.duration() < self.cfg.min_duration) {
            return 0.0;
        }
        let embeddings = self.encode_all(renders).await;
        if embeddings.is_empty() {
            return 0.0;
        }
        (cosine_similarity(&mean_vector(&embeddings), ref_vec) as f64).max(0.0)
    }

    /// Descriptors for a set of renders joined end to end.
    pub async fn describe(&self, renders: &[Waveform]) -> Option<AcousticDescriptors> {
        let joined = Waveform::concat(renders, Duration::ZERO)
            .inspect_err(|e| debug!(error = %e, "cannot join renders for feature extraction"))
            .ok()?;
        self.extractor
            .describe(&joined)
            .await
            .inspect_err(|e| debug!(error = %e, "feature extraction failed"))
            .ok()
    }

    /// Speaker vectors for renders that encoded successfully.
    pub async fn encode_all(&self, renders: &[Waveform]) -> Vec<Vec<f32>> {
        join_all(renders.iter().map(|r| self.encoder.encode(r)))
            .await
            .into_iter()
            .filter_map(|r| {
                r.inspect_err(|e| debug!(error = %e, "speaker encoding failed"))
                    .ok()
            })
            .collect()
    }

    async fn feature_similarity(&self, renders: &[Waveform], reference: &ReferenceProfile) -> f64 {
        let Some(ref_desc) = &reference.descriptors else {
            return 0.0;
        };
        match self.describe(renders).await {
            Some(desc) => desc.similarity(ref_desc),
            None => 0.0,
        }
    }
}

/// Mean pairwise cosine similarity, clipped to `[0, 1]`.
/// Fewer than two vectors score 0.
pub fn self_similarity(embeddings: &[Vec<f32>]) -> f64 {
    if embeddings.len() < 2 {
        return 0.0;
    }
    let mut sum = 0.0f64;
    let mut pairs = 0usize;
    for i in 0..embeddings.len() {
        for j in i + 1..embeddings.len() {
            sum += cosine_similarity(&embeddings[i], &embeddings[j]) as f64;
            pairs += 1;
        }
    }
    (sum / pairs as f64).clamp(0.0, 1.0)
}

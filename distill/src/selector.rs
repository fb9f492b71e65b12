//! Exhaustive choice of the search's starting embedding.
//!
//! The candidate set is every bundled base, every pairwise blend at the
//! configured mixing ratios, and the centroid of all bases. Each candidate
//! is rendered on a short probe and ranked by target similarity alone.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::corpus::Sentence;
use crate::embedding::VoiceEmbedding;
use crate::engine::{BaseEmbedding, RetryPolicy, StudentEngine, render_sentences};
use crate::error::{DistillError, DistillResult};
use crate::scorer::{FitnessScorer, ReferenceProfile};
use crate::style::Style;

/// Configures [`StartingPointSelector`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Mixing ratios for pairwise blends (default: 0.25, 0.5, 0.75).
    pub mix_ratios: Vec<f32>,
    /// Add the centroid of all bases (default: true).
    pub include_centroid: bool,
    /// Probe sentences rendered per candidate (default: 2).
    pub probe_sentences: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            mix_ratios: vec![0.25, 0.5, 0.75],
            include_centroid: true,
            probe_sentences: 2,
        }
    }
}

/// A starting-point candidate with its provenance.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// e.g. `base:af_bella`, `mix:a+b@0.25`, `centroid`.
    pub label: String,
    pub embedding: VoiceEmbedding,
}

/// One evaluated candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub label: String,
    pub score: f64,
}

/// Result of selection.
#[derive(Debug, Clone)]
pub struct Selection {
    pub label: String,
    pub embedding: VoiceEmbedding,
    pub score: f64,
    /// Every evaluated candidate, best first.
    pub ranking: Vec<RankedCandidate>,
    /// Candidates skipped because the student could not render them.
    pub render_failures: usize,
}

/// Builds the full candidate set in a fixed order: bases, blends, centroid.
pub fn build_candidates(
    bases: &[BaseEmbedding],
    mix_ratios: &[f32],
    include_centroid: bool,
) -> DistillResult<Vec<Candidate>> {
    let first = bases.first().ok_or(DistillError::NoBaseEmbeddings)?;
    for b in bases {
        first.embedding.ensure_same_shape(&b.embedding)?;
    }

    let mut out: Vec<Candidate> = bases
        .iter()
        .map(|b| Candidate {
            label: format!("base:{}", b.name),
            embedding: b.embedding.clone(),
        })
        .collect();

    for i in 0..bases.len() {
        for j in i + 1..bases.len() {
            for &r in mix_ratios {
                out.push(Candidate {
                    label: format!("mix:{}+{}@{}", bases[i].name, bases[j].name, r),
                    embedding: bases[i].embedding.lerp(&bases[j].embedding, r)?,
                });
            }
        }
    }

    // With a single base the centroid is that base again.
    if include_centroid && bases.len() > 1 {
        let all: Vec<VoiceEmbedding> = bases.iter().map(|b| b.embedding.clone()).collect();
        out.push(Candidate {
            label: "centroid".into(),
            embedding: VoiceEmbedding::centroid(&all)?,
        });
    }
    Ok(out)
}

/// Picks the best starting embedding for a style.
pub struct StartingPointSelector {
    student: Arc<dyn StudentEngine>,
    scorer: FitnessScorer,
    retry: RetryPolicy,
    cfg: SelectorConfig,
}

impl StartingPointSelector {
    pub fn new(
        student: Arc<dyn StudentEngine>,
        scorer: FitnessScorer,
        retry: RetryPolicy,
        cfg: SelectorConfig,
    ) -> Self {
        Self {
            student,
            scorer,
            retry,
            cfg,
        }
    }

    /// Evaluates every candidate and returns the highest-scoring one.
    /// Ties keep the earlier candidate.
    pub async fn select(
        &self,
        style: &Style,
        bases: &[BaseEmbedding],
        probe: &[Sentence],
        reference: &ReferenceProfile,
    ) -> DistillResult<Selection> {
        let candidates = build_candidates(bases, &self.cfg.mix_ratios, self.cfg.include_centroid)?;
        let probe = &probe[..probe.len().min(self.cfg.probe_sentences.max(1))];

        let mut best: Option<(usize, f64)> = None;
        let mut ranking = Vec::with_capacity(candidates.len());
        let mut render_failures = 0;

        for (idx, cand) in candidates.iter().enumerate() {
            let (renders, _) =
                render_sentences(self.student.as_ref(), &cand.embedding, probe, &self.retry).await;
            let renders = match renders {
                Ok(r) => r,
                Err(e) => {
                    debug!(style = %style, candidate = %cand.label, error = %e, "candidate render failed");
                    render_failures += 1;
                    continue;
                }
            };
            let score = self.scorer.target_only(&renders, reference).await;
            debug!(style = %style, candidate = %cand.label, score, "candidate scored");
            ranking.push(RankedCandidate {
                label: cand.label.clone(),
                score,
            });
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((idx, score));
            }
        }

        let Some((idx, score)) = best else {
            return Err(DistillError::NoViableCandidate {
                style: style.clone(),
                attempted: candidates.len(),
            });
        };
        ranking.sort_by(|a, b| b.score.total_cmp(&a.score));
        let chosen = &candidates[idx];
        info!(
            style = %style,
            candidate = %chosen.label,
            score,
            evaluated = ranking.len(),
            failed = render_failures,
            "starting point selected"
        );
        Ok(Selection {
            label: chosen.label.clone(),
            embedding: chosen.embedding.clone(),
            score,
            ranking,
            render_failures,
        })
    }
}

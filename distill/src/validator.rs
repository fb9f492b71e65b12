//! Final quality gate on held-out text.
//!
//! A style passes when its voice still matches the reference on sentences
//! the search never saw, stays consistent across those sentences, and is
//! acoustically distinct from every other style in the run.
//!
//! Differentiation compares two styles on the same sentence through
//! their descriptor profiles. For each dimension the coefficient of
//! variation of the two values, `|x - y| / |x + y|`, measures how far
//! apart they are relative to their size; the pair's value is the mean
//! over dimensions and sentences. A pair with no sentence rendered by
//! both styles cannot be measured and is listed as unevaluated instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audio::Waveform;
use crate::corpus::Sentence;
use crate::deploy::write_atomic;
use crate::embedding::VoiceEmbedding;
use crate::engine::{RetryPolicy, StudentEngine};
use crate::error::DistillResult;
use crate::scorer::{FitnessScorer, ReferenceProfile};
use crate::style::Style;

/// Pass thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Minimum target similarity, inclusive (default: 0.70).
    pub min_target_similarity: f64,
    /// Minimum self similarity, inclusive (default: 0.85).
    pub min_self_similarity: f64,
    /// Every pair must exceed this (default: 0.05).
    pub min_differentiation: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_target_similarity: 0.70,
            min_self_similarity: 0.85,
            min_differentiation: 0.05,
        }
    }
}

/// Differentiation against one other style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairDifferentiation {
    pub other: Style,
    pub value: f64,
    pub pass: bool,
}

/// Per-metric outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationChecks {
    pub target_similarity: bool,
    pub self_similarity: bool,
    pub differentiation: bool,
}

/// The validator's verdict on one style.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub style: Style,
    /// Checksum of the embedding this verdict applies to.
    #[serde(default)]
    pub embedding_checksum: String,
    pub target_similarity: f64,
    pub self_similarity: f64,
    /// Minimum over `pairs`; `None` when the style has no peers.
    pub differentiation_metric: Option<f64>,
    pub pairs: Vec<PairDifferentiation>,
    /// Peers with no held-out sentence rendered by both styles.
    #[serde(default)]
    pub unevaluated: Vec<Style>,
    /// Held-out renders that failed after retries.
    #[serde(default)]
    pub render_failures: usize,
    pub checks: ValidationChecks,
    pub pass: bool,
    pub validated_at: DateTime<Utc>,
}

impl ValidationReport {
    /// Applies the thresholds. `pass` holds iff every check holds.
    pub fn evaluate(
        style: Style,
        embedding: &VoiceEmbedding,
        target_similarity: f64,
        self_similarity: f64,
        pairs: Vec<(Style, f64)>,
        cfg: &ValidatorConfig,
    ) -> Self {
        let pairs: Vec<PairDifferentiation> = pairs
            .into_iter()
            .map(|(other, value)| PairDifferentiation {
                other,
                value,
                pass: value > cfg.min_differentiation,
            })
            .collect();
        let differentiation_metric = pairs.iter().map(|p| p.value).reduce(f64::min);
        let checks = ValidationChecks {
            target_similarity: target_similarity >= cfg.min_target_similarity,
            self_similarity: self_similarity >= cfg.min_self_similarity,
            differentiation: pairs.iter().all(|p| p.pass),
        };
        Self {
            style,
            embedding_checksum: embedding.checksum(),
            target_similarity,
            self_similarity,
            differentiation_metric,
            pairs,
            unevaluated: Vec::new(),
            render_failures: 0,
            pass: checks.target_similarity && checks.self_similarity && checks.differentiation,
            checks,
            validated_at: Utc::now(),
        }
    }

    /// Reports whether this verdict was reached for `embedding`.
    pub fn covers(&self, embedding: &VoiceEmbedding) -> bool {
        self.embedding_checksum == embedding.checksum()
    }

    /// Names of the checks that failed.
    pub fn failed(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if !self.checks.target_similarity {
            out.push("target_similarity");
        }
        if !self.checks.self_similarity {
            out.push("self_similarity");
        }
        if !self.checks.differentiation {
            out.push("differentiation");
        }
        out
    }

    pub fn path_in(dir: &Path, style: &Style) -> PathBuf {
        dir.join(format!("{style}.json"))
    }

    /// Writes `<dir>/<style>.json`.
    pub fn save(&self, dir: &Path) -> DistillResult<PathBuf> {
        let path = Self::path_in(dir, &self.style);
        write_atomic(&path, &serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }

    pub fn load(path: impl AsRef<Path>) -> DistillResult<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// One style's input to validation.
#[derive(Debug, Clone)]
pub struct ValidationSubject {
    pub style: Style,
    pub embedding: VoiceEmbedding,
    pub reference: ReferenceProfile,
    pub held_out: Vec<Sentence>,
}

/// Validates a set of styles against each other.
pub struct VoiceValidator {
    student: Arc<dyn StudentEngine>,
    scorer: FitnessScorer,
    retry: RetryPolicy,
    cfg: ValidatorConfig,
}

impl VoiceValidator {
    pub fn new(
        student: Arc<dyn StudentEngine>,
        scorer: FitnessScorer,
        retry: RetryPolicy,
        cfg: ValidatorConfig,
    ) -> Self {
        Self {
            student,
            scorer,
            retry,
            cfg,
        }
    }

    /// Returns one report per subject, in input order.
    ///
    /// Every style renders the union of all held-out sentences so pairs
    /// are compared on identical text; target and self similarity use
    /// only the style's own held-out sentences.
    pub async fn validate_all(&self, subjects: &[ValidationSubject]) -> Vec<ValidationReport> {
        let mut pool: Vec<&Sentence> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for s in subjects.iter().flat_map(|s| &s.held_out) {
            index.entry(s.text.trim()).or_insert_with(|| {
                pool.push(s);
                pool.len() - 1
            });
        }

        // profiles[subject][sentence]
        let mut renders: Vec<Vec<Option<Waveform>>> = Vec::with_capacity(subjects.len());
        let mut profiles: Vec<Vec<Option<Vec<f64>>>> = Vec::with_capacity(subjects.len());
        let mut failures: Vec<usize> = Vec::with_capacity(subjects.len());
        for subject in subjects {
            let rendered = self.render_pool(subject, &pool).await;
            failures.push(rendered.iter().filter(|w| w.is_none()).count());
            let described = join_all(rendered.iter().map(|w| async move {
                match w {
                    Some(w) => self
                        .scorer
                        .describe(std::slice::from_ref(w))
                        .await
                        .map(|d| d.profile_vector()),
                    None => None,
                }
            }))
            .await;
            renders.push(rendered);
            profiles.push(described);
        }

        let mut reports = Vec::with_capacity(subjects.len());
        for (i, subject) in subjects.iter().enumerate() {
            let own: Option<Vec<Waveform>> = subject
                .held_out
                .iter()
                .map(|s| {
                    index
                        .get(s.text.trim())
                        .and_then(|&k| renders[i][k].clone())
                })
                .collect();
            let fitness = match own {
                Some(own) => self.scorer.score(&own, &subject.reference).await,
                None => {
                    debug!(style = %subject.style, "held-out render failed");
                    Default::default()
                }
            };

            let mut pairs = Vec::new();
            let mut unevaluated = Vec::new();
            for (j, other) in subjects.iter().enumerate() {
                if j == i {
                    continue;
                }
                match pair_differentiation(&profiles[i], &profiles[j]) {
                    Some(value) => pairs.push((other.style.clone(), value)),
                    None => unevaluated.push(other.style.clone()),
                }
            }

            let mut report = ValidationReport::evaluate(
                subject.style.clone(),
                &subject.embedding,
                fitness.target_similarity,
                fitness.self_similarity,
                pairs,
                &self.cfg,
            );
            report.unevaluated = unevaluated;
            report.render_failures = failures[i];
            if !report.unevaluated.is_empty() {
                warn!(
                    style = %report.style,
                    peers = ?report.unevaluated,
                    "no shared held-out render, differentiation not measured"
                );
            }
            info!(
                style = %report.style,
                target = report.target_similarity,
                self_similarity = report.self_similarity,
                differentiation = ?report.differentiation_metric,
                render_failures = report.render_failures,
                pass = report.pass,
                failed = ?report.failed(),
                "style validated"
            );
            reports.push(report);
        }
        reports
    }

    async fn render_pool(&self, subject: &ValidationSubject, pool: &[&Sentence]) -> Vec<Option<Waveform>> {
        let student = self.student.as_ref();
        let embedding = &subject.embedding;
        join_all(pool.iter().map(|s| async move {
            let (res, _) = self
                .retry
                .run(&s.id, || student.render(embedding, &s.text))
                .await;
            res.inspect_err(|e| debug!(style = %subject.style, sentence = %s.id, error = %e, "validation render failed"))
                .ok()
        }))
        .await
    }
}

/// Coefficient of variation of two non-negative values, capped at 1.
fn two_value_cv(x: f64, y: f64) -> f64 {
    let sum = (x + y).abs();
    if sum < 1e-9 {
        return 0.0;
    }
    ((x - y).abs() / sum).min(1.0)
}

/// Mean CV over every dimension of every sentence both styles rendered,
/// or `None` when they share no rendered sentence.
fn pair_differentiation(a: &[Option<Vec<f64>>], b: &[Option<Vec<f64>>]) -> Option<f64> {
    let mut sum = 0.0;
    let mut n = 0usize;
    for (fa, fb) in a.iter().zip(b) {
        let (Some(fa), Some(fb)) = (fa, fb) else {
            continue;
        };
        for (&x, &y) in fa.iter().zip(fb) {
            sum += two_value_cv(x, y);
            n += 1;
        }
    }
    (n > 0).then(|| sum / n as f64)
}

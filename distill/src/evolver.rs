//! Seeded accept/reject hill-climb over voice embeddings.
//!
//! Each step perturbs the current best with Gaussian noise scaled by the
//! embedding's own spread and a freshly drawn diversity, renders the probe
//! sentences, and keeps the candidate only if it scores strictly higher.
//!
//! ```text
//! Initializing -> Searching -> EarlyTerminated
//!                           -> BudgetExhausted
//!                           -> Failed           (K render failures in a row)
//!                           -> Cancelled
//! ```

use std::f64::consts::PI;
use std::path::Path;
use std::sync::Arc;

use rand::distributions::{Open01, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::corpus::Sentence;
use crate::deploy::write_atomic;
use crate::embedding::{EmbeddingTag, VoiceEmbedding};
use crate::engine::{RetryPolicy, StudentEngine, render_sentences};
use crate::error::DistillResult;
use crate::scorer::{FitnessReport, FitnessScorer, ReferenceProfile};
use crate::style::Style;

/// Configures [`VoiceEvolver`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolverConfig {
    /// Maximum search steps (default: 10000).
    pub step_budget: u64,
    /// Lower bound of the per-step diversity draw (default: 0.01).
    pub diversity_min: f32,
    /// Upper bound of the per-step diversity draw (default: 0.15).
    pub diversity_max: f32,
    /// Plateau window in steps (default: 100).
    pub early_stop_window: usize,
    /// Stop when the best `window` steps ago is at least this fraction of
    /// the current best (default: 0.98).
    pub early_stop_ratio: f64,
    /// Consecutive render failures that end the search (default: 5).
    pub max_consecutive_failures: u32,
    /// Base seed; each style derives its own stream from it.
    pub seed: u64,
    /// Progress log interval in steps (default: 100).
    pub log_every: u64,
    /// Checkpoint interval in steps (default: 250).
    pub checkpoint_every: u64,
}

impl Default for EvolverConfig {
    fn default() -> Self {
        Self {
            step_budget: 10_000,
            diversity_min: 0.01,
            diversity_max: 0.15,
            early_stop_window: 100,
            early_stop_ratio: 0.98,
            max_consecutive_failures: 5,
            seed: 42,
            log_every: 100,
            checkpoint_every: 250,
        }
    }
}

/// Lifecycle of one style's search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchPhase {
    Initializing,
    Searching,
    EarlyTerminated,
    BudgetExhausted,
    Failed,
    Cancelled,
}

impl SearchPhase {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Initializing | Self::Searching)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Searching => "searching",
            Self::EarlyTerminated => "early_terminated",
            Self::BudgetExhausted => "budget_exhausted",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SearchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best score after a step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub step: u64,
    pub score: f64,
}

/// Everything one style's search owns. Doubles as the checkpoint format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchState {
    pub style: Style,
    pub phase: SearchPhase,
    /// Provenance of the starting embedding.
    pub start_label: String,
    pub best: VoiceEmbedding,
    pub best_score: f64,
    pub best_report: FitnessReport,
    /// Step at which `best` was accepted; 0 is the starting point.
    pub best_step: u64,
    pub step: u64,
    /// Diversity used by the latest step.
    pub diversity: f32,
    pub steps_since_improvement: u64,
    /// `(step, best_score)` after the start and after every step.
    pub history: Vec<HistoryPoint>,
    pub accepted: u64,
    pub rejected: u64,
    pub render_failures: u64,
    pub consecutive_failures: u32,
}

impl SearchState {
    pub fn new(style: Style, start_label: impl Into<String>, start: VoiceEmbedding) -> Self {
        Self {
            style,
            phase: SearchPhase::Initializing,
            start_label: start_label.into(),
            best: start,
            best_score: 0.0,
            best_report: FitnessReport::default(),
            best_step: 0,
            step: 0,
            diversity: 0.0,
            steps_since_improvement: 0,
            history: Vec::new(),
            accepted: 0,
            rejected: 0,
            render_failures: 0,
            consecutive_failures: 0,
        }
    }

    /// Sets the starting point's score and enters `Searching`.
    pub fn begin(&mut self, report: FitnessReport) {
        self.best_report = report;
        self.best_score = report.overall_score;
        self.history.push(HistoryPoint {
            step: 0,
            score: self.best_score,
        });
        self.phase = SearchPhase::Searching;
    }

    /// Applies one step's outcome. `None` means the candidate could not be
    /// rendered. Returns whether the candidate replaced the best.
    pub fn record(
        &mut self,
        diversity: f32,
        outcome: Option<(VoiceEmbedding, FitnessReport)>,
    ) -> bool {
        self.step += 1;
        self.diversity = diversity;
        let accepted = match outcome {
            Some((candidate, report)) => {
                self.consecutive_failures = 0;
                if report.overall_score > self.best_score {
                    self.best = candidate;
                    self.best_score = report.overall_score;
                    self.best_report = report;
                    self.best_step = self.step;
                    true
                } else {
                    false
                }
            }
            None => {
                self.render_failures += 1;
                self.consecutive_failures += 1;
                false
            }
        };
        if accepted {
            self.accepted += 1;
            self.steps_since_improvement = 0;
        } else {
            self.rejected += 1;
            self.steps_since_improvement += 1;
        }
        self.history.push(HistoryPoint {
            step: self.step,
            score: self.best_score,
        });
        accepted
    }

    /// True once the best recorded `window` steps ago is at least `ratio`
    /// of the current best.
    pub fn plateaued(&self, window: usize, ratio: f64) -> bool {
        if window == 0 || self.history.len() <= window {
            return false;
        }
        let old = self.history[self.history.len() - 1 - window].score;
        old >= ratio * self.best_score
    }

    pub fn tag(&self) -> EmbeddingTag {
        EmbeddingTag {
            style: self.style.clone(),
            step: self.best_step,
            score: self.best_score,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> DistillResult<()> {
        write_atomic(path.as_ref(), &serde_json::to_vec_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> DistillResult<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Derives a per-style seed so styles draw independent streams that stay
/// stable across runs.
pub fn style_seed(base: u64, style: &Style) -> u64 {
    // FNV-1a
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in style.as_str().bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    base ^ h
}

/// Box-Muller transform.
fn standard_normal(rng: &mut StdRng) -> f32 {
    let u1: f64 = rng.sample(Open01);
    let u2: f64 = rng.sample(Open01);
    ((-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()) as f32
}

/// Runs the search for one style.
pub struct VoiceEvolver {
    student: Arc<dyn StudentEngine>,
    scorer: FitnessScorer,
    retry: RetryPolicy,
    cfg: EvolverConfig,
}

impl VoiceEvolver {
    pub fn new(
        student: Arc<dyn StudentEngine>,
        scorer: FitnessScorer,
        retry: RetryPolicy,
        cfg: EvolverConfig,
    ) -> Self {
        Self {
            student,
            scorer,
            retry,
            cfg,
        }
    }

    pub fn config(&self) -> &EvolverConfig {
        &self.cfg
    }

    /// Searches from `start` until a terminal phase and returns the final
    /// state. The state is also written to `checkpoint` periodically and
    /// on exit.
    pub async fn run(
        &self,
        style: &Style,
        start_label: &str,
        start: VoiceEmbedding,
        probe: &[Sentence],
        reference: &ReferenceProfile,
        cancel: &CancellationToken,
        checkpoint: Option<&Path>,
    ) -> DistillResult<SearchState> {
        let mut state = SearchState::new(style.clone(), start_label, start);
        let mut rng = StdRng::seed_from_u64(style_seed(self.cfg.seed, style));
        let lo = self.cfg.diversity_min.min(self.cfg.diversity_max);
        let hi = self.cfg.diversity_min.max(self.cfg.diversity_max);
        let diversity = Uniform::new_inclusive(lo, hi);

        let initial = match self.render_and_score(&state.best, probe, reference).await {
            Some(report) => report,
            None => {
                state.render_failures += 1;
                state.consecutive_failures += 1;
                FitnessReport::default()
            }
        };
        state.begin(initial);
        info!(
            style = %style,
            start = start_label,
            score = state.best_score,
            budget = self.cfg.step_budget,
            "search started"
        );
        if state.consecutive_failures >= self.cfg.max_consecutive_failures {
            warn!(style = %style, "starting point cannot be rendered");
            state.phase = SearchPhase::Failed;
        }

        while state.phase == SearchPhase::Searching && state.step < self.cfg.step_budget {
            if cancel.is_cancelled() {
                state.phase = SearchPhase::Cancelled;
                break;
            }

            let d = rng.sample(diversity);
            let noise: Vec<f32> = (0..state.best.len())
                .map(|_| standard_normal(&mut rng))
                .collect();
            let candidate = state.best.perturb(&noise, d)?;

            let scored = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    state.phase = SearchPhase::Cancelled;
                    break;
                }
                r = self.render_and_score(&candidate, probe, reference) => r,
            };

            let outcome = scored.map(|report| (candidate, report));
            if state.record(d, outcome) {
                debug!(style = %style, step = state.step, score = state.best_score, diversity = d, "candidate accepted");
            }

            if state.consecutive_failures >= self.cfg.max_consecutive_failures {
                warn!(
                    style = %style,
                    step = state.step,
                    failures = state.consecutive_failures,
                    "too many consecutive render failures"
                );
                state.phase = SearchPhase::Failed;
                break;
            }
            if state.plateaued(self.cfg.early_stop_window, self.cfg.early_stop_ratio) {
                state.phase = SearchPhase::EarlyTerminated;
                break;
            }
            if self.cfg.log_every > 0 && state.step % self.cfg.log_every == 0 {
                info!(
                    style = %style,
                    step = state.step,
                    best = state.best_score,
                    accepted = state.accepted,
                    since_improvement = state.steps_since_improvement,
                    "search progress"
                );
            }
            if let Some(path) = checkpoint {
                if self.cfg.checkpoint_every > 0 && state.step % self.cfg.checkpoint_every == 0 {
                    state.save(path)?;
                }
            }
        }
        if state.phase == SearchPhase::Searching {
            state.phase = SearchPhase::BudgetExhausted;
        }

        if let Some(path) = checkpoint {
            state.save(path)?;
        }
        info!(
            style = %style,
            phase = %state.phase,
            steps = state.step,
            best = state.best_score,
            best_step = state.best_step,
            accepted = state.accepted,
            rejected = state.rejected,
            render_failures = state.render_failures,
            "search finished"
        );
        Ok(state)
    }

    async fn render_and_score(
        &self,
        embedding: &VoiceEmbedding,
        probe: &[Sentence],
        reference: &ReferenceProfile,
    ) -> Option<FitnessReport> {
        let (renders, _) =
            render_sentences(self.student.as_ref(), embedding, probe, &self.retry).await;
        match renders {
            Ok(renders) => Some(self.scorer.score(&renders, reference).await),
            Err(e) => {
                debug!(error = %e, "candidate render failed");
                None
            }
        }
    }
}

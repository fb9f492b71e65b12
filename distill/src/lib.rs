//! Derivative-free distillation of teacher voices into student embeddings.
//!
//! A slow, high-quality teacher TTS model reads a long reference per
//! style. A fast student engine conditioned on a fixed-shape voice
//! embedding is then steered toward that reference by black-box search:
//! render, score, keep the better embedding.
//!
//! # Pipeline
//!
//! ```text
//! corpus ──► ReferenceSynthesizer ──► reference.wav ─┐
//!                                                    ▼
//! base embeddings ──► StartingPointSelector ──► VoiceEvolver ──► best embedding
//!                                                                     │
//!            held-out text ──► VoiceValidator (all styles at once) ◄──┘
//!                                     │
//!                                     ▼
//!                             DeploymentGate ──► <deploy_dir>/<style>.json
//!                                                manifest.json
//! ```
//!
//! Styles run in parallel; within a style every step is sequential.
//!
//! # Scoring
//!
//! [`FitnessScorer`] folds target similarity, self similarity and
//! acoustic-feature similarity into a 0-100 weighted harmonic mean. Any
//! axis at zero vetoes the candidate.
//!
//! # Built-in analysis
//!
//! The [`features`] module provides a Kaldi-style framed FFT front end
//! used by [`FbankDescriptorExtractor`] (pitch, energy, spectral envelope)
//! and [`StatsPoolingEncoder`] (a lightweight speaker vector). Real
//! deployments usually plug in a neural speaker encoder through
//! [`SpeakerEncoder`].

mod audio;
mod config;
mod corpus;
mod deploy;
mod embedding;
mod engine;
mod error;
mod evolver;
pub mod features;
mod pipeline;
mod reference;
pub mod remote;
mod run;
mod scorer;
mod selector;
mod style;
mod validator;

pub use audio::{SILENCE_DBFS, Waveform};
pub use config::DistillConfig;
pub use corpus::{Corpus, Sentence, StyleCorpus};
pub use deploy::{
    DeployConfig, DeploymentCandidate, DeploymentGate, DeploymentSummary, MANIFEST_FILE, Manifest,
    ManifestEntry, PublishedEmbedding, SkippedStyle, StyleSwitch, write_atomic,
};
pub use embedding::{EmbeddingTag, VoiceEmbedding, cosine_similarity, l2_normalize, mean_vector};
pub use engine::{
    BaseEmbedding, FeatureExtractor, RetryPolicy, SpeakerEncoder, StudentEngine, TeacherEngine,
    VoiceSource, render_sentences,
};
pub use error::{DistillError, DistillResult, RenderError, ScoringError};
pub use evolver::{EvolverConfig, HistoryPoint, SearchPhase, SearchState, VoiceEvolver, style_seed};
pub use features::{AcousticDescriptors, FbankDescriptorExtractor, FeatureConfig, StatsPoolingEncoder};
pub use pipeline::{Engines, Pipeline, PipelineOptions, Stage};
pub use reference::{ReferenceAudio, ReferenceConfig, ReferenceSynthesizer, StyleSpec};
pub use run::{Run, RunStatus, RunSummary, StyleCounters, StyleOutcome, StyleStatus, StyleSummary};
pub use scorer::{FitnessReport, FitnessScorer, ReferenceProfile, ScorerConfig, self_similarity, weighted_harmonic_mean};
pub use selector::{Candidate, RankedCandidate, Selection, SelectorConfig, StartingPointSelector, build_candidates};
pub use style::Style;
pub use validator::{
    PairDifferentiation, ValidationChecks, ValidationReport, ValidationSubject, ValidatorConfig,
    VoiceValidator,
};

#[cfg(test)]
mod tests;

use std::time::Duration;

use thiserror::Error;

use crate::style::Style;

/// Errors returned by teacher and student rendering engines.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("render timed out after {0:?}")]
    Timeout(Duration),

    #[error("synthesis error: {0}")]
    Synthesis(String),

    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

impl RenderError {
    /// Reports whether another attempt could succeed.
    ///
    /// Malformed audio and rejected requests are deterministic for a
    /// given input, so only timeouts and engine-side synthesis errors are
    /// retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Synthesis(_))
    }
}

/// Errors raised while turning audio into similarity inputs.
///
/// These never escape the fitness scorer: an axis whose inputs fail to
/// extract scores 0, which vetoes the candidate.
#[derive(Debug, Clone, Error)]
pub enum ScoringError {
    #[error("audio too short: need at least {min:?}, got {got:?}")]
    AudioTooShort { min: Duration, got: Duration },

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("extractor error: {0}")]
    Extractor(String),
}

/// Errors returned by distillation stages.
#[derive(Debug, Error)]
pub enum DistillError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),

    #[error("render failed: {0}")]
    Render(#[from] RenderError),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid style label: {0:?}")]
    InvalidStyle(String),

    #[error("unknown style: {0}")]
    UnknownStyle(String),

    #[error("embedding shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),

    #[error("no base embeddings available")]
    NoBaseEmbeddings,

    #[error("style {style}: no candidate could be rendered ({attempted} attempted)")]
    NoViableCandidate { style: Style, attempted: usize },

    #[error("style {0}: corpus has no sentences")]
    EmptyCorpus(Style),

    #[error("style {style}: sentence {id:?} appears in both probe and held-out sets")]
    OverlappingCorpus { style: Style, id: String },

    #[error("style {0}: reference audio already generated in this run")]
    ReferenceAlreadyGenerated(Style),

    #[error("style {style}: reference synthesis failed: {reason}")]
    ReferenceFailed { style: Style, reason: String },

    #[error("audio error: {0}")]
    Audio(String),

    #[error("deployment failed: none of {evaluated} styles passed validation")]
    DeploymentFailed { evaluated: usize },

    #[error("no style produced a usable result ({0} attempted)")]
    AllStylesFailed(usize),

    #[error("checksum mismatch for {path}: manifest {expected}, file {got}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        got: String,
    },

    #[error("remote engine error: {0}")]
    Remote(String),
}

/// Result type for distillation operations.
pub type DistillResult<T> = Result<T, DistillError>;

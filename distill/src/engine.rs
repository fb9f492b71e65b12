//! Interfaces to the external rendering engines and audio analyzers.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audio::Waveform;
use crate::corpus::Sentence;
use crate::embedding::VoiceEmbedding;
use crate::error::{RenderError, ScoringError};
use crate::features::AcousticDescriptors;

/// A reference voice sample the teacher clones from.
#[derive(Debug, Clone)]
pub struct VoiceSource {
    pub audio: Waveform,
    pub transcript: String,
}

/// High-quality, slow synthesis used only to build reference targets.
#[async_trait]
pub trait TeacherEngine: Send + Sync {
    /// Renders `text` in the manner described by `style_hint`.
    /// `speaking_rate` is a multiplier around 1.0.
    async fn render(
        &self,
        text: &str,
        style_hint: &str,
        speaking_rate: f32,
        source: Option<&VoiceSource>,
    ) -> Result<Waveform, RenderError>;
}

/// A named embedding bundled with the student engine.
#[derive(Debug, Clone)]
pub struct BaseEmbedding {
    pub name: String,
    pub embedding: VoiceEmbedding,
}

/// Fast synthesis conditioned on a voice embedding.
///
/// Called thousands of times per style during search.
#[async_trait]
pub trait StudentEngine: Send + Sync {
    async fn render(&self, embedding: &VoiceEmbedding, text: &str) -> Result<Waveform, RenderError>;

    /// The embeddings shipped with the engine, used as starting points.
    async fn base_embeddings(&self) -> Result<Vec<BaseEmbedding>, RenderError>;
}

/// Maps audio to a speaker-identity vector for cosine comparison.
#[async_trait]
pub trait SpeakerEncoder: Send + Sync {
    async fn encode(&self, wave: &Waveform) -> Result<Vec<f32>, ScoringError>;

    /// Returns the dimensionality of the output vectors.
    fn dimension(&self) -> usize;
}

/// Produces low-level acoustic descriptors.
#[async_trait]
pub trait FeatureExtractor: Send + Sync {
    async fn describe(&self, wave: &Waveform) -> Result<AcousticDescriptors, ScoringError>;
}

/// Bounded retry with exponential backoff for render calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 3).
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each retry (default: 500ms).
    #[serde(with = "millis")]
    pub base_delay: Duration,
    /// Upper bound on a single delay (default: 10s).
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget is spent. Returns the result and the number of
    /// retries performed.
    pub async fn run<F, Fut, T>(&self, what: &str, mut op: F) -> (Result<T, RenderError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RenderError>>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return (Ok(v), attempt - 1),
                Err(e) if attempt < max && e.is_retryable() => {
                    let delay = self.delay(attempt);
                    warn!(what, attempt, error = %e, ?delay, "render failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(what, attempt, error = %e, "render failed, giving up");
                    return (Err(e), attempt - 1);
                }
            }
        }
    }
}

/// Renders every sentence with the student, concurrently and with
/// per-sentence retries. Fails if any sentence fails; the second value
/// is the total number of retries spent.
pub async fn render_sentences(
    student: &dyn StudentEngine,
    embedding: &VoiceEmbedding,
    sentences: &[Sentence],
    retry: &RetryPolicy,
) -> (Result<Vec<Waveform>, RenderError>, u32) {
    let results = join_all(sentences.iter().map(|s| async move {
        retry.run(&s.id, || student.render(embedding, &s.text)).await
    }))
    .await;

    let mut retries = 0;
    let mut renders = Vec::with_capacity(results.len());
    let mut first_err = None;
    for (res, r) in results {
        retries += r;
        match res {
            Ok(w) => renders.push(w),
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }
    match first_err {
        Some(e) => (Err(e), retries),
        None => (Ok(renders), retries),
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

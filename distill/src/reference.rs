//! Long-form reference audio rendered by the teacher, one per style.
//!
//! Sentences are read in order until the next clip would push the total
//! past `max_duration`. Clips are joined with a short silence, trimmed,
//! and loudness-normalized. The result is cached as
//! `<dir>/<style>.wav` so later stages and later invocations reuse it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audio::Waveform;
use crate::corpus::Sentence;
use crate::deploy::write_atomic;
use crate::engine::{RetryPolicy, TeacherEngine, VoiceSource, millis};
use crate::error::{DistillError, DistillResult};
use crate::style::Style;

/// Configures [`ReferenceSynthesizer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    /// Loudness target unless the style overrides it (default: -20 dBFS).
    pub target_dbfs: f64,
    /// Shorter references only log a warning (default: 20s).
    #[serde(with = "millis")]
    pub min_duration: Duration,
    /// Hard upper bound (default: 30s).
    #[serde(with = "millis")]
    pub max_duration: Duration,
    /// Silence inserted between sentences (default: 150ms).
    #[serde(with = "millis")]
    pub sentence_gap: Duration,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            target_dbfs: -20.0,
            min_duration: Duration::from_secs(20),
            max_duration: Duration::from_secs(30),
            sentence_gap: Duration::from_millis(150),
        }
    }
}

/// How the teacher should read a style.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleSpec {
    /// Free-form instruction passed to the teacher. Empty means the
    /// style label itself.
    pub style_hint: String,
    /// Speaking-rate multiplier (default: 1.0).
    pub speaking_rate: f32,
    /// Overrides [`ReferenceConfig::target_dbfs`].
    pub target_dbfs: Option<f64>,
}

impl Default for StyleSpec {
    fn default() -> Self {
        Self {
            style_hint: String::new(),
            speaking_rate: 1.0,
            target_dbfs: None,
        }
    }
}

/// A style's reference waveform and where it came from.
#[derive(Debug, Clone)]
pub struct ReferenceAudio {
    pub style: Style,
    pub audio: Waveform,
    pub path: PathBuf,
    /// Sentences rendered into the audio; 0 when loaded from disk.
    pub sentences_used: usize,
    /// Teacher retries spent.
    pub retries: u32,
    /// Loaded from the cache or an override instead of rendered.
    pub reused: bool,
}

/// Renders and caches reference audio. Each style is rendered at most
/// once per synthesizer.
pub struct ReferenceSynthesizer {
    teacher: Arc<dyn TeacherEngine>,
    retry: RetryPolicy,
    cfg: ReferenceConfig,
    dir: PathBuf,
    source: Option<VoiceSource>,
    generated: Mutex<HashSet<Style>>,
}

impl ReferenceSynthesizer {
    pub fn new(
        teacher: Arc<dyn TeacherEngine>,
        retry: RetryPolicy,
        cfg: ReferenceConfig,
        dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            teacher,
            retry,
            cfg,
            dir: dir.into(),
            source: None,
            generated: Mutex::new(HashSet::new()),
        }
    }

    /// Sets the voice sample the teacher clones from.
    pub fn with_source(mut self, source: VoiceSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Cache location for a style.
    pub fn path_for(&self, style: &Style) -> PathBuf {
        self.dir.join(format!("{style}.wav"))
    }

    /// Returns the style's reference: the override if given, else the
    /// cached file, else a fresh rendering.
    pub async fn obtain(
        &self,
        style: &Style,
        spec: &StyleSpec,
        sentences: &[Sentence],
        override_path: Option<&Path>,
    ) -> DistillResult<ReferenceAudio> {
        if let Some(path) = override_path {
            info!(style = %style, path = %path.display(), "using reference override");
            return self.load_from(style, path);
        }
        if let Some(cached) = self.load(style)? {
            info!(style = %style, path = %cached.path.display(), "reusing cached reference");
            return Ok(cached);
        }
        self.synthesize(style, spec, sentences).await
    }

    /// Loads the cached reference, if any.
    pub fn load(&self, style: &Style) -> DistillResult<Option<ReferenceAudio>> {
        let path = self.path_for(style);
        if !path.exists() {
            return Ok(None);
        }
        self.load_from(style, &path).map(Some)
    }

    fn load_from(&self, style: &Style, path: &Path) -> DistillResult<ReferenceAudio> {
        let audio = Waveform::read_wav(path)?;
        Ok(ReferenceAudio {
            style: style.clone(),
            audio,
            path: path.to_path_buf(),
            sentences_used: 0,
            retries: 0,
            reused: true,
        })
    }

    /// Renders, normalizes and persists the style's reference.
    ///
    /// Fails with [`DistillError::ReferenceAlreadyGenerated`] on a second
    /// call for the same style, and with [`DistillError::ReferenceFailed`]
    /// if any sentence exhausts its retries.
    pub async fn synthesize(
        &self,
        style: &Style,
        spec: &StyleSpec,
        sentences: &[Sentence],
    ) -> DistillResult<ReferenceAudio> {
        {
            let mut generated = self
                .generated
                .lock()
                .map_err(|_| DistillError::ReferenceFailed {
                    style: style.clone(),
                    reason: "generation guard poisoned".into(),
                })?;
            if !generated.insert(style.clone()) {
                return Err(DistillError::ReferenceAlreadyGenerated(style.clone()));
            }
        }

        let hint = if spec.style_hint.is_empty() {
            style.as_str()
        } else {
            spec.style_hint.as_str()
        };
        let failed = |reason: String| DistillError::ReferenceFailed {
            style: style.clone(),
            reason,
        };

        let mut clips: Vec<Waveform> = Vec::new();
        let mut total = Duration::ZERO;
        let mut retries = 0;
        for sentence in sentences {
            let (res, r) = self
                .retry
                .run(&sentence.id, || {
                    self.teacher
                        .render(&sentence.text, hint, spec.speaking_rate, self.source.as_ref())
                })
                .await;
            retries += r;
            let clip = res.map_err(|e| failed(format!("sentence {}: {e}", sentence.id)))?;
            if clip.is_empty() {
                return Err(failed(format!("sentence {}: empty audio", sentence.id)));
            }
            let gap = if clips.is_empty() {
                Duration::ZERO
            } else {
                self.cfg.sentence_gap
            };
            // The first clip is kept even when long; it gets trimmed below.
            if !clips.is_empty() && total + gap + clip.duration() > self.cfg.max_duration {
                debug!(style = %style, sentence = %sentence.id, "reference duration reached");
                break;
            }
            total += gap + clip.duration();
            clips.push(clip);
        }
        if clips.is_empty() {
            return Err(failed("no sentences rendered".into()));
        }

        let mut audio = Waveform::concat(&clips, self.cfg.sentence_gap)?;
        audio.truncate(self.cfg.max_duration);
        audio.normalize_loudness(spec.target_dbfs.unwrap_or(self.cfg.target_dbfs));
        if audio.duration() < self.cfg.min_duration {
            warn!(
                style = %style,
                duration = ?audio.duration(),
                min = ?self.cfg.min_duration,
                "reference shorter than minimum"
            );
        }

        let path = self.path_for(style);
        write_atomic(&path, &audio.to_wav_bytes()?)?;
        info!(
            style = %style,
            sentences = clips.len(),
            duration = ?audio.duration(),
            loudness_dbfs = audio.rms_dbfs(),
            retries,
            "reference synthesized"
        );
        Ok(ReferenceAudio {
            style: style.clone(),
            audio,
            path,
            sentences_used: clips.len(),
            retries,
            reused: false,
        })
    }
}

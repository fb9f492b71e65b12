//! Integration tests across stages with deterministic mock engines.
//!
//! The mock world encodes a voice directly in the audio: the first `DIM`
//! samples of every render are the (scaled) embedding, and the mock
//! encoder reads them back. Cosine similarity between renders therefore
//! equals cosine similarity between the vectors that produced them.

use super::*;
use crate::features::{EnergyStats, PitchStats};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

const DIM: usize = 8;
const RATE: u32 = 1000;

// ============================================================================
// Mock World
// ============================================================================

fn unit(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[i] = 1.0;
    v
}

/// 1.5s of audio whose first `DIM` samples carry `v`.
fn carrier(v: &[f32]) -> Waveform {
    let samples = (0..1500).map(|i| v[i % v.len()] * 0.5).collect();
    Waveform::new(samples, RATE)
}

fn head(wave: &Waveform) -> Result<Vec<f32>, ScoringError> {
    if wave.len() < DIM {
        return Err(ScoringError::Extractor("audio shorter than carrier".into()));
    }
    Ok(wave.samples()[..DIM].to_vec())
}

struct HeadEncoder;

#[async_trait]
impl SpeakerEncoder for HeadEncoder {
    async fn encode(&self, wave: &Waveform) -> Result<Vec<f32>, ScoringError> {
        head(wave)
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

/// Maps the carried vector onto descriptors so that different voices
/// get different pitch, energy and envelope profiles.
struct HeadExtractor;

#[async_trait]
impl FeatureExtractor for HeadExtractor {
    async fn describe(&self, wave: &Waveform) -> Result<AcousticDescriptors, ScoringError> {
        let mut u: Vec<f64> = head(wave)?.iter().map(|&x| x as f64).collect();
        let norm = u.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.0 {
            u.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(AcousticDescriptors {
            pitch: PitchStats {
                mean_hz: 100.0 + 200.0 * u[0] * u[0],
                std_hz: 10.0 + 40.0 * u[1] * u[1],
                range_hz: 20.0 + 80.0 * u[2] * u[2],
                voiced_ratio: 0.8,
            },
            energy: EnergyStats {
                mean_db: -20.0,
                std_db: 2.0 + 10.0 * u[3] * u[3],
                p10_db: -40.0,
                p90_db: -30.0 + 20.0 * u[4] * u[4],
            },
            spectral_envelope: u,
        })
    }
}

/// Reads the target vector registered under the style hint.
struct WorldTeacher {
    voices: HashMap<String, Vec<f32>>,
    calls: AtomicUsize,
}

impl WorldTeacher {
    fn new(voices: &[(&str, Vec<f32>)]) -> Self {
        Self {
            voices: voices.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TeacherEngine for WorldTeacher {
    async fn render(
        &self,
        _text: &str,
        style_hint: &str,
        _speaking_rate: f32,
        _source: Option<&VoiceSource>,
    ) -> Result<Waveform, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.voices
            .get(style_hint)
            .map(|v| carrier(v))
            .ok_or_else(|| RenderError::Synthesis(format!("no voice for {style_hint}")))
    }
}

/// Renders the embedding itself, except that dimensions at or past
/// `reachable` are silenced.
struct WorldStudent {
    bases: Vec<(String, Vec<f32>)>,
    reachable: usize,
    calls: AtomicUsize,
}

impl WorldStudent {
    fn new(bases: &[(&str, Vec<f32>)], reachable: usize) -> Self {
        Self {
            bases: bases.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            reachable,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StudentEngine for WorldStudent {
    async fn render(&self, embedding: &VoiceEmbedding, _text: &str) -> Result<Waveform, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut v = embedding.data().to_vec();
        for (i, x) in v.iter_mut().enumerate() {
            if i >= self.reachable {
                *x = 0.0;
            }
        }
        Ok(carrier(&v))
    }

    async fn base_embeddings(&self) -> Result<Vec<BaseEmbedding>, RenderError> {
        self.bases
            .iter()
            .map(|(name, v)| {
                Ok(BaseEmbedding {
                    name: name.clone(),
                    embedding: VoiceEmbedding::from_vec(v.clone())
                        .map_err(|e| RenderError::Synthesis(e.to_string()))?,
                })
            })
            .collect()
    }
}

/// Improves with every step until step 50, then stays put.
///
/// Two probe sentences means two renders per step; the render count
/// alone decides the output, whatever embedding is asked for.
struct PlateauStudent {
    calls: AtomicUsize,
}

#[async_trait]
impl StudentEngine for PlateauStudent {
    async fn render(&self, _embedding: &VoiceEmbedding, _text: &str) -> Result<Waveform, RenderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let q = (n / 2).min(50) as f64;
        let theta = (1.0 - q / 50.0) * std::f64::consts::FRAC_PI_3;
        let mut v = vec![0.0; DIM];
        v[0] = theta.cos() as f32;
        v[1] = theta.sin() as f32;
        Ok(carrier(&v))
    }

    async fn base_embeddings(&self) -> Result<Vec<BaseEmbedding>, RenderError> {
        Ok(vec![])
    }
}

struct BrokenStudent {
    calls: AtomicUsize,
}

#[async_trait]
impl StudentEngine for BrokenStudent {
    async fn render(&self, _embedding: &VoiceEmbedding, _text: &str) -> Result<Waveform, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RenderError::Synthesis("gpu out of memory".into()))
    }

    async fn base_embeddings(&self) -> Result<Vec<BaseEmbedding>, RenderError> {
        Err(RenderError::Synthesis("gpu out of memory".into()))
    }
}

/// Cancels `token` once `after` renders have been served.
struct CancellingStudent {
    inner: WorldStudent,
    token: CancellationToken,
    after: usize,
}

#[async_trait]
impl StudentEngine for CancellingStudent {
    async fn render(&self, embedding: &VoiceEmbedding, text: &str) -> Result<Waveform, RenderError> {
        if self.inner.calls() >= self.after {
            self.token.cancel();
        }
        self.inner.render(embedding, text).await
    }

    async fn base_embeddings(&self) -> Result<Vec<BaseEmbedding>, RenderError> {
        self.inner.base_embeddings().await
    }
}

/// Renders like [`WorldStudent`] but rejects any embedding that uses the
/// last dimension.
struct PickyStudent {
    inner: WorldStudent,
}

#[async_trait]
impl StudentEngine for PickyStudent {
    async fn render(&self, embedding: &VoiceEmbedding, text: &str) -> Result<Waveform, RenderError> {
        if embedding.data()[DIM - 1] != 0.0 {
            return Err(RenderError::Synthesis("voice not supported".into()));
        }
        self.inner.render(embedding, text).await
    }

    async fn base_embeddings(&self) -> Result<Vec<BaseEmbedding>, RenderError> {
        self.inner.base_embeddings().await
    }
}

fn scorer() -> FitnessScorer {
    FitnessScorer::new(Arc::new(HeadEncoder), Arc::new(HeadExtractor), ScorerConfig::default())
}

fn probe() -> Vec<Sentence> {
    vec![
        Sentence::new("p1", "The package left the warehouse this morning."),
        Sentence::new("p2", "Your call is important to us."),
    ]
}

fn held_out() -> Vec<Sentence> {
    vec![
        Sentence::new("h1", "Thanks for waiting, I have your account here."),
        Sentence::new("h2", "Have a lovely evening."),
    ]
}

fn style(s: &str) -> Style {
    Style::new(s).unwrap()
}

fn emb(v: Vec<f32>) -> VoiceEmbedding {
    VoiceEmbedding::from_vec(v).unwrap()
}

fn evolver_config(budget: u64) -> EvolverConfig {
    EvolverConfig {
        step_budget: budget,
        log_every: 0,
        checkpoint_every: 25,
        seed: 11,
        ..EvolverConfig::default()
    }
}

fn evolver(student: Arc<dyn StudentEngine>, cfg: EvolverConfig) -> VoiceEvolver {
    VoiceEvolver::new(student, scorer(), RetryPolicy::none(), cfg)
}

fn mixed_target() -> Vec<f32> {
    vec![0.6, 0.3, -0.2, 0.5, 0.1, 0.0, 0.4, -0.3]
}

// ============================================================================
// Evolver
// ============================================================================

#[tokio::test]
async fn best_score_never_decreases() {
    let s = scorer();
    let reference = s.profile(&carrier(&mixed_target())).await;
    let student = Arc::new(WorldStudent::new(&[], DIM));
    let ev = evolver(student, evolver_config(300));

    let state = ev
        .run(
            &style("neutral"),
            "base:a",
            emb(vec![0.5, 0.5, 0.5, 0.5, 0.2, 0.2, 0.2, 0.2]),
            &probe(),
            &reference,
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert!(state.phase.is_terminal());
    assert!(state.history.windows(2).all(|w| w[1].score >= w[0].score));
    assert_eq!(state.history.last().unwrap().score, state.best_score);
    assert!(state.best_score >= state.history[0].score);
    assert!(state.accepted > 0, "search never improved");
    assert_eq!(state.accepted + state.rejected, state.step);
}

#[tokio::test]
async fn same_seed_same_search() {
    let s = scorer();
    let reference = s.profile(&carrier(&mixed_target())).await;
    let start = emb(vec![0.5, 0.5, 0.5, 0.5, 0.2, 0.2, 0.2, 0.2]);

    let mut results = Vec::new();
    for _ in 0..2 {
        let ev = evolver(Arc::new(WorldStudent::new(&[], DIM)), evolver_config(120));
        let state = ev
            .run(&style("warm"), "base:a", start.clone(), &probe(), &reference, &CancellationToken::new(), None)
            .await
            .unwrap();
        results.push(state);
    }
    assert_eq!(results[0].history, results[1].history);
    assert_eq!(results[0].best, results[1].best);
    assert_eq!(results[0].phase, results[1].phase);

    // A different style label draws a different stream.
    let ev = evolver(Arc::new(WorldStudent::new(&[], DIM)), evolver_config(120));
    let other = ev
        .run(&style("calm"), "base:a", start, &probe(), &reference, &CancellationToken::new(), None)
        .await
        .unwrap();
    assert_ne!(other.best, results[0].best);
}

#[tokio::test]
async fn plateau_terminates_early() {
    let s = scorer();
    let reference = s.profile(&carrier(&unit(0))).await;
    let student = Arc::new(PlateauStudent {
        calls: AtomicUsize::new(0),
    });
    let ev = evolver(student, evolver_config(10_000));

    let state = ev
        .run(&style("neutral"), "centroid", emb(vec![1.0, 0.5]), &probe(), &reference, &CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(state.phase, SearchPhase::EarlyTerminated);
    assert!(state.step <= 150, "stopped at {}", state.step);
    assert!(state.step > 100, "stopped at {}", state.step);
    assert_eq!(state.best_step, 50);
    assert_eq!(state.accepted, 50);
}

#[tokio::test]
async fn consecutive_render_failures_fail_the_search() {
    let reference = scorer().profile(&carrier(&unit(0))).await;
    let student = Arc::new(BrokenStudent {
        calls: AtomicUsize::new(0),
    });
    let ev = evolver(student.clone(), evolver_config(1000));
    let start = emb(unit(0));

    let state = ev
        .run(&style("neutral"), "base:a", start.clone(), &probe(), &reference, &CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(state.phase, SearchPhase::Failed);
    // The starting point opens the failure streak: four steps close it.
    assert_eq!(state.step, 4);
    assert_eq!(state.render_failures, 5);
    assert_eq!(state.consecutive_failures, 5);
    assert_eq!(state.best, start);
    // Five candidates, two probe sentences each.
    assert_eq!(student.calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn single_failure_limit_stops_at_the_starting_point() {
    let reference = scorer().profile(&carrier(&unit(0))).await;
    let student = Arc::new(BrokenStudent {
        calls: AtomicUsize::new(0),
    });
    let cfg = EvolverConfig {
        max_consecutive_failures: 1,
        ..evolver_config(1000)
    };
    let state = evolver(student, cfg)
        .run(&style("neutral"), "base:a", emb(unit(0)), &probe(), &reference, &CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(state.phase, SearchPhase::Failed);
    assert_eq!(state.step, 0);
    assert_eq!(state.render_failures, 1);
}

#[tokio::test]
async fn cancellation_keeps_best_and_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("warm.json");
    let token = CancellationToken::new();
    let reference = scorer().profile(&carrier(&mixed_target())).await;
    let student = Arc::new(CancellingStudent {
        inner: WorldStudent::new(&[], DIM),
        token: token.clone(),
        after: 40,
    });
    let ev = evolver(student, evolver_config(10_000));

    let state = ev
        .run(
            &style("warm"),
            "base:a",
            emb(vec![0.5, 0.5, 0.5, 0.5, 0.2, 0.2, 0.2, 0.2]),
            &probe(),
            &reference,
            &token,
            Some(&checkpoint),
        )
        .await
        .unwrap();

    assert_eq!(state.phase, SearchPhase::Cancelled);
    assert!(state.step < 25);
    let saved = SearchState::load(&checkpoint).unwrap();
    assert_eq!(saved.phase, SearchPhase::Cancelled);
    assert_eq!(saved.best_score, state.best_score);
    assert_eq!(saved.best, state.best);
}

#[tokio::test]
async fn cancelled_before_first_step() {
    let token = CancellationToken::new();
    token.cancel();
    let reference = scorer().profile(&carrier(&unit(0))).await;
    let ev = evolver(Arc::new(WorldStudent::new(&[], DIM)), evolver_config(100));
    let state = ev
        .run(&style("neutral"), "base:a", emb(unit(0)), &probe(), &reference, &token, None)
        .await
        .unwrap();
    assert_eq!(state.phase, SearchPhase::Cancelled);
    assert_eq!(state.step, 0);
    assert_eq!(state.history.len(), 1);
}

// ============================================================================
// Selector
// ============================================================================

#[tokio::test]
async fn selector_returns_best_candidate() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut random = || (0..DIM).map(|_| rng.gen_range(-1.0f32..1.0)).collect::<Vec<f32>>();
    let target = random();
    let bases: Vec<BaseEmbedding> = ["a", "b", "c", "d"]
        .iter()
        .map(|name| BaseEmbedding {
            name: name.to_string(),
            embedding: emb(random()),
        })
        .collect();

    let s = scorer();
    let reference = s.profile(&carrier(&target)).await;
    let student = Arc::new(WorldStudent::new(&[], DIM));
    let selector = StartingPointSelector::new(student.clone(), s, RetryPolicy::none(), SelectorConfig::default());
    let selection = selector
        .select(&style("neutral"), &bases, &probe(), &reference)
        .await
        .unwrap();

    // 4 bases + 6 pairs * 3 ratios + centroid
    assert_eq!(selection.ranking.len(), 23);
    assert_eq!(student.calls(), 23 * 2);
    assert_eq!(selection.render_failures, 0);
    for c in &selection.ranking {
        assert!(selection.score >= c.score, "{} beat the selection", c.label);
    }
    assert_eq!(selection.ranking[0].score, selection.score);
    assert_eq!(selection.ranking[0].label, selection.label);
}

#[tokio::test]
async fn selector_ties_keep_first_and_failures_are_fatal() {
    let s = scorer();
    // Nothing the student renders overlaps the reference, so all tie at 0.
    let reference = s.profile(&carrier(&unit(6))).await;
    let bases = vec![
        BaseEmbedding { name: "x".into(), embedding: emb(unit(0)) },
        BaseEmbedding { name: "y".into(), embedding: emb(unit(1)) },
    ];
    let student = Arc::new(WorldStudent::new(&[], 4));
    let selector = StartingPointSelector::new(student, s.clone(), RetryPolicy::none(), SelectorConfig::default());
    let selection = selector.select(&style("calm"), &bases, &probe(), &reference).await.unwrap();
    assert_eq!(selection.label, "base:x");
    assert_eq!(selection.score, 0.0);

    let broken = Arc::new(BrokenStudent { calls: AtomicUsize::new(0) });
    let selector = StartingPointSelector::new(broken, s, RetryPolicy::none(), SelectorConfig::default());
    let err = selector.select(&style("calm"), &bases, &probe(), &reference).await.unwrap_err();
    assert!(matches!(err, DistillError::NoViableCandidate { attempted: 6, .. }));
}

// ============================================================================
// Validator
// ============================================================================

#[tokio::test]
async fn validator_requires_distinct_styles() {
    let s = scorer();
    let student = Arc::new(WorldStudent::new(&[], DIM));
    let validator = VoiceValidator::new(student, s.clone(), RetryPolicy::none(), ValidatorConfig::default());

    let subject = |name: &str, target: Vec<f32>, voice: Vec<f32>| {
        let s = s.clone();
        let label = style(name);
        async move {
            ValidationSubject {
                style: label,
                embedding: emb(voice),
                reference: s.profile(&carrier(&target)).await,
                held_out: held_out(),
            }
        }
    };

    let distinct = vec![
        subject("neutral", unit(0), unit(0)).await,
        subject("warm", unit(1), unit(1)).await,
    ];
    let reports = validator.validate_all(&distinct).await;
    assert_eq!(reports.len(), 2);
    for r in &reports {
        assert!(r.pass, "{} failed: {:?}", r.style, r.failed());
        assert!((r.target_similarity - 1.0).abs() < 1e-6);
        assert!((r.self_similarity - 1.0).abs() < 1e-6);
        assert!(r.differentiation_metric.unwrap() > 0.05);
    }

    // Two styles that sound identical cannot both be told apart.
    let clones = vec![
        subject("neutral", unit(0), unit(0)).await,
        subject("warm", unit(0), unit(0)).await,
    ];
    let reports = validator.validate_all(&clones).await;
    for r in &reports {
        assert!(!r.pass);
        assert!(r.checks.target_similarity);
        assert!(!r.checks.differentiation);
        assert_eq!(r.differentiation_metric, Some(0.0));
    }
}

#[tokio::test]
async fn validator_flags_weak_target_similarity() {
    let s = scorer();
    let student = Arc::new(WorldStudent::new(&[], DIM));
    let validator = VoiceValidator::new(student, s.clone(), RetryPolicy::none(), ValidatorConfig::default());
    // cos = 0.6 against the reference.
    let subject = ValidationSubject {
        style: style("warm"),
        embedding: emb(vec![0.6, 0.8, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
        reference: s.profile(&carrier(&unit(0))).await,
        held_out: held_out(),
    };
    let reports = validator.validate_all(&[subject]).await;
    assert!(!reports[0].pass);
    assert_eq!(reports[0].failed(), vec!["target_similarity"]);
    assert!(reports[0].pairs.is_empty());
}

#[tokio::test]
async fn unrenderable_style_does_not_fail_its_peers() {
    let s = scorer();
    let student = Arc::new(PickyStudent {
        inner: WorldStudent::new(&[], DIM),
    });
    let validator = VoiceValidator::new(student, s.clone(), RetryPolicy::none(), ValidatorConfig::default());

    let mut subjects = Vec::new();
    for (name, dim) in [("neutral", 0), ("warm", 1), ("hoarse", DIM - 1)] {
        subjects.push(ValidationSubject {
            style: style(name),
            embedding: emb(unit(dim)),
            reference: s.profile(&carrier(&unit(dim))).await,
            held_out: held_out(),
        });
    }
    let reports = validator.validate_all(&subjects).await;

    for r in &reports[..2] {
        assert!(r.pass, "{} failed: {:?}", r.style, r.failed());
        assert_eq!(r.pairs.len(), 1);
        assert_eq!(r.unevaluated, vec![style("hoarse")]);
        assert_eq!(r.render_failures, 0);
    }
    let hoarse = &reports[2];
    assert!(!hoarse.pass);
    assert!(!hoarse.checks.target_similarity);
    assert!(hoarse.pairs.is_empty());
    assert_eq!(hoarse.unevaluated, vec![style("neutral"), style("warm")]);
    assert_eq!(hoarse.render_failures, 2);
}

// ============================================================================
// Pipeline
// ============================================================================

/// Four styles; only neutral and warm live in dimensions the student can
/// render.
fn world() -> (Arc<WorldTeacher>, Arc<WorldStudent>) {
    let teacher = WorldTeacher::new(&[
        ("neutral", unit(0)),
        ("warm", unit(1)),
        ("stern", unit(4)),
        ("shy", unit(5)),
    ]);
    let student = WorldStudent::new(
        &[("filler", unit(2)), ("neutral", unit(0)), ("warm", unit(1))],
        4,
    );
    (Arc::new(teacher), Arc::new(student))
}

fn engines(teacher: Arc<dyn TeacherEngine>, student: Arc<dyn StudentEngine>) -> Engines {
    Engines {
        teacher,
        student,
        encoder: Arc::new(HeadEncoder),
        extractor: Arc::new(HeadExtractor),
    }
}

fn world_config(dir: &Path) -> DistillConfig {
    let mut cfg = DistillConfig::default();
    cfg.work_dir = dir.to_path_buf();
    cfg.retry = RetryPolicy::none();
    cfg.max_parallel_styles = 2;
    cfg.evolver = EvolverConfig {
        step_budget: 60,
        early_stop_window: 10,
        log_every: 0,
        checkpoint_every: 20,
        seed: 5,
        ..EvolverConfig::default()
    };
    cfg
}

fn world_corpus(styles: &[&str]) -> Corpus {
    let mut corpus = Corpus::default();
    for s in styles {
        corpus.styles.insert(
            style(s),
            StyleCorpus {
                probe: probe(),
                held_out: held_out(),
                reference: vec![],
            },
        );
    }
    corpus
}

fn options(stage: Stage) -> PipelineOptions {
    PipelineOptions {
        stage,
        ..PipelineOptions::default()
    }
}

#[tokio::test]
async fn partial_deployment_publishes_passing_styles() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = world_config(dir.path());
    let (teacher, student) = world();
    let pipeline = Pipeline::new(
        cfg.clone(),
        world_corpus(&["neutral", "warm", "stern", "shy"]),
        engines(teacher.clone(), student),
        options(Stage::All),
        CancellationToken::new(),
    );
    let mut run = Run::new();
    pipeline.run(&mut run).await.unwrap();

    assert_eq!(run.status, RunStatus::Deployed);
    assert!(run.finished_at.is_some());
    let manifest = Manifest::load(&cfg.deploy_dir()).unwrap();
    assert_eq!(manifest.entries.len(), 2);
    let published: Vec<&str> = manifest.styles().into_iter().map(|s| s.as_str()).collect();
    assert_eq!(published, vec!["neutral", "warm"]);
    assert_eq!(manifest.active_style.as_ref().map(|s| s.as_str()), Some("neutral"));
    assert!(!cfg.deploy_dir().join("stern.json").exists());

    assert_eq!(run.outcome(&style("warm")).unwrap().status, StyleStatus::Deployed);
    assert_eq!(run.outcome(&style("warm")).unwrap().published_version, Some(1));
    let stern = run.outcome(&style("stern")).unwrap();
    assert_eq!(stern.status, StyleStatus::Rejected);
    assert_eq!(stern.start_label.as_deref(), Some("base:filler"));
    assert!(!stern.validation.as_ref().unwrap().checks.target_similarity);

    // Each reference was rendered once: two probe sentences per style.
    assert_eq!(teacher.calls.load(Ordering::SeqCst), 8);
    assert!(cfg.reference_dir().join("shy.wav").exists());
    assert!(cfg.checkpoint_path(&style("neutral")).exists());
    assert!(ValidationReport::path_in(&cfg.validation_dir(), &style("stern")).exists());
    assert!(cfg.runs_dir().join(format!("{}.json", run.id)).exists());

    let switch = StyleSwitch::load(cfg.deploy_dir()).unwrap();
    let warm = switch.resolve(Some("warm")).unwrap();
    assert_eq!(warm.embedding.shape(), &[DIM]);
    assert!(matches!(switch.resolve(Some("stern")), Err(DistillError::UnknownStyle(_))));

    let summary = run.summary().to_string();
    assert!(summary.contains("deployed"));
    assert!(summary.contains("rejected"));
}

#[tokio::test]
async fn zero_passing_styles_abort_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = world_config(dir.path());
    let (teacher, student) = world();
    let pipeline = Pipeline::new(
        cfg.clone(),
        world_corpus(&["stern", "shy"]),
        engines(teacher, student),
        options(Stage::All),
        CancellationToken::new(),
    );
    let mut run = Run::new();
    let err = pipeline.run(&mut run).await.unwrap_err();

    assert!(matches!(err, DistillError::DeploymentFailed { evaluated: 2 }));
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.is_some());
    assert!(!cfg.deploy_dir().join(MANIFEST_FILE).exists());
    assert!(!cfg.deploy_dir().join("stern.json").exists());
}

#[tokio::test]
async fn degraded_style_does_not_block_others() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = world_config(dir.path());
    let (teacher, student) = world();
    let pipeline = Pipeline::new(
        cfg.clone(),
        // The teacher has no voice for "hoarse".
        world_corpus(&["neutral", "hoarse"]),
        engines(teacher, student),
        options(Stage::All),
        CancellationToken::new(),
    );
    let mut run = Run::new();
    pipeline.run(&mut run).await.unwrap();

    assert_eq!(run.status, RunStatus::Deployed);
    let hoarse = run.outcome(&style("hoarse")).unwrap();
    assert_eq!(hoarse.status, StyleStatus::Degraded);
    assert!(hoarse.error.as_ref().unwrap().contains("reference synthesis failed"));
    let neutral = run.outcome(&style("neutral")).unwrap();
    assert_eq!(neutral.status, StyleStatus::Deployed);
    assert_eq!(neutral.validation.as_ref().unwrap().differentiation_metric, None);
}

#[tokio::test]
async fn all_styles_degraded_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let (teacher, student) = world();
    let pipeline = Pipeline::new(
        world_config(dir.path()),
        world_corpus(&["hoarse", "mute"]),
        engines(teacher, student),
        options(Stage::All),
        CancellationToken::new(),
    );
    let mut run = Run::new();
    let err = pipeline.run(&mut run).await.unwrap_err();
    assert!(matches!(err, DistillError::AllStylesFailed(2)));
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test]
async fn reference_stage_stops_after_references() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = world_config(dir.path());
    let (teacher, student) = world();
    let pipeline = Pipeline::new(
        cfg.clone(),
        world_corpus(&["neutral", "warm"]),
        engines(teacher, student.clone()),
        options(Stage::Reference),
        CancellationToken::new(),
    );
    let mut run = Run::new();
    pipeline.run(&mut run).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(student.calls(), 0);
    assert!(cfg.reference_dir().join("neutral.wav").exists());
    assert!(!cfg.checkpoint_dir().exists());
    assert_eq!(run.outcome(&style("warm")).unwrap().status, StyleStatus::ReferenceReady);
}

#[tokio::test]
async fn deploy_stage_reuses_persisted_results() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = world_config(dir.path());
    let corpus = world_corpus(&["neutral", "warm", "stern"]);
    let (teacher, student) = world();
    let first = Pipeline::new(
        cfg.clone(),
        corpus.clone(),
        engines(teacher, student),
        options(Stage::All),
        CancellationToken::new(),
    );
    first.run(&mut Run::new()).await.unwrap();

    // Nothing may be rendered the second time.
    let broken = Arc::new(BrokenStudent { calls: AtomicUsize::new(0) });
    let mute_teacher = Arc::new(WorldTeacher::new(&[]));
    let second = Pipeline::new(
        cfg.clone(),
        corpus,
        engines(mute_teacher.clone(), broken.clone()),
        options(Stage::Deploy),
        CancellationToken::new(),
    );
    let mut run = Run::new();
    second.run(&mut run).await.unwrap();

    assert_eq!(run.status, RunStatus::Deployed);
    assert_eq!(broken.calls.load(Ordering::SeqCst), 0);
    assert_eq!(mute_teacher.calls.load(Ordering::SeqCst), 0);
    assert_eq!(run.outcome(&style("neutral")).unwrap().published_version, Some(2));
    let manifest = Manifest::load(&cfg.deploy_dir()).unwrap();
    assert_eq!(manifest.entries.len(), 4);
    assert_eq!(manifest.latest(&style("warm")).unwrap().version, 2);
}

#[tokio::test]
async fn unknown_style_filter_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (teacher, student) = world();
    let pipeline = Pipeline::new(
        world_config(dir.path()),
        world_corpus(&["neutral"]),
        engines(teacher, student),
        PipelineOptions {
            styles: Some(vec![style("warm")]),
            ..options(Stage::All)
        },
        CancellationToken::new(),
    );
    let mut run = Run::new();
    assert!(matches!(
        pipeline.run(&mut run).await,
        Err(DistillError::UnknownStyle(_))
    ));
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test]
async fn cancelled_run_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let token = CancellationToken::new();
    token.cancel();
    let (teacher, student) = world();
    let pipeline = Pipeline::new(
        world_config(dir.path()),
        world_corpus(&["neutral", "warm"]),
        engines(teacher, student),
        options(Stage::All),
        token,
    );
    let mut run = Run::new();
    pipeline.run(&mut run).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.viable_styles().is_empty());
}

/// Deploys neutral and warm, then searches both again from a student that
/// only offers the filler voice. The second search leaves new checkpoints
/// next to the earlier, passing validation reports.
async fn deploy_then_search_again(cfg: &DistillConfig, corpus: &Corpus, teacher: Arc<WorldTeacher>) {
    let (_, student) = world();
    Pipeline::new(
        cfg.clone(),
        corpus.clone(),
        engines(teacher.clone(), student),
        options(Stage::All),
        CancellationToken::new(),
    )
    .run(&mut Run::new())
    .await
    .unwrap();

    let mut again = cfg.clone();
    again.evolver.seed = 999;
    let filler = Arc::new(WorldStudent::new(&[("filler", unit(2))], 4));
    Pipeline::new(
        again,
        corpus.clone(),
        engines(teacher, filler),
        options(Stage::Evolve),
        CancellationToken::new(),
    )
    .run(&mut Run::new())
    .await
    .unwrap();
}

fn saved_report(cfg: &DistillConfig, name: &str) -> ValidationReport {
    ValidationReport::load(ValidationReport::path_in(&cfg.validation_dir(), &style(name))).unwrap()
}

fn saved_checkpoint(cfg: &DistillConfig, name: &str) -> SearchState {
    SearchState::load(cfg.checkpoint_path(&style(name))).unwrap()
}

#[tokio::test]
async fn deploy_stage_revalidates_changed_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = world_config(dir.path());
    let corpus = world_corpus(&["neutral", "warm"]);
    let (teacher, _) = world();
    deploy_then_search_again(&cfg, &corpus, teacher.clone()).await;

    let published = Manifest::load(&cfg.deploy_dir()).unwrap();
    assert_eq!(published.entries.len(), 2);
    let checkpoint = saved_checkpoint(&cfg, "neutral");
    let stale = saved_report(&cfg, "neutral");
    assert!(stale.pass);
    assert!(!stale.covers(&checkpoint.best));

    // Validation of the new checkpoints cannot render anything, so
    // nothing may be published.
    let broken = Arc::new(BrokenStudent { calls: AtomicUsize::new(0) });
    let pipeline = Pipeline::new(
        cfg.clone(),
        corpus,
        engines(teacher, broken.clone()),
        options(Stage::Deploy),
        CancellationToken::new(),
    );
    let mut run = Run::new();
    let err = pipeline.run(&mut run).await.unwrap_err();

    assert!(matches!(err, DistillError::DeploymentFailed { evaluated: 2 }));
    assert!(broken.calls.load(Ordering::SeqCst) > 0);
    assert_eq!(Manifest::load(&cfg.deploy_dir()).unwrap().entries, published.entries);

    let fresh = saved_report(&cfg, "neutral");
    assert!(fresh.covers(&checkpoint.best));
    assert!(!fresh.pass);
    assert_eq!(fresh.render_failures, 2);
    let neutral = run.outcome(&style("neutral")).unwrap();
    assert_eq!(neutral.status, StyleStatus::Rejected);
    assert_eq!(neutral.counters.validation_render_failures, 2);
}

#[tokio::test]
async fn validate_stage_checks_the_current_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = world_config(dir.path());
    let corpus = world_corpus(&["neutral", "warm"]);
    let (teacher, _) = world();
    deploy_then_search_again(&cfg, &corpus, teacher.clone()).await;
    let published = Manifest::load(&cfg.deploy_dir()).unwrap();

    let (_, student) = world();
    let pipeline = Pipeline::new(
        cfg.clone(),
        corpus,
        engines(teacher, student.clone()),
        options(Stage::Validate),
        CancellationToken::new(),
    );
    let mut run = Run::new();
    pipeline.run(&mut run).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    // Held-out sentences only: two per style, no search renders.
    assert_eq!(student.calls(), 4);
    for name in ["neutral", "warm"] {
        assert!(saved_report(&cfg, name).covers(&saved_checkpoint(&cfg, name).best));
    }
    assert_eq!(Manifest::load(&cfg.deploy_dir()).unwrap().entries, published.entries);
}

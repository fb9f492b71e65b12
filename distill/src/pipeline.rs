//! Stage orchestration across styles.
//!
//! Each style's reference, starting point and search run in their own
//! task, bounded by `max_parallel_styles`. Validation then reads every
//! finished style at once, and the gate publishes what passed.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DistillConfig;
use crate::corpus::Corpus;
use crate::deploy::{DeploymentCandidate, DeploymentGate, DeploymentSummary};
use crate::engine::{FeatureExtractor, SpeakerEncoder, StudentEngine, TeacherEngine, VoiceSource};
use crate::error::{DistillError, DistillResult};
use crate::evolver::{SearchPhase, SearchState, VoiceEvolver};
use crate::reference::{ReferenceAudio, ReferenceSynthesizer};
use crate::run::{Run, RunStatus, StyleStatus};
use crate::scorer::{FitnessScorer, ReferenceProfile};
use crate::selector::{Selection, StartingPointSelector};
use crate::style::Style;
use crate::validator::{ValidationReport, ValidationSubject, VoiceValidator};

/// How far a run goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Reference audio only.
    Reference,
    /// References, starting points and search.
    Evolve,
    /// Everything up to validation; reuses finished checkpoints.
    Validate,
    /// Validation and deployment; reuses persisted reports when every
    /// style has one.
    Deploy,
    /// Every stage from scratch.
    All,
}

impl Stage {
    fn validates(self) -> bool {
        self >= Stage::Validate
    }

    fn deploys(self) -> bool {
        self >= Stage::Deploy
    }

    fn reuses_checkpoints(self) -> bool {
        matches!(self, Stage::Validate | Stage::Deploy)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reference => "reference",
            Self::Evolve => "evolve",
            Self::Validate => "validate",
            Self::Deploy => "deploy",
            Self::All => "all",
        })
    }
}

impl FromStr for Stage {
    type Err = DistillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reference" => Ok(Self::Reference),
            "evolve" => Ok(Self::Evolve),
            "validate" => Ok(Self::Validate),
            "deploy" => Ok(Self::Deploy),
            "all" => Ok(Self::All),
            _ => Err(DistillError::Config(format!("unknown stage: {s}"))),
        }
    }
}

/// The engines a pipeline drives. Shared read-only by every task.
#[derive(Clone)]
pub struct Engines {
    pub teacher: Arc<dyn TeacherEngine>,
    pub student: Arc<dyn StudentEngine>,
    pub encoder: Arc<dyn SpeakerEncoder>,
    pub extractor: Arc<dyn FeatureExtractor>,
}

/// Per-invocation overrides.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub stage: Stage,
    /// Restrict the run to these styles.
    pub styles: Option<Vec<Style>>,
    /// Use these files instead of teacher output.
    pub reference_overrides: BTreeMap<Style, PathBuf>,
    pub source: Option<VoiceSource>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            stage: Stage::All,
            styles: None,
            reference_overrides: BTreeMap::new(),
            source: None,
        }
    }
}

/// What one style's task hands back.
struct StyleWork {
    style: Style,
    reference: Option<ReferenceAudio>,
    profile: ReferenceProfile,
    selection: Option<Selection>,
    state: Option<SearchState>,
    failure: Option<(StyleStatus, String)>,
}

impl StyleWork {
    fn new(style: Style) -> Self {
        Self {
            style,
            reference: None,
            profile: ReferenceProfile::default(),
            selection: None,
            state: None,
            failure: None,
        }
    }

    fn failed(mut self, status: StyleStatus, reason: impl fmt::Display) -> Self {
        self.failure = Some((status, reason.to_string()));
        self
    }
}

/// State shared by every style task.
struct Shared {
    config: DistillConfig,
    corpus: Corpus,
    engines: Engines,
    scorer: FitnessScorer,
    references: ReferenceSynthesizer,
    cancel: CancellationToken,
    stage: Stage,
    overrides: BTreeMap<Style, PathBuf>,
}

/// Runs distillation stages over a corpus.
pub struct Pipeline {
    shared: Arc<Shared>,
    filter: Option<Vec<Style>>,
}

impl Pipeline {
    pub fn new(
        config: DistillConfig,
        corpus: Corpus,
        engines: Engines,
        options: PipelineOptions,
        cancel: CancellationToken,
    ) -> Self {
        let scorer = FitnessScorer::new(
            engines.encoder.clone(),
            engines.extractor.clone(),
            config.scorer.clone(),
        );
        let mut references = ReferenceSynthesizer::new(
            engines.teacher.clone(),
            config.retry.clone(),
            config.reference.clone(),
            config.reference_dir(),
        );
        if let Some(source) = options.source {
            references = references.with_source(source);
        }
        Self {
            shared: Arc::new(Shared {
                config,
                corpus,
                engines,
                scorer,
                references,
                cancel,
                stage: options.stage,
                overrides: options.reference_overrides,
            }),
            filter: options.styles,
        }
    }

    pub fn config(&self) -> &DistillConfig {
        &self.shared.config
    }

    /// Corpus styles, restricted to the filter when one is set.
    pub fn styles(&self) -> DistillResult<Vec<Style>> {
        let corpus = &self.shared.corpus;
        match &self.filter {
            None => Ok(corpus.styles().cloned().collect()),
            Some(filter) => {
                let mut out = Vec::with_capacity(filter.len());
                for s in filter {
                    if corpus.get(s).is_none() {
                        return Err(DistillError::UnknownStyle(s.to_string()));
                    }
                    if !out.contains(s) {
                        out.push(s.clone());
                    }
                }
                Ok(out)
            }
        }
    }

    /// Runs the configured stages, recording everything in `run`. The run
    /// record is written to the runs directory whatever the outcome.
    pub async fn run(&self, run: &mut Run) -> DistillResult<()> {
        let styles = match self.styles() {
            Ok(s) if s.is_empty() => Err(DistillError::Config("corpus has no styles".into())),
            other => other,
        };
        let styles = match styles {
            Ok(s) => s,
            Err(e) => {
                run.fail(&e);
                return Err(e);
            }
        };
        run.start(styles.iter().cloned());
        info!(run = %run.id, stage = %self.shared.stage, styles = styles.len(), "run started");

        let result = self.drive(run, &styles).await;
        match &result {
            Ok(status) => run.finish(*status),
            Err(e) => {
                error!(run = %run.id, error = %e, "run failed");
                run.fail(e);
            }
        }
        if let Err(e) = run.save(&self.shared.config.runs_dir()) {
            warn!(run = %run.id, error = %e, "cannot persist run record");
        }
        info!(run = %run.id, status = %run.status, "run finished");
        result.map(|_| ())
    }

    async fn drive(&self, run: &mut Run, styles: &[Style]) -> DistillResult<RunStatus> {
        let sh = &self.shared;
        if sh.stage == Stage::Deploy {
            if let Some(candidates) = self.persisted_candidates(run, styles)? {
                info!(styles = candidates.len(), "deploying persisted validation results");
                self.deploy(run, &candidates)?;
                return Ok(RunStatus::Deployed);
            }
        }

        let profiles = self.run_styles(run, styles).await;
        if sh.cancel.is_cancelled() {
            return Ok(RunStatus::Cancelled);
        }
        if run.viable_styles().is_empty() {
            return Err(DistillError::AllStylesFailed(styles.len()));
        }
        if !sh.stage.validates() {
            return Ok(RunStatus::Completed);
        }

        let Some(reports) = cancellable(&sh.cancel, self.validate(run, &profiles)).await else {
            return Ok(RunStatus::Cancelled);
        };
        let reports = reports?;
        if !sh.stage.deploys() {
            return Ok(RunStatus::Completed);
        }

        let candidates: Vec<DeploymentCandidate> = reports
            .into_iter()
            .filter_map(|report| {
                let state = run.outcome(&report.style)?.search.as_ref()?;
                Some(DeploymentCandidate {
                    embedding: state.best.clone(),
                    tag: Some(state.tag()),
                    report,
                })
            })
            .collect();
        self.deploy(run, &candidates)?;
        Ok(RunStatus::Deployed)
    }

    /// Spawns one task per style and folds their results into `run`.
    async fn run_styles(&self, run: &mut Run, styles: &[Style]) -> HashMap<Style, ReferenceProfile> {
        let sem = Arc::new(Semaphore::new(self.shared.config.max_parallel_styles.max(1)));
        let mut set = JoinSet::new();
        let mut ids = HashMap::new();
        for style in styles {
            let sh = self.shared.clone();
            let sem = sem.clone();
            let task_style = style.clone();
            let handle = set.spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return StyleWork::new(task_style).failed(StyleStatus::Cancelled, "worker pool closed");
                };
                style_task(sh, task_style).await
            });
            ids.insert(handle.id(), style.clone());
        }

        let mut profiles = HashMap::new();
        while let Some(res) = set.join_next_with_id().await {
            match res {
                Ok((_, work)) => record_work(run, work, &mut profiles),
                Err(e) => {
                    error!(error = %e, "style task aborted");
                    if let Some(style) = ids.get(&e.id()) {
                        run.outcome_mut(style)
                            .fail(StyleStatus::SearchFailed, format!("task aborted: {e}"));
                    }
                }
            }
        }
        profiles
    }

    async fn validate(
        &self,
        run: &mut Run,
        profiles: &HashMap<Style, ReferenceProfile>,
    ) -> DistillResult<Vec<ValidationReport>> {
        let sh = &self.shared;
        let subjects: Vec<ValidationSubject> = run
            .viable_styles()
            .into_iter()
            .filter_map(|style| {
                let state = run.outcome(&style)?.search.as_ref()?;
                let held_out = sh.corpus.get(&style)?.held_out.clone();
                Some(ValidationSubject {
                    embedding: state.best.clone(),
                    reference: profiles.get(&style).cloned().unwrap_or_default(),
                    held_out,
                    style,
                })
            })
            .collect();
        if subjects.is_empty() {
            return Err(DistillError::AllStylesFailed(run.styles.len()));
        }

        let validator = VoiceValidator::new(
            sh.engines.student.clone(),
            sh.scorer.clone(),
            sh.config.retry.clone(),
            sh.config.validator.clone(),
        );
        let reports = validator.validate_all(&subjects).await;
        let dir = sh.config.validation_dir();
        for report in &reports {
            report.save(&dir)?;
            run.outcome_mut(&report.style).record_validation(report.clone());
        }
        let passed = reports.iter().filter(|r| r.pass).count();
        info!(validated = reports.len(), passed, "validation complete");
        Ok(reports)
    }

    fn deploy(&self, run: &mut Run, candidates: &[DeploymentCandidate]) -> DistillResult<DeploymentSummary> {
        let sh = &self.shared;
        let gate = DeploymentGate::new(sh.config.deploy_dir(), sh.config.deploy.clone());
        let summary = gate.deploy(candidates)?;
        for entry in &summary.published {
            let o = run.outcome_mut(&entry.style);
            o.status = StyleStatus::Deployed;
            o.published_version = Some(entry.version);
        }
        Ok(summary)
    }

    /// Loads every style's checkpoint and validation report, or `None` if
    /// any style lacks one or its report was made for another embedding.
    fn persisted_candidates(
        &self,
        run: &mut Run,
        styles: &[Style],
    ) -> DistillResult<Option<Vec<DeploymentCandidate>>> {
        let cfg = &self.shared.config;
        let mut out = Vec::with_capacity(styles.len());
        for style in styles {
            let checkpoint = cfg.checkpoint_path(style);
            let report = ValidationReport::path_in(&cfg.validation_dir(), style);
            if !checkpoint.exists() || !report.exists() {
                return Ok(None);
            }
            let state = SearchState::load(checkpoint)?;
            let report = ValidationReport::load(report)?;
            if !report.covers(&state.best) {
                info!(style = %style, "checkpoint changed since validation, validating again");
                return Ok(None);
            }
            out.push((state, report));
        }

        let mut candidates = Vec::with_capacity(out.len());
        for (state, report) in out {
            let o = run.outcome_mut(&state.style);
            candidates.push(DeploymentCandidate {
                embedding: state.best.clone(),
                tag: Some(state.tag()),
                report: report.clone(),
            });
            o.record_search(state);
            o.record_validation(report);
        }
        Ok(Some(candidates))
    }
}

/// Awaits `fut` unless the token fires first.
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        v = fut => Some(v),
    }
}

/// Reference, starting point and search for one style.
async fn style_task(sh: Arc<Shared>, style: Style) -> StyleWork {
    let mut work = StyleWork::new(style.clone());
    let Some(corpus) = sh.corpus.get(&style) else {
        return work.failed(StyleStatus::Degraded, DistillError::UnknownStyle(style.to_string()));
    };

    let spec = sh.config.style_spec(&style);
    let override_path = sh.overrides.get(&style).map(PathBuf::as_path);
    let reference = cancellable(
        &sh.cancel,
        sh.references
            .obtain(&style, &spec, corpus.reference_sentences(), override_path),
    )
    .await;
    let reference = match reference {
        None => return work.failed(StyleStatus::Cancelled, "cancelled"),
        Some(Err(e)) => {
            warn!(style = %style, error = %e, "style degraded");
            return work.failed(StyleStatus::Degraded, e);
        }
        Some(Ok(r)) => r,
    };
    work.profile = sh.scorer.profile(&reference.audio).await;
    if work.profile.speaker.is_none() {
        warn!(style = %style, "reference yields no speaker vector; target similarity will be 0");
    }
    work.reference = Some(reference);
    if sh.stage == Stage::Reference {
        return work;
    }

    let checkpoint = sh.config.checkpoint_path(&style);
    if sh.stage.reuses_checkpoints() && checkpoint.exists() {
        match SearchState::load(&checkpoint) {
            Ok(state) if state.phase.is_terminal() && state.phase != SearchPhase::Cancelled => {
                info!(style = %style, phase = %state.phase, score = state.best_score, "reusing checkpoint");
                work.state = Some(state);
                return work;
            }
            Ok(state) => {
                info!(style = %style, phase = %state.phase, "checkpoint unfinished, searching again");
            }
            Err(e) => warn!(style = %style, error = %e, "cannot read checkpoint, searching again"),
        }
    }

    let retry = &sh.config.retry;
    let student = &sh.engines.student;
    let (bases, _) = retry.run("base_embeddings", || student.base_embeddings()).await;
    let bases = match bases {
        Ok(b) => b,
        Err(e) => return work.failed(StyleStatus::SearchFailed, e),
    };

    let selector = StartingPointSelector::new(
        student.clone(),
        sh.scorer.clone(),
        retry.clone(),
        sh.config.selector.clone(),
    );
    let selection = cancellable(
        &sh.cancel,
        selector.select(&style, &bases, &corpus.probe, &work.profile),
    )
    .await;
    let selection = match selection {
        None => return work.failed(StyleStatus::Cancelled, "cancelled"),
        Some(Err(e)) => {
            warn!(style = %style, error = %e, "no starting point");
            return work.failed(StyleStatus::SearchFailed, e);
        }
        Some(Ok(s)) => s,
    };

    let evolver = VoiceEvolver::new(
        student.clone(),
        sh.scorer.clone(),
        retry.clone(),
        sh.config.evolver.clone(),
    );
    let state = evolver
        .run(
            &style,
            &selection.label,
            selection.embedding.clone(),
            &corpus.probe,
            &work.profile,
            &sh.cancel,
            Some(&checkpoint),
        )
        .await;
    work.selection = Some(selection);
    match state {
        Ok(state) => work.state = Some(state),
        Err(e) => return work.failed(StyleStatus::SearchFailed, e),
    }
    work
}

fn record_work(run: &mut Run, work: StyleWork, profiles: &mut HashMap<Style, ReferenceProfile>) {
    let o = run.outcome_mut(&work.style);
    if let Some(r) = &work.reference {
        o.status = StyleStatus::ReferenceReady;
        o.reference_path = Some(r.path.clone());
        o.reference_reused = r.reused;
        o.counters.reference_retries = r.retries;
    }
    if let Some(selection) = &work.selection {
        o.record_selection(selection);
    }
    if let Some(state) = work.state {
        o.record_search(state);
    }
    if let Some((status, reason)) = work.failure {
        o.fail(status, reason);
    }
    profiles.insert(work.style, work.profile);
}

//! The `run` command: drives the pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use voxkit_distill::remote::{HttpSpeakerEncoder, HttpStudent, HttpTeacher};
use voxkit_distill::{
    Corpus, DistillConfig, Engines, FbankDescriptorExtractor, Pipeline, PipelineOptions, Run,
    RunStatus, SpeakerEncoder, StatsPoolingEncoder, Stage, Style, VoiceSource, Waveform,
};

use super::{load_config, output_result};
use crate::Cli;

/// Run distillation stages.
///
/// Stages: reference, evolve, validate, deploy, all. `validate` and
/// `deploy` reuse finished checkpoints; `all` searches from scratch.
#[derive(Args)]
pub struct RunCommand {
    /// Last stage to run
    #[arg(long, default_value = "all")]
    stage: Stage,

    /// Only these styles (comma-separated)
    #[arg(long, value_delimiter = ',', value_parser = parse_style)]
    styles: Vec<Style>,

    /// Use a recorded reference instead of the teacher (STYLE=PATH, repeatable)
    #[arg(long = "reference", value_parser = parse_override)]
    references: Vec<(Style, PathBuf)>,

    /// Override the corpus file
    #[arg(long)]
    corpus: Option<PathBuf>,

    /// Override the work directory
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Override the search step budget
    #[arg(long)]
    steps: Option<u64>,

    /// Override the search seed
    #[arg(long)]
    seed: Option<u64>,
}

fn parse_style(s: &str) -> Result<Style, String> {
    Style::new(s.trim()).map_err(|e| e.to_string())
}

fn parse_override(s: &str) -> Result<(Style, PathBuf), String> {
    let (style, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected STYLE=PATH, got {s:?}"))?;
    Ok((parse_style(style)?, PathBuf::from(path)))
}

impl RunCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let mut cfg = load_config(cli)?;
        if let Some(dir) = &self.work_dir {
            cfg.work_dir = dir.clone();
        }
        if let Some(corpus) = &self.corpus {
            cfg.corpus = corpus.clone();
        }
        if let Some(steps) = self.steps {
            cfg.evolver.step_budget = steps;
        }
        if let Some(seed) = self.seed {
            cfg.evolver.seed = seed;
        }
        cfg.validate()?;

        let corpus = Corpus::load(&cfg.corpus)
            .with_context(|| format!("load corpus {}", cfg.corpus.display()))?;
        let engines = build_engines(&cfg)?;
        let options = PipelineOptions {
            stage: self.stage,
            styles: (!self.styles.is_empty()).then(|| self.styles.clone()),
            reference_overrides: self.references.iter().cloned().collect(),
            source: load_source(&cfg)?,
        };

        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after the current step");
                on_signal.cancel();
            }
        });

        info!(
            work_dir = %cfg.work_dir.display(),
            deploy_dir = %cfg.deploy_dir().display(),
            stage = %self.stage,
            "starting"
        );
        let pipeline = Pipeline::new(cfg, corpus, engines, options, cancel);
        let mut run = Run::new();
        let result = pipeline.run(&mut run).await;

        let summary = run.summary();
        if cli.json || cli.output.is_some() {
            output_result(&summary, cli.output.as_deref(), cli.json)?;
        } else {
            print!("{summary}");
        }

        result?;
        if run.status == RunStatus::Cancelled {
            bail!("run {} cancelled", run.id);
        }
        Ok(())
    }
}

/// Remote teacher and student; remote or built-in encoder; built-in
/// feature extractor.
fn build_engines(cfg: &DistillConfig) -> anyhow::Result<Engines> {
    let endpoints = &cfg.engines;
    let teacher = HttpTeacher::new(&endpoints.teacher).context("engines.teacher")?;
    let student = HttpStudent::new(&endpoints.student).context("engines.student")?;
    let encoder: Arc<dyn SpeakerEncoder> = if endpoints.encoder.is_enabled() {
        Arc::new(
            HttpSpeakerEncoder::new(&endpoints.encoder, endpoints.encoder_dimension)
                .context("engines.encoder")?,
        )
    } else {
        info!("no encoder endpoint, using built-in statistics pooling encoder");
        Arc::new(StatsPoolingEncoder::new(cfg.features.clone()))
    };
    Ok(Engines {
        teacher: Arc::new(teacher),
        student: Arc::new(student),
        encoder,
        extractor: Arc::new(FbankDescriptorExtractor::new(cfg.features.clone())),
    })
}

fn load_source(cfg: &DistillConfig) -> anyhow::Result<Option<VoiceSource>> {
    let Some(path) = &cfg.source_audio else {
        return Ok(None);
    };
    let audio = Waveform::read_wav(path).with_context(|| format!("read source audio {}", path.display()))?;
    if cfg.source_transcript.is_empty() {
        warn!(path = %path.display(), "source audio has no transcript");
    }
    Ok(Some(VoiceSource {
        audio,
        transcript: cfg.source_transcript.clone(),
    }))
}

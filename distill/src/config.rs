//! Configuration for a distillation workspace.
//!
//! Stored as YAML (or JSON, by extension), by default at
//! `~/.voxkit/voicedistill/config.yaml`. Every field has a default, so an
//! empty file is a valid configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::deploy::DeployConfig;
use crate::engine::RetryPolicy;
use crate::error::{DistillError, DistillResult};
use crate::evolver::EvolverConfig;
use crate::features::FeatureConfig;
use crate::reference::{ReferenceConfig, StyleSpec};
use crate::remote::EngineEndpoints;
use crate::scorer::ScorerConfig;
use crate::selector::SelectorConfig;
use crate::style::Style;
use crate::validator::ValidatorConfig;

/// Default base configuration directory name.
pub const DEFAULT_BASE_DIR: &str = ".voxkit";
/// Application directory under the base directory.
pub const APP_NAME: &str = "voicedistill";
/// Default configuration filename.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillConfig {
    /// Root for references, checkpoints, reports and run records
    /// (default: `./distill-work`).
    pub work_dir: PathBuf,
    /// Where embeddings are published (default: `<work_dir>/deploy`).
    pub deploy_dir: Option<PathBuf>,
    /// Sentence corpus, YAML or JSON (default: `corpus.yaml`).
    pub corpus: PathBuf,
    /// Voice sample the teacher clones from.
    pub source_audio: Option<PathBuf>,
    /// Transcript of `source_audio`.
    pub source_transcript: String,
    /// Styles searched concurrently (default: 4).
    pub max_parallel_styles: usize,
    /// Per-style reading instructions for the teacher.
    pub styles: BTreeMap<Style, StyleSpec>,
    pub reference: ReferenceConfig,
    pub selector: SelectorConfig,
    pub scorer: ScorerConfig,
    pub features: FeatureConfig,
    pub evolver: EvolverConfig,
    pub validator: ValidatorConfig,
    pub deploy: DeployConfig,
    pub retry: RetryPolicy,
    pub engines: EngineEndpoints,
}

impl Default for DistillConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("distill-work"),
            deploy_dir: None,
            corpus: PathBuf::from("corpus.yaml"),
            source_audio: None,
            source_transcript: String::new(),
            max_parallel_styles: 4,
            styles: BTreeMap::new(),
            reference: ReferenceConfig::default(),
            selector: SelectorConfig::default(),
            scorer: ScorerConfig::default(),
            features: FeatureConfig::default(),
            evolver: EvolverConfig::default(),
            validator: ValidatorConfig::default(),
            deploy: DeployConfig::default(),
            retry: RetryPolicy::default(),
            engines: EngineEndpoints::default(),
        }
    }
}

impl DistillConfig {
    /// `~/.voxkit/voicedistill/config.yaml`, if a home directory exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(DEFAULT_BASE_DIR).join(APP_NAME).join(DEFAULT_CONFIG_FILE))
    }

    /// Loads and validates a config file.
    pub fn load(path: impl AsRef<Path>) -> DistillResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let cfg: Self = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_slice(&data)?,
            _ => serde_yaml::from_slice(&data)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads `path`, else the default path if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> DistillResult<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }
        match Self::default_path() {
            Some(p) if p.exists() => Self::load(p),
            _ => Ok(Self::default()),
        }
    }

    pub fn to_yaml(&self) -> DistillResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Rejects settings that would make a stage meaningless.
    pub fn validate(&self) -> DistillResult<()> {
        let bad = |msg: String| Err(DistillError::Config(msg));

        let s = &self.scorer;
        if !(s.target_weight > 0.0 && s.self_weight > 0.0 && s.feature_weight > 0.0) {
            return bad("scorer weights must be positive".into());
        }
        let e = &self.evolver;
        if !(e.diversity_min > 0.0 && e.diversity_min <= e.diversity_max) {
            return bad(format!(
                "evolver diversity range [{}, {}] is invalid",
                e.diversity_min, e.diversity_max
            ));
        }
        if e.step_budget == 0 {
            return bad("evolver.step_budget must be positive".into());
        }
        if !(e.early_stop_ratio > 0.0 && e.early_stop_ratio <= 1.0) {
            return bad("evolver.early_stop_ratio must be in (0, 1]".into());
        }
        if e.max_consecutive_failures == 0 {
            return bad("evolver.max_consecutive_failures must be positive".into());
        }
        if self.selector.mix_ratios.iter().any(|r| !(*r > 0.0 && *r < 1.0)) {
            return bad("selector.mix_ratios must lie strictly between 0 and 1".into());
        }
        let r = &self.reference;
        if r.min_duration > r.max_duration || r.max_duration.is_zero() {
            return bad("reference duration bounds are invalid".into());
        }
        if self.retry.max_attempts == 0 {
            return bad("retry.max_attempts must be positive".into());
        }
        if self.max_parallel_styles == 0 {
            return bad("max_parallel_styles must be positive".into());
        }
        Ok(())
    }

    /// The teacher instructions for a style, defaulted when absent.
    pub fn style_spec(&self, style: &Style) -> StyleSpec {
        self.styles.get(style).cloned().unwrap_or_default()
    }

    pub fn reference_dir(&self) -> PathBuf {
        self.work_dir.join("reference")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.work_dir.join("checkpoints")
    }

    pub fn validation_dir(&self) -> PathBuf {
        self.work_dir.join("validation")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.work_dir.join("runs")
    }

    pub fn deploy_dir(&self) -> PathBuf {
        self.deploy_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("deploy"))
    }

    pub fn checkpoint_path(&self, style: &Style) -> PathBuf {
        self.checkpoint_dir().join(format!("{style}.json"))
    }
}

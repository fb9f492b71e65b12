//! Publishing validated embeddings and switching between them.
//!
//! # Layout
//!
//! ```text
//! <deploy_dir>/
//!   manifest.json      entries + active_style
//!   warm.json          latest published embedding for "warm"
//!   neutral.json
//! ```
//!
//! Every file is written to a sibling `.tmp`, synced and renamed, so a
//! reader never observes a partial artifact. The manifest is written last.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::embedding::{EmbeddingTag, VoiceEmbedding};
use crate::error::{DistillError, DistillResult};
use crate::style::Style;
use crate::validator::ValidationReport;

/// Manifest file name inside the deploy directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Writes `data` to `path` via a synced temporary file and a rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> DistillResult<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Gate settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Preferred active style when it passes.
    pub default_style: Option<Style>,
}

/// One publication of one style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub style: Style,
    /// Starts at 1 and increments per style.
    pub version: u32,
    pub checksum: String,
    pub validated_at: DateTime<Utc>,
    pub published_at: DateTime<Utc>,
    /// File name relative to the deploy directory.
    pub path: String,
}

/// The deployment sidecar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub entries: Vec<ManifestEntry>,
    #[serde(default)]
    pub active_style: Option<Style>,
}

impl Manifest {
    /// Loads `<dir>/manifest.json`, or an empty manifest if absent.
    pub fn load(dir: &Path) -> DistillResult<Self> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, dir: &Path) -> DistillResult<()> {
        write_atomic(&dir.join(MANIFEST_FILE), &serde_json::to_vec_pretty(self)?)
    }

    /// Highest-version entry for a style.
    pub fn latest(&self, style: &Style) -> Option<&ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| &e.style == style)
            .max_by_key(|e| e.version)
    }

    pub fn next_version(&self, style: &Style) -> u32 {
        self.latest(style).map_or(1, |e| e.version + 1)
    }

    /// Every style with at least one entry, sorted.
    pub fn styles(&self) -> BTreeSet<&Style> {
        self.entries.iter().map(|e| &e.style).collect()
    }
}

/// Contents of a published `<style>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedEmbedding {
    pub style: Style,
    pub version: u32,
    pub tag: Option<EmbeddingTag>,
    pub embedding: VoiceEmbedding,
}

/// A style offered to the gate.
#[derive(Debug, Clone)]
pub struct DeploymentCandidate {
    pub embedding: VoiceEmbedding,
    pub report: ValidationReport,
    pub tag: Option<EmbeddingTag>,
}

impl DeploymentCandidate {
    /// Passed validation, and the validated embedding is this one.
    fn publishable(&self) -> bool {
        self.report.pass && self.report.covers(&self.embedding)
    }

    fn failed_checks(&self) -> Vec<String> {
        let mut failed: Vec<String> = self.report.failed().into_iter().map(String::from).collect();
        if !self.report.covers(&self.embedding) {
            failed.push("embedding_checksum".into());
        }
        failed
    }
}

/// A style the gate refused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedStyle {
    pub style: Style,
    pub failed_checks: Vec<String>,
}

/// Outcome of one deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSummary {
    pub published: Vec<ManifestEntry>,
    pub skipped: Vec<SkippedStyle>,
    pub active_style: Option<Style>,
}

/// Publishes passing styles and refuses the rest.
pub struct DeploymentGate {
    dir: PathBuf,
    cfg: DeployConfig,
}

impl DeploymentGate {
    pub fn new(dir: impl Into<PathBuf>, cfg: DeployConfig) -> Self {
        Self {
            dir: dir.into(),
            cfg,
        }
    }

    /// Publishes every candidate whose report passed for the embedding
    /// it carries.
    ///
    /// Fails with [`DistillError::DeploymentFailed`] without touching the
    /// deploy directory when no candidate qualifies.
    pub fn deploy(&self, candidates: &[DeploymentCandidate]) -> DistillResult<DeploymentSummary> {
        let (passing, failing): (Vec<_>, Vec<_>) =
            candidates.iter().partition(|c| c.publishable());

        let skipped: Vec<SkippedStyle> = failing
            .iter()
            .map(|c| SkippedStyle {
                style: c.report.style.clone(),
                failed_checks: c.failed_checks(),
            })
            .collect();
        for s in &skipped {
            warn!(style = %s.style, failed = ?s.failed_checks, "style not deployed");
        }
        if passing.is_empty() {
            return Err(DistillError::DeploymentFailed {
                evaluated: candidates.len(),
            });
        }

        let mut manifest = Manifest::load(&self.dir)?;
        let now = Utc::now();
        let mut published = Vec::with_capacity(passing.len());
        for c in &passing {
            let style = &c.report.style;
            let version = manifest.next_version(style);
            let file = format!("{style}.json");
            let artifact = PublishedEmbedding {
                style: style.clone(),
                version,
                tag: c.tag.clone(),
                embedding: c.embedding.clone(),
            };
            write_atomic(&self.dir.join(&file), &serde_json::to_vec(&artifact)?)?;

            let entry = ManifestEntry {
                style: style.clone(),
                version,
                checksum: c.embedding.checksum(),
                validated_at: c.report.validated_at,
                published_at: now,
                path: file,
            };
            info!(style = %style, version, checksum = %entry.checksum, "embedding published");
            manifest.entries.push(entry.clone());
            published.push(entry);
        }

        let passed = |s: &Style| passing.iter().any(|c| &c.report.style == s);
        let active = match (&self.cfg.default_style, &manifest.active_style) {
            (Some(d), _) if passed(d) => Some(d.clone()),
            (_, Some(prev)) if manifest.latest(prev).is_some() => Some(prev.clone()),
            _ => passing.first().map(|c| c.report.style.clone()),
        };
        manifest.active_style = active;
        manifest.save(&self.dir)?;
        info!(
            published = published.len(),
            skipped = skipped.len(),
            active = ?manifest.active_style,
            "deployment complete"
        );

        Ok(DeploymentSummary {
            published,
            skipped,
            active_style: manifest.active_style,
        })
    }
}

/// Runtime lookup of deployed embeddings by style.
pub struct StyleSwitch {
    dir: PathBuf,
    manifest: Manifest,
}

impl StyleSwitch {
    pub fn load(dir: impl Into<PathBuf>) -> DistillResult<Self> {
        let dir = dir.into();
        let manifest = Manifest::load(&dir)?;
        Ok(Self { dir, manifest })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn active_style(&self) -> Option<&Style> {
        self.manifest.active_style.as_ref()
    }

    pub fn styles(&self) -> Vec<&Style> {
        self.manifest.styles().into_iter().collect()
    }

    /// Returns the latest embedding for `style`, or for the active style
    /// when `None`. The file's checksum must match the manifest.
    pub fn resolve(&self, style: Option<&str>) -> DistillResult<PublishedEmbedding> {
        let entry = self.entry(style)?;
        let path = self.dir.join(&entry.path);
        let data = std::fs::read(&path)?;
        let published: PublishedEmbedding = serde_json::from_slice(&data)?;
        let got = published.embedding.checksum();
        if got != entry.checksum {
            return Err(DistillError::ChecksumMismatch {
                path: path.display().to_string(),
                expected: entry.checksum.clone(),
                got,
            });
        }
        Ok(published)
    }

    /// Points the active style at a published style.
    pub fn set_active(&mut self, style: &str) -> DistillResult<()> {
        let entry = self.entry(Some(style))?;
        let style = entry.style.clone();
        self.manifest.active_style = Some(style.clone());
        self.manifest.save(&self.dir)?;
        info!(style = %style, "active style switched");
        Ok(())
    }

    fn entry(&self, style: Option<&str>) -> DistillResult<&ManifestEntry> {
        let style = match style {
            Some(s) => Style::new(s).map_err(|_| DistillError::UnknownStyle(s.to_string()))?,
            None => self
                .manifest
                .active_style
                .clone()
                .ok_or_else(|| DistillError::UnknownStyle("no active style".into()))?,
        };
        self.manifest
            .latest(&style)
            .ok_or_else(|| DistillError::UnknownStyle(style.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::ValidatorConfig;

    fn candidate(style: &str, target: f64, value: f32) -> DeploymentCandidate {
        let style = Style::new(style).unwrap();
        let embedding = VoiceEmbedding::from_vec(vec![value, value + 1.0]).unwrap();
        DeploymentCandidate {
            report: ValidationReport::evaluate(style, &embedding, target, 0.9, vec![], &ValidatorConfig::default()),
            embedding,
            tag: None,
        }
    }

    #[test]
    fn partial_deployment() {
        let dir = tempfile::tempdir().unwrap();
        let gate = DeploymentGate::new(dir.path(), DeployConfig::default());
        let summary = gate
            .deploy(&[
                candidate("neutral", 0.8, 1.0),
                candidate("warm", 0.5, 2.0),
                candidate("calm", 0.9, 3.0),
                candidate("stern", 0.1, 4.0),
            ])
            .unwrap();
        assert_eq!(summary.published.len(), 2);
        assert_eq!(summary.skipped.len(), 2);

        let manifest = Manifest::load(dir.path()).unwrap();
        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.active_style.as_ref().unwrap().as_str(), "neutral");
        assert!(dir.path().join("calm.json").exists());
        assert!(!dir.path().join("warm.json").exists());
        assert!(!dir.path().join("manifest.json.tmp").exists());
    }

    #[test]
    fn zero_pass_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let gate = DeploymentGate::new(dir.path(), DeployConfig::default());
        let err = gate
            .deploy(&[candidate("neutral", 0.1, 1.0), candidate("warm", 0.2, 2.0)])
            .unwrap_err();
        assert!(matches!(err, DistillError::DeploymentFailed { evaluated: 2 }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn report_for_another_embedding_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let gate = DeploymentGate::new(dir.path(), DeployConfig::default());
        let mut stale = candidate("warm", 0.9, 1.0);
        stale.embedding = VoiceEmbedding::from_vec(vec![7.0, 8.0]).unwrap();
        assert!(stale.report.pass);

        let err = gate.deploy(&[stale.clone()]).unwrap_err();
        assert!(matches!(err, DistillError::DeploymentFailed { evaluated: 1 }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let s = gate.deploy(&[stale, candidate("neutral", 0.9, 2.0)]).unwrap();
        assert_eq!(s.published.len(), 1);
        assert_eq!(s.published[0].style.as_str(), "neutral");
        assert_eq!(s.skipped[0].style.as_str(), "warm");
        assert_eq!(s.skipped[0].failed_checks, vec!["embedding_checksum".to_string()]);
        assert!(!dir.path().join("warm.json").exists());
    }

    #[test]
    fn versions_increment_and_default_style_wins() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DeployConfig {
            default_style: Some(Style::new("warm").unwrap()),
        };
        let gate = DeploymentGate::new(dir.path(), cfg);
        gate.deploy(&[candidate("neutral", 0.8, 1.0)]).unwrap();
        let s = gate
            .deploy(&[candidate("neutral", 0.8, 5.0), candidate("warm", 0.8, 2.0)])
            .unwrap();
        assert_eq!(s.published[0].version, 2);
        assert_eq!(s.published[1].version, 1);
        assert_eq!(s.active_style.unwrap().as_str(), "warm");

        let switch = StyleSwitch::load(dir.path()).unwrap();
        let neutral = switch.resolve(Some("neutral")).unwrap();
        assert_eq!(neutral.version, 2);
        assert_eq!(neutral.embedding.data(), &[5.0, 6.0]);
        assert_eq!(switch.resolve(None).unwrap().style.as_str(), "warm");
    }

    #[test]
    fn previous_active_style_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let gate = DeploymentGate::new(dir.path(), DeployConfig::default());
        gate.deploy(&[candidate("warm", 0.8, 1.0)]).unwrap();
        let s = gate.deploy(&[candidate("neutral", 0.8, 1.0)]).unwrap();
        assert_eq!(s.active_style.unwrap().as_str(), "warm");
    }

    #[test]
    fn switch_rejects_unknown_and_tampered() {
        let dir = tempfile::tempdir().unwrap();
        let gate = DeploymentGate::new(dir.path(), DeployConfig::default());
        gate.deploy(&[candidate("neutral", 0.8, 1.0), candidate("warm", 0.8, 2.0)])
            .unwrap();

        let mut switch = StyleSwitch::load(dir.path()).unwrap();
        assert!(matches!(switch.resolve(Some("angry")), Err(DistillError::UnknownStyle(_))));
        assert!(matches!(switch.set_active("angry"), Err(DistillError::UnknownStyle(_))));

        switch.set_active("warm").unwrap();
        let reloaded = StyleSwitch::load(dir.path()).unwrap();
        assert_eq!(reloaded.active_style().unwrap().as_str(), "warm");
        assert_eq!(reloaded.styles().len(), 2);

        let tampered = PublishedEmbedding {
            style: Style::new("warm").unwrap(),
            version: 1,
            tag: None,
            embedding: VoiceEmbedding::from_vec(vec![9.0, 9.0]).unwrap(),
        };
        std::fs::write(dir.path().join("warm.json"), serde_json::to_vec(&tampered).unwrap()).unwrap();
        assert!(matches!(reloaded.resolve(None), Err(DistillError::ChecksumMismatch { .. })));
    }
}

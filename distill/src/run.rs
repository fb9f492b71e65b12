//! The run aggregate: one invocation of the pipeline and what happened to
//! each style in it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deploy::write_atomic;
use crate::error::DistillResult;
use crate::evolver::{SearchPhase, SearchState};
use crate::selector::Selection;
use crate::style::Style;
use crate::validator::ValidationReport;

/// Run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    /// Finished a stage that stops short of deployment.
    Completed,
    Deployed,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Deployed => "deployed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Where a style ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StyleStatus {
    Pending,
    /// Reference synthesis failed; excluded from later stages.
    Degraded,
    /// Reference ready; nothing further requested.
    ReferenceReady,
    /// No starting point could be rendered, or the search failed.
    SearchFailed,
    Searched,
    Cancelled,
    Validated,
    Rejected,
    Deployed,
}

impl fmt::Display for StyleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Degraded => "degraded",
            Self::ReferenceReady => "reference_ready",
            Self::SearchFailed => "search_failed",
            Self::Searched => "searched",
            Self::Cancelled => "cancelled",
            Self::Validated => "validated",
            Self::Rejected => "rejected",
            Self::Deployed => "deployed",
        })
    }
}

/// Discarded work, counted per style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleCounters {
    pub reference_retries: u32,
    pub candidates_evaluated: usize,
    pub candidate_failures: usize,
    pub steps: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub render_failures: u64,
    pub validation_render_failures: usize,
}

/// Everything recorded for one style.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StyleOutcome {
    pub style: Style,
    pub status: StyleStatus,
    pub reference_path: Option<PathBuf>,
    pub reference_reused: bool,
    pub start_label: Option<String>,
    pub start_score: Option<f64>,
    pub phase: Option<SearchPhase>,
    pub final_score: Option<f64>,
    /// Full search state; kept in memory only.
    #[serde(skip)]
    pub search: Option<SearchState>,
    pub validation: Option<ValidationReport>,
    pub published_version: Option<u32>,
    pub counters: StyleCounters,
    pub error: Option<String>,
}

impl StyleOutcome {
    pub fn new(style: Style) -> Self {
        Self {
            style,
            status: StyleStatus::Pending,
            reference_path: None,
            reference_reused: false,
            start_label: None,
            start_score: None,
            phase: None,
            final_score: None,
            search: None,
            validation: None,
            published_version: None,
            counters: StyleCounters::default(),
            error: None,
        }
    }

    pub fn record_selection(&mut self, selection: &Selection) {
        self.start_label = Some(selection.label.clone());
        self.start_score = Some(selection.score);
        self.counters.candidates_evaluated = selection.ranking.len();
        self.counters.candidate_failures = selection.render_failures;
    }

    /// Stores the final search state and derives the style status.
    pub fn record_search(&mut self, state: SearchState) {
        self.counters.steps = state.step;
        self.counters.accepted = state.accepted;
        self.counters.rejected = state.rejected;
        self.counters.render_failures = state.render_failures;
        self.start_label.get_or_insert_with(|| state.start_label.clone());
        self.phase = Some(state.phase);
        self.final_score = Some(state.best_score);
        self.status = match state.phase {
            SearchPhase::Failed => StyleStatus::SearchFailed,
            SearchPhase::Cancelled => StyleStatus::Cancelled,
            _ => StyleStatus::Searched,
        };
        self.search = Some(state);
    }

    pub fn record_validation(&mut self, report: ValidationReport) {
        self.counters.validation_render_failures = report.render_failures;
        self.status = if report.pass {
            StyleStatus::Validated
        } else {
            StyleStatus::Rejected
        };
        self.validation = Some(report);
    }

    pub fn fail(&mut self, status: StyleStatus, error: impl fmt::Display) {
        self.status = status;
        self.error = Some(error.to_string());
    }

    /// Still eligible for later stages.
    pub fn is_viable(&self) -> bool {
        !matches!(
            self.status,
            StyleStatus::Degraded | StyleStatus::SearchFailed | StyleStatus::Cancelled
        )
    }
}

/// One pipeline invocation. Passed explicitly into each stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub status: RunStatus,
    pub styles: BTreeMap<Style, StyleOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Default for Run {
    fn default() -> Self {
        Self::new()
    }
}

impl Run {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::Created,
            styles: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
            error: None,
        }
    }

    /// Registers the styles and enters `Running`.
    pub fn start(&mut self, styles: impl IntoIterator<Item = Style>) {
        for s in styles {
            self.styles.insert(s.clone(), StyleOutcome::new(s));
        }
        self.status = RunStatus::Running;
        self.touch();
    }

    /// The outcome for `style`, created if missing.
    pub fn outcome_mut(&mut self, style: &Style) -> &mut StyleOutcome {
        self.updated_at = Utc::now();
        self.styles
            .entry(style.clone())
            .or_insert_with(|| StyleOutcome::new(style.clone()))
    }

    pub fn outcome(&self, style: &Style) -> Option<&StyleOutcome> {
        self.styles.get(style)
    }

    /// Styles still eligible for later stages, in order.
    pub fn viable_styles(&self) -> Vec<Style> {
        self.styles
            .values()
            .filter(|o| o.is_viable())
            .map(|o| o.style.clone())
            .collect()
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.touch();
        self.finished_at = Some(self.updated_at);
    }

    pub fn fail(&mut self, error: impl fmt::Display) {
        self.error = Some(error.to_string());
        self.finish(RunStatus::Failed);
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Writes `<dir>/<id>.json`.
    pub fn save(&self, dir: &Path) -> DistillResult<PathBuf> {
        let path = dir.join(format!("{}.json", self.id));
        write_atomic(&path, &serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id,
            status: self.status,
            error: self.error.clone(),
            styles: self
                .styles
                .values()
                .map(|o| StyleSummary {
                    style: o.style.clone(),
                    status: o.status,
                    start: o.start_label.clone(),
                    phase: o.phase,
                    score: o.final_score,
                    pass: o.validation.as_ref().map(|v| v.pass),
                    version: o.published_version,
                    counters: o.counters,
                    error: o.error.clone(),
                })
                .collect(),
        }
    }
}

/// One row of the run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StyleSummary {
    pub style: Style,
    pub status: StyleStatus,
    pub start: Option<String>,
    pub phase: Option<SearchPhase>,
    pub score: Option<f64>,
    pub pass: Option<bool>,
    pub version: Option<u32>,
    pub counters: StyleCounters,
    pub error: Option<String>,
}

/// Human-readable digest of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub status: RunStatus,
    pub error: Option<String>,
    pub styles: Vec<StyleSummary>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run {} {}", self.id, self.status)?;
        if let Some(e) = &self.error {
            writeln!(f, "  error: {e}")?;
        }
        writeln!(
            f,
            "  {:<14} {:<16} {:<18} {:>7} {:>6} {:>6} {:>6} {:>5} {:>5} {:>4} {:>3}",
            "STYLE", "STATUS", "PHASE", "SCORE", "STEPS", "ACC", "REJ", "FAIL", "VFAIL", "PASS", "VER"
        )?;
        for s in &self.styles {
            let dash = || "-".to_string();
            writeln!(
                f,
                "  {:<14} {:<16} {:<18} {:>7} {:>6} {:>6} {:>6} {:>5} {:>5} {:>4} {:>3}",
                s.style.as_str(),
                s.status.to_string(),
                s.phase.map_or_else(dash, |p| p.to_string()),
                s.score.map_or_else(dash, |v| format!("{v:.2}")),
                s.counters.steps,
                s.counters.accepted,
                s.counters.rejected,
                s.counters.render_failures,
                s.counters.validation_render_failures,
                s.pass.map_or_else(dash, |p| if p { "yes".into() } else { "no".into() }),
                s.version.map_or_else(dash, |v| v.to_string()),
            )?;
            if let Some(e) = &s.error {
                writeln!(f, "    {e}")?;
            }
        }
        Ok(())
    }
}

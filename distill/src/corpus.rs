//! Per-style sentence sets: probe text for search, held-out text for
//! validation, and the longer list the teacher reads for the reference.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DistillError, DistillResult};
use crate::style::Style;

/// One corpus sentence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentence {
    pub id: String,
    pub text: String,
}

impl Sentence {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Sentences for a single style.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StyleCorpus {
    /// Rendered for every candidate during selection and search.
    pub probe: Vec<Sentence>,
    /// Reserved for validation, never seen during search.
    pub held_out: Vec<Sentence>,
    /// Read by the teacher to build the reference. Falls back to `probe`.
    #[serde(default)]
    pub reference: Vec<Sentence>,
}

impl StyleCorpus {
    /// The sentences the teacher reads, in order.
    pub fn reference_sentences(&self) -> &[Sentence] {
        if self.reference.is_empty() {
            &self.probe
        } else {
            &self.reference
        }
    }

    /// Checks that probe and held-out sets are non-empty and disjoint by
    /// id and by text.
    pub fn validate(&self, style: &Style) -> DistillResult<()> {
        if self.probe.is_empty() || self.held_out.is_empty() {
            return Err(DistillError::EmptyCorpus(style.clone()));
        }
        let ids: HashSet<&str> = self.probe.iter().map(|s| s.id.as_str()).collect();
        let texts: HashSet<&str> = self.probe.iter().map(|s| s.text.trim()).collect();
        if let Some(dup) = self
            .held_out
            .iter()
            .find(|s| ids.contains(s.id.as_str()) || texts.contains(s.text.trim()))
        {
            return Err(DistillError::OverlappingCorpus {
                style: style.clone(),
                id: dup.id.clone(),
            });
        }
        Ok(())
    }
}

/// The corpus provider: every style's sentence sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Corpus {
    pub styles: BTreeMap<Style, StyleCorpus>,
}

impl Corpus {
    /// Loads a corpus from YAML or JSON (chosen by extension) and
    /// validates every style.
    pub fn load(path: impl AsRef<Path>) -> DistillResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let corpus: Corpus = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_slice(&data)?,
            _ => serde_yaml::from_slice(&data)?,
        };
        corpus.validate()?;
        Ok(corpus)
    }

    pub fn validate(&self) -> DistillResult<()> {
        for (style, sc) in &self.styles {
            sc.validate(style)?;
        }
        Ok(())
    }

    pub fn get(&self, style: &Style) -> Option<&StyleCorpus> {
        self.styles.get(style)
    }

    pub fn styles(&self) -> impl Iterator<Item = &Style> {
        self.styles.keys()
    }
}

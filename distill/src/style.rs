use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DistillError;

/// A labeled speaking manner (e.g. "neutral", "warm", "empathetic").
///
/// Labels double as file stems in the work and deploy directories, so
/// they are restricted to lowercase ASCII letters, digits, `-` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Style(String);

impl Style {
    pub fn new(label: impl Into<String>) -> Result<Self, DistillError> {
        let label = label.into();
        let valid = !label.is_empty()
            && label
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
        if !valid {
            return Err(DistillError::InvalidStyle(label));
        }
        Ok(Self(label))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Style {
    type Error = DistillError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Style> for String {
    fn from(style: Style) -> Self {
        style.0
    }
}

impl std::str::FromStr for Style {
    type Err = DistillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

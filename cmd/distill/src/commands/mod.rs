//! CLI commands module.

mod config;
mod manifest;
mod run;

use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use voxkit_distill::DistillConfig;

pub use config::ConfigCommand;
pub use manifest::ManifestCommand;
pub use run::RunCommand;

use crate::Cli;

/// Loads `--config`, else the default file, else built-in defaults.
pub(crate) fn load_config(cli: &Cli) -> anyhow::Result<DistillConfig> {
    DistillConfig::load_or_default(cli.config.as_deref()).context("load config")
}

/// Writes `value` as JSON (`--json`) or YAML to `--output` or stdout.
pub(crate) fn output_result<T: Serialize>(value: &T, output: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let text = if json {
        serde_json::to_string_pretty(value)? + "\n"
    } else {
        serde_yaml::to_string(value)?
    };
    match output {
        Some(path) => {
            std::fs::write(path, text).with_context(|| format!("write {}", path.display()))?;
            print_success(&format!("Written to {}", path.display()));
        }
        None => print!("{text}"),
    }
    Ok(())
}

pub(crate) fn print_success(msg: &str) {
    eprintln!("[ok] {msg}");
}

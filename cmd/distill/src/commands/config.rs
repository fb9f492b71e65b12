//! Configuration commands.

use anyhow::{Context, bail};
use clap::{Args, Subcommand};
use voxkit_distill::DistillConfig;

use super::{load_config, output_result, print_success};
use crate::Cli;

/// Show or initialize configuration.
#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    command: ConfigSubcommand,
}

#[derive(Subcommand)]
enum ConfigSubcommand {
    /// Print the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl ConfigCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        match &self.command {
            ConfigSubcommand::Show => {
                let cfg = load_config(cli)?;
                output_result(&cfg, cli.output.as_deref(), cli.json)
            }
            ConfigSubcommand::Init { force } => {
                let path = match &cli.config {
                    Some(p) => p.clone(),
                    None => DistillConfig::default_path().context("no home directory")?,
                };
                if path.exists() && !force {
                    bail!("{} already exists (use --force to overwrite)", path.display());
                }
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, DistillConfig::default().to_yaml()?)
                    .with_context(|| format!("write {}", path.display()))?;
                print_success(&format!("Config written to {}", path.display()));
                Ok(())
            }
        }
    }
}

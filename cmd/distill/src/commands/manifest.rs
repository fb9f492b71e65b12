//! Deployed-embedding commands.

use std::path::PathBuf;

use clap::{Args, Subcommand};
use voxkit_distill::StyleSwitch;

use super::{load_config, output_result, print_success};
use crate::Cli;

/// Inspect and switch deployed embeddings.
#[derive(Args)]
pub struct ManifestCommand {
    /// Deploy directory (default: from config)
    #[arg(long, global = true)]
    deploy_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: ManifestSubcommand,
}

#[derive(Subcommand)]
enum ManifestSubcommand {
    /// Print the manifest
    Show,
    /// Print the latest embedding for a style (default: the active style)
    Resolve {
        #[arg(long)]
        style: Option<String>,
    },
    /// Make a published style the active one
    #[command(name = "set-active")]
    SetActive {
        style: String,
    },
}

impl ManifestCommand {
    pub fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let dir = match &self.deploy_dir {
            Some(d) => d.clone(),
            None => load_config(cli)?.deploy_dir(),
        };
        let mut switch = StyleSwitch::load(dir)?;

        match &self.command {
            ManifestSubcommand::Show => output_result(switch.manifest(), cli.output.as_deref(), cli.json),
            ManifestSubcommand::Resolve { style } => {
                let published = switch.resolve(style.as_deref())?;
                output_result(&published, cli.output.as_deref(), true)
            }
            ManifestSubcommand::SetActive { style } => {
                switch.set_active(style)?;
                print_success(&format!("Active style: {style}"));
                Ok(())
            }
        }
    }
}

//! voicedistill - distill teacher TTS voices into student voice embeddings.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{ConfigCommand, ManifestCommand, RunCommand};

/// voicedistill - distill teacher TTS voices into student voice embeddings.
///
/// A run synthesizes a reference per style with the teacher, picks a
/// starting embedding, hill-climbs it against the student engine,
/// validates every style together and publishes the ones that pass.
///
/// Configuration is read from ~/.voxkit/voicedistill/config.yaml unless
/// --config is given.
#[derive(Parser)]
#[command(name = "voicedistill")]
#[command(about = "Voice distillation tool")]
#[command(version)]
pub struct Cli {
    /// Config file (default is ~/.voxkit/voicedistill/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<std::path::PathBuf>,

    /// Output file (default: stdout)
    #[arg(short = 'o', long, global = true)]
    pub output: Option<std::path::PathBuf>,

    /// Output as JSON (for piping)
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run distillation stages
    Run(RunCommand),
    /// Inspect and switch deployed embeddings
    Manifest(ManifestCommand),
    /// Show or initialize configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v.
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Run(cmd) => cmd.run(&cli).await,
        Commands::Manifest(cmd) => cmd.run(&cli),
        Commands::Config(cmd) => cmd.run(&cli),
    }
}

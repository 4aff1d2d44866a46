mod cmd;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{BuildArgs, SandboxKind};
use output::OutputFormat;

/// bramble - hermetic, content-addressed builds
#[derive(Parser)]
#[command(name = "bramble")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output and stream builder logs to the terminal
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build the derivations in a JSON file
  Build {
    /// File holding a derivation or a list of derivations
    file: PathBuf,

    /// Rebuild even if outputs are already in the store
    #[arg(short, long)]
    force: bool,

    /// Build twice and fail if the outputs differ
    #[arg(long)]
    check: bool,

    /// Open a shell in the build environment instead of running the builder
    #[arg(long)]
    shell: bool,

    /// Maximum number of concurrent builds
    #[arg(short = 'j', long)]
    parallelism: Option<usize>,

    /// Isolation used for builders
    #[arg(long, value_enum, default_value_t = SandboxKind::Auto)]
    sandbox: SandboxKind,

    /// Cancel the build after this long (e.g. "10m", "1h 30m")
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,
  },

  /// Print the canonical form, hash and filename of derivations
  Show {
    /// File holding a derivation or a list of derivations
    file: PathBuf,
  },

  /// Upload built derivations and their outputs to a cache
  Push {
    /// Cache URL (http://...) or directory
    cache: String,

    /// File holding the derivations to upload
    file: PathBuf,

    /// Maximum number of concurrent uploads
    #[arg(short, long)]
    workers: Option<usize>,
  },

  /// Download derivations and their outputs from a cache
  Pull {
    /// Cache URL (http://...) or directory
    cache: String,

    /// Derivation filenames to fetch
    #[arg(required = true)]
    filenames: Vec<String>,
  },

  /// Serve the local store as a cache over HTTP
  Serve {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:2726")]
    listen: String,
  },

  /// Print the bramble root and store paths
  StorePath,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(format!("warn,bramble_lib={default_level},bramble={default_level}")));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Build {
      file,
      force,
      check,
      shell,
      parallelism,
      sandbox,
      timeout,
    } => {
      let args = BuildArgs {
        force,
        check,
        shell,
        parallelism,
        sandbox,
        timeout,
      };
      cmd::cmd_build(&file, args, cli.verbose, cli.output)
    }
    Commands::Show { file } => cmd::cmd_show(&file, cli.output),
    Commands::Push { cache, file, workers } => cmd::cmd_push(&cache, &file, workers, cli.output),
    Commands::Pull { cache, filenames } => cmd::cmd_pull(&cache, &filenames, cli.output),
    Commands::Serve { listen } => cmd::cmd_serve(&listen),
    Commands::StorePath => cmd::cmd_store_path(cli.output),
  }
}

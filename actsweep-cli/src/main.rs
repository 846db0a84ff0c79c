//! actsweep CLI: run, resume and inspect activation-function training studies.

mod commands;

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Resumable experiment runner for small activation-function studies
#[derive(Parser, Debug)]
#[command(name = "actsweep", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only report errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train one configured run, optionally resuming it
    Run {
        #[command(flatten)]
        source: ConfigArgs,

        /// Resume from the run's own final (else mid) checkpoint
        #[arg(long, conflicts_with = "resume_from")]
        resume: bool,

        /// Resume from an explicit checkpoint file
        #[arg(long)]
        resume_from: Option<PathBuf>,

        /// Stop after this many epochs in this process
        #[arg(long)]
        stop_after: Option<u32>,
    },
    /// Print the resolved configuration as TOML
    Config {
        #[command(flatten)]
        source: ConfigArgs,
    },
    /// Resolve a hyperparameter record and print it as JSON
    Hyperparams {
        /// Grid preset id
        #[arg(long, group = "select")]
        grid: Option<u32>,

        /// Per-activation preset
        #[arg(long, group = "select")]
        activation: Option<String>,

        /// Draw from the default search space
        #[arg(long, group = "select", requires = "seed")]
        sample: bool,

        /// Seed for --sample
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Show the metadata and progress stored in a checkpoint
    Inspect {
        checkpoint: PathBuf,
    },
}

/// Where the configuration comes from.
#[derive(clap::Args, Debug)]
struct ConfigArgs {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the base seed
    #[arg(long)]
    seed: Option<u64>,

    /// Override the epoch budget
    #[arg(long)]
    epochs: Option<u32>,
}

/// Install the stderr layer and, with `log_dir`, a JSON file layer.
fn init_logging(verbose: u8, quiet: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // Human-readable layer for stderr (always active)
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let (json_layer, guard) = match log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let file_appender = tracing_appender::rolling::daily(dir, "actsweep.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    guard
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    commands::handle_command(cli.command, cli.verbose, cli.quiet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_resume_flags_conflict() {
        assert!(Cli::try_parse_from(["actsweep", "run", "--resume", "--resume-from", "x.ckpt"]).is_err());
        let cli = Cli::try_parse_from(["actsweep", "-v", "run", "--seed", "3", "--stop-after", "2"]).unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Run {
                source, stop_after, ..
            } => {
                assert_eq!(source.seed, Some(3));
                assert_eq!(stop_after, Some(2));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_sample_requires_seed() {
        assert!(Cli::try_parse_from(["actsweep", "hyperparams", "--sample"]).is_err());
        assert!(Cli::try_parse_from(["actsweep", "hyperparams", "--grid", "1", "--activation", "max"]).is_err());
    }
}

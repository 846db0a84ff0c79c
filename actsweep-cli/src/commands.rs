//! CLI subcommand handlers.

use crate::{Commands, ConfigArgs, init_logging};
use actsweep_core::{
    CheckpointStore, ConfigOverrides, ExperimentConfig, HyperparamKey, HyperparamTable, Resolver,
    SearchSpace, SeedManager, SelectionMode, load_config,
};
use actsweep_ml::{ResumePolicy, default_device, prepare};
use anyhow::Context;
use std::path::{Path, PathBuf};

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands, verbose: u8, quiet: bool) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            source,
            resume,
            resume_from,
            stop_after,
        } => {
            let config = resolve_config(&source)?;
            let _guard = init_logging(verbose, quiet, Some(&config.output.dir.join("logs")));
            let policy = match (resume, resume_from) {
                (_, Some(path)) => ResumePolicy::From(path),
                (true, None) => ResumePolicy::Latest,
                (false, None) => ResumePolicy::Fresh,
            };
            handle_run(&config, &policy, stop_after)
        }
        Commands::Config { source } => {
            let _guard = init_logging(verbose, quiet, None);
            let config = resolve_config(&source)?;
            let toml_str = toml::to_string_pretty(&config).context("Failed to render config")?;
            println!("{toml_str}");
            Ok(())
        }
        Commands::Hyperparams {
            grid,
            activation,
            sample,
            seed,
        } => {
            let _guard = init_logging(verbose, quiet, None);
            let mode = selection(grid, activation, sample)?;
            handle_hyperparams(&mode, seed.unwrap_or(0))
        }
        Commands::Inspect { checkpoint } => {
            let _guard = init_logging(verbose, quiet, None);
            handle_inspect(&checkpoint)
        }
    }
}

fn resolve_config(source: &ConfigArgs) -> anyhow::Result<ExperimentConfig> {
    let overrides = ConfigOverrides {
        seed: source.seed,
        epochs: source.epochs,
    };
    load_config(source.config.as_deref(), &overrides).context("Failed to load configuration")
}

fn handle_run(
    config: &ExperimentConfig,
    policy: &ResumePolicy,
    stop_after: Option<u32>,
) -> anyhow::Result<()> {
    let table = HyperparamTable::builtin()?;
    let device = default_device()?;
    let run = prepare(config, &table, policy, &device, stop_after)?;
    let log_path: PathBuf = run.log_path.clone();
    let records = run.execute()?;

    match records.last() {
        Some(last) => println!(
            "{} epoch(s) run, last epoch {}: val_acc {:.4}, val_loss {:.4}",
            records.len(),
            last.epoch,
            last.val_acc,
            last.val_loss
        ),
        None => println!("Nothing to do: the run already reached its epoch budget."),
    }
    println!("Log: {}", log_path.display());
    Ok(())
}

/// The selection mode named by the `hyperparams` flags.
fn selection(
    grid: Option<u32>,
    activation: Option<String>,
    sample: bool,
) -> anyhow::Result<SelectionMode> {
    match (grid, activation, sample) {
        (Some(id), None, false) => Ok(SelectionMode::Fixed {
            key: HyperparamKey::Grid(id),
        }),
        (None, Some(name), false) => Ok(SelectionMode::Fixed {
            key: HyperparamKey::Activation(name),
        }),
        (None, None, true) => Ok(SelectionMode::Sampled),
        _ => anyhow::bail!("Choose exactly one of --grid, --activation or --sample"),
    }
}

fn handle_hyperparams(mode: &SelectionMode, seed: u64) -> anyhow::Result<()> {
    let table = HyperparamTable::builtin()?;
    let mut rng = SeedManager::new(seed).component_rng("hyperparams");
    let record = Resolver::new(&table, SearchSpace::default()).resolve(mode, &mut rng)?;
    let out = serde_json::json!({
        "key": mode.label(),
        "hyperparams": record,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn handle_inspect(path: &Path) -> anyhow::Result<()> {
    let (state, metadata) = CheckpointStore::default()
        .load(path)
        .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
    let out = serde_json::json!({
        "metadata": metadata,
        "next_epoch": state.epoch,
        "best_val_acc": state.best_val_acc,
        "tensors": state.model.len(),
        "optimizer": {
            "kind": state.optimizer.kind,
            "step": state.optimizer.step,
            "learning_rate": state.optimizer.learning_rate,
        },
        "scheduler": state.scheduler,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_selection_flags() {
        assert_eq!(
            selection(Some(4), None, false).unwrap(),
            SelectionMode::Fixed {
                key: HyperparamKey::Grid(4)
            }
        );
        assert_eq!(
            selection(None, Some("max".into()), false).unwrap(),
            SelectionMode::Fixed {
                key: HyperparamKey::Activation("max".into())
            }
        );
        assert_eq!(selection(None, None, true).unwrap(), SelectionMode::Sampled);
        assert!(selection(None, None, false).is_err());
        assert!(selection(Some(1), None, true).is_err());
    }

    #[test]
    fn test_unknown_grid_key_is_reported() {
        let mode = selection(Some(21), None, false).unwrap();
        let err = handle_hyperparams(&mode, 0).unwrap_err();
        assert!(err.to_string().contains("21"));
    }
}

//! Experiment configuration.
//!
//! Layered with figment: built-in defaults, then the user config file,
//! then an explicit config file, then `ACTSWEEP_` environment variables
//! (`__` separates nested keys), then command-line overrides.

use crate::arch::{ActivationKind, Architecture, DatasetKind, StructuralParams};
use crate::checkpoint::CheckpointSet;
use crate::error::{LabError, Result};
use crate::hyperparams::{HyperparamKey, SearchSpace, SelectionMode};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration of one training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub seed: u64,
    pub dataset: String,
    pub data_dir: PathBuf,
    /// Training examples drawn from the non-validation part; all when unset.
    pub sample_size: Option<usize>,
    pub validation_size: usize,
    pub batch_size: usize,
    pub epochs: u32,
    pub model: ModelConfig,
    pub hyperparams: HyperparamConfig,
    pub optimizer: OptimizerConfig,
    pub schedule: ScheduleConfig,
    pub output: OutputConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            dataset: "mnist".into(),
            data_dir: PathBuf::from("data"),
            sample_size: None,
            validation_size: 10_000,
            batch_size: 100,
            epochs: 10,
            model: ModelConfig::default(),
            hyperparams: HyperparamConfig::default(),
            optimizer: OptimizerConfig::default(),
            schedule: ScheduleConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub architecture: Architecture,
    pub activation: ActivationKind,
    pub structure: StructuralParams,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architecture: Architecture::Mlp,
            activation: ActivationKind::Combinact,
            structure: StructuralParams::default(),
        }
    }
}

/// Whether hyperparameters come from the preset table or the search space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HyperparamMode {
    #[default]
    Fixed,
    Sampled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperparamConfig {
    pub mode: HyperparamMode,
    /// Preset key; defaults to the activation's own preset.
    pub key: Option<HyperparamKey>,
    pub space: SearchSpace,
}

impl Default for HyperparamConfig {
    fn default() -> Self {
        Self {
            mode: HyperparamMode::Fixed,
            key: None,
            space: SearchSpace::default(),
        }
    }
}

impl HyperparamConfig {
    /// The selection mode for a run using `activation`.
    pub fn selection(&self, activation: ActivationKind) -> SelectionMode {
        match self.mode {
            HyperparamMode::Sampled => SelectionMode::Sampled,
            HyperparamMode::Fixed => SelectionMode::Fixed {
                key: self
                    .key
                    .clone()
                    .unwrap_or_else(|| HyperparamKey::Activation(activation.as_str().into())),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Adam,
    #[serde(alias = "rms_prop")]
    Rmsprop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    #[default]
    Cyclic,
    Exponential,
}

/// When a learning-rate schedule advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepGranularity {
    PerEpoch,
    PerBatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub kind: ScheduleKind,
    /// Decay factor of the exponential schedule.
    pub gamma: f64,
    /// Floor of the cyclic schedule.
    pub base_lr: f64,
    /// Overrides the kind's natural granularity.
    pub granularity: Option<StepGranularity>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            kind: ScheduleKind::Cyclic,
            gamma: 0.95,
            base_lr: 1e-8,
            granularity: None,
        }
    }
}

impl ScheduleConfig {
    pub fn effective_granularity(&self) -> StepGranularity {
        self.granularity.unwrap_or(match self.kind {
            ScheduleKind::Cyclic => StepGranularity::PerBatch,
            ScheduleKind::Exponential => StepGranularity::PerEpoch,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    /// Stem of the log and checkpoint file names; derived when unset.
    pub run_name: Option<String>,
    /// Replace an existing log when starting (not resuming) a run.
    pub overwrite_log: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("runs"),
            run_name: None,
            overwrite_log: false,
        }
    }
}

/// Values supplied on the command line; unset fields leave the lower
/// layers alone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epochs: Option<u32>,
}

impl ExperimentConfig {
    pub fn dataset_kind(&self) -> Result<DatasetKind> {
        DatasetKind::from_name(&self.dataset)
    }

    /// File stem shared by the log and the checkpoints.
    pub fn run_name(&self) -> String {
        if let Some(name) = &self.output.run_name {
            return name.clone();
        }
        let s = &self.model.structure;
        format!(
            "{}-{}-k{}p{}g{}-s{}-{}",
            self.model.architecture,
            self.model.activation,
            s.k,
            s.p,
            s.g,
            self.seed,
            self.dataset
        )
    }

    pub fn log_path(&self) -> PathBuf {
        self.output.dir.join(format!("{}.csv", self.run_name()))
    }

    pub fn checkpoints(&self) -> CheckpointSet {
        CheckpointSet::in_dir(&self.output.dir, &self.run_name())
    }

    /// Structural parameters after adjusting them to the activation.
    pub fn structure(&self) -> StructuralParams {
        self.model
            .structure
            .clone()
            .normalized_for(self.model.architecture, self.model.activation)
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        self.dataset_kind()?;
        if self.epochs == 0 {
            return Err(LabError::config("epochs must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(LabError::config("batch_size must be at least 1"));
        }
        if self.validation_size == 0 {
            return Err(LabError::config("validation_size must be at least 1"));
        }
        if self.sample_size == Some(0) {
            return Err(LabError::config("sample_size must be at least 1 when set"));
        }
        if self.schedule.gamma <= 0.0 || self.schedule.base_lr <= 0.0 {
            return Err(LabError::config(
                "schedule gamma and base_lr must be positive",
            ));
        }
        if let HyperparamMode::Sampled = self.hyperparams.mode {
            self.hyperparams.space.validate()?;
        }

        let run_name = self.run_name();
        if run_name.is_empty() || run_name.contains(['/', '\\']) {
            return Err(LabError::config(format!(
                "run name {run_name:?} must be a non-empty file stem"
            )));
        }
        let log = self.log_path();
        let checkpoints = self.checkpoints();
        let mut paths: Vec<&Path> = checkpoints.paths().to_vec();
        paths.push(&log);
        for (i, a) in paths.iter().enumerate() {
            if paths[i + 1..].contains(a) {
                return Err(LabError::config(format!(
                    "output path {} is used twice",
                    a.display()
                )));
            }
        }
        Ok(())
    }
}

/// Load the configuration, merging every layer over the defaults.
pub fn load_config(
    explicit: Option<&Path>,
    overrides: &ConfigOverrides,
) -> Result<ExperimentConfig> {
    let mut figment = Figment::from(Serialized::defaults(ExperimentConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "actsweep", "actsweep") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(LabError::NotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    // ACTSWEEP_EPOCHS, ACTSWEEP_MODEL__ACTIVATION, ACTSWEEP_MODEL__STRUCTURE__K, ...
    figment = figment.merge(Env::prefixed("ACTSWEEP_").split("__"));

    figment = figment.merge(Serialized::defaults(overrides));

    let config: ExperimentConfig = figment
        .extract()
        .map_err(|e| LabError::config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

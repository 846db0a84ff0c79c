//! Wires a resolved configuration into a ready-to-run training session.

use crate::callbacks::{DivergenceGuard, StopAfter};
use crate::data::{self, BatchSource, InMemorySource, SplitSpec};
use crate::error::Result;
use crate::model;
use crate::optim;
use crate::schedule;
use crate::session::TrainingSession;
use actsweep_core::{
    ExperimentConfig, HyperparamTable, LabError, MetricsLogger, Resolver, RunMetadata,
    SeedManager,
};
use candle_core::Device;
use std::path::PathBuf;

/// Where a run starts from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResumePolicy {
    /// Start at epoch 1, ignoring existing checkpoints.
    #[default]
    Fresh,
    /// Continue from the run's own final checkpoint, else its mid one.
    /// Starts fresh when neither exists.
    Latest,
    /// Continue from an explicit checkpoint file.
    From(PathBuf),
}

/// Everything needed to call [`TrainingSession::run`].
pub struct PreparedRun {
    pub session: TrainingSession,
    pub train: InMemorySource,
    pub val: InMemorySource,
    pub resume_from: Option<PathBuf>,
    pub log_path: PathBuf,
}

impl PreparedRun {
    /// Execute the session over the prepared sources.
    pub fn execute(mut self) -> Result<Vec<actsweep_core::EpochRecord>> {
        let resume = self.resume_from.as_deref();
        self.session.run(&self.train, &self.val, resume)
    }
}

/// The device runs are placed on.
pub fn default_device() -> Result<Device> {
    #[cfg(feature = "cuda")]
    let device = Device::cuda_if_available(0)?;
    #[cfg(not(feature = "cuda"))]
    let device = Device::Cpu;
    Ok(device)
}

/// Resolve hyperparameters, load data, build the model and its optimizer
/// and schedule, and attach the metrics log.
///
/// `stop_after` caps the epochs executed by this process; the run can be
/// resumed later with [`ResumePolicy::Latest`].
pub fn prepare(
    config: &ExperimentConfig,
    table: &HyperparamTable,
    resume: &ResumePolicy,
    device: &Device,
    stop_after: Option<u32>,
) -> Result<PreparedRun> {
    config.validate()?;
    let dataset = config.dataset_kind()?;
    let seeds = SeedManager::new(config.seed);

    let selection = config.hyperparams.selection(config.model.activation);
    let hp = Resolver::new(table, config.hyperparams.space)
        .resolve(&selection, &mut seeds.component_rng("hyperparams"))?;

    let structure = config.structure();
    let split = SplitSpec {
        seed: config.seed,
        sample_size: config.sample_size,
        validation_size: config.validation_size,
        batch_size: config.batch_size,
    };
    let (train, val) = data::load_splits(dataset, &config.data_dir, &split, device)?;

    let model = model::build(
        config.model.architecture,
        config.model.activation,
        dataset.shape(),
        &structure,
        &mut seeds.component_rng("init"),
        device,
    )?;
    let optimizer = optim::build(config.optimizer.kind, model.parameter_groups(), &hp)?;
    let scheduler = schedule::build(&config.schedule, &hp, config.epochs, train.len());

    let metadata = RunMetadata {
        run_id: RunMetadata::new_run_id(),
        created_at: chrono::Utc::now(),
        seed: config.seed,
        dataset,
        architecture: config.model.architecture,
        activation: config.model.activation,
        structure,
        sample_size: train.num_examples(),
        batch_size: config.batch_size,
        epochs: config.epochs,
        num_params: model.num_parameters(),
        hyperparams: hp,
    };

    let checkpoints = config.checkpoints();
    let resume_from = match resume {
        ResumePolicy::Fresh => None,
        ResumePolicy::Latest => checkpoints.resume_candidate().map(PathBuf::from),
        ResumePolicy::From(path) => {
            if !path.exists() {
                return Err(LabError::NotFound { path: path.clone() }.into());
            }
            Some(path.clone())
        }
    };

    let log_path = config.log_path();
    let logger = if resume_from.is_some() {
        MetricsLogger::open_append(&log_path)?
    } else {
        MetricsLogger::create(&log_path, config.output.overwrite_log)?
    };

    tracing::info!(
        run = %config.run_name(),
        hp_key = %selection.label(),
        resume = ?resume_from,
        train_batches = train.len(),
        "Run prepared"
    );

    let mut session = TrainingSession::new(
        model,
        optimizer,
        scheduler,
        metadata,
        selection.label(),
        config.epochs,
        checkpoints,
    );
    session.add_observer(Box::new(logger));
    session.add_observer(Box::new(DivergenceGuard));
    if let Some(n) = stop_after {
        session.add_observer(Box::new(StopAfter::new(n)));
    }

    Ok(PreparedRun {
        session,
        train,
        val,
        resume_from,
        log_path,
    })
}

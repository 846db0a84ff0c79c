//! Training-session lifecycle controller.
//!
//! One epoch runs as: write the `mid` checkpoint, seed the epoch generator
//! from `(seed, epoch)`, train over every batch, evaluate on the training
//! and validation sources, hand the record to the observers, advance the
//! epoch counter (and per-epoch schedules), then write `best` on strict
//! improvement and `final` always. Resuming from either checkpoint replays
//! the same trajectory as an uninterrupted run.

use crate::callbacks::{CallbackAction, EpochObserver};
use crate::data::BatchSource;
use crate::error::Result;
use crate::model::{Mode, TrainableModel};
use crate::optim::Optimizer;
use crate::schedule::LrScheduler;
use actsweep_core::{
    CheckpointSet, CheckpointStore, EpochRecord, LabError, RunMetadata, RunState, SeedManager,
    SessionRng, StepGranularity,
};
use candle_core::DType;
use std::path::Path;
use std::time::Instant;

/// Where the run stands between epochs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunProgress {
    /// The next epoch to execute.
    pub epoch: u32,
    pub best_val_acc: f64,
}

impl Default for RunProgress {
    fn default() -> Self {
        Self {
            epoch: 1,
            best_val_acc: 0.0,
        }
    }
}

/// Drives one run from its first (or resumed) epoch to the epoch budget.
pub struct TrainingSession {
    model: Box<dyn TrainableModel>,
    optimizer: Box<dyn Optimizer>,
    scheduler: Box<dyn LrScheduler>,
    metadata: RunMetadata,
    hp_key: String,
    epochs: u32,
    checkpoints: CheckpointSet,
    store: CheckpointStore,
    seeds: SeedManager,
    observers: Vec<Box<dyn EpochObserver>>,
    progress: RunProgress,
}

impl TrainingSession {
    pub fn new(
        model: Box<dyn TrainableModel>,
        optimizer: Box<dyn Optimizer>,
        scheduler: Box<dyn LrScheduler>,
        metadata: RunMetadata,
        hp_key: impl Into<String>,
        epochs: u32,
        checkpoints: CheckpointSet,
    ) -> Self {
        let seeds = SeedManager::new(metadata.seed);
        Self {
            model,
            optimizer,
            scheduler,
            metadata,
            hp_key: hp_key.into(),
            epochs,
            checkpoints,
            store: CheckpointStore::default(),
            seeds,
            observers: Vec::new(),
            progress: RunProgress::default(),
        }
    }

    pub fn with_store(mut self, store: CheckpointStore) -> Self {
        self.store = store;
        self
    }

    pub fn add_observer(&mut self, observer: Box<dyn EpochObserver>) {
        self.observers.push(observer);
    }

    pub fn progress(&self) -> RunProgress {
        self.progress
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn model(&self) -> &dyn TrainableModel {
        self.model.as_ref()
    }

    pub fn checkpoints(&self) -> &CheckpointSet {
        &self.checkpoints
    }

    /// Run until the epoch budget is spent or an observer asks to stop.
    ///
    /// Returns the records of the epochs executed by this call.
    pub fn run(
        &mut self,
        train: &dyn BatchSource,
        val: &dyn BatchSource,
        resume_from: Option<&Path>,
    ) -> Result<Vec<EpochRecord>> {
        if train.is_empty() {
            return Err(LabError::empty_dataset("train").into());
        }
        if val.is_empty() {
            return Err(LabError::empty_dataset("validation").into());
        }
        self.init(resume_from)?;

        let mut records = Vec::new();
        while self.progress.epoch <= self.epochs {
            let (record, stop) = self.run_epoch(train, val)?;
            records.push(record);
            if stop {
                tracing::info!(
                    next_epoch = self.progress.epoch,
                    budget = self.epochs,
                    "Stopping early at observer request"
                );
                break;
            }
        }
        if self.progress.epoch > self.epochs {
            tracing::info!(
                epochs = self.epochs,
                best_val_acc = self.progress.best_val_acc,
                "Run complete"
            );
        }
        Ok(records)
    }

    fn init(&mut self, resume_from: Option<&Path>) -> Result<()> {
        match resume_from {
            Some(path) => {
                let (state, stored) = self.store.load(path)?;
                if let Some(reason) = stored.mismatch(&self.metadata) {
                    return Err(LabError::CheckpointMismatch {
                        path: path.to_path_buf(),
                        reason,
                    }
                    .into());
                }
                self.model.load_state_dict(&state.model)?;
                self.optimizer.load_state(&state.optimizer)?;
                self.scheduler.load_state(&state.scheduler)?;
                self.metadata.run_id = stored.run_id;
                self.metadata.created_at = stored.created_at;
                self.progress = RunProgress {
                    epoch: state.epoch,
                    best_val_acc: state.best_val_acc,
                };
                tracing::info!(
                    path = %path.display(),
                    epoch = state.epoch,
                    best_val_acc = state.best_val_acc,
                    "Resumed from checkpoint"
                );
            }
            None => {
                self.progress = RunProgress::default();
                tracing::info!(run_id = %self.metadata.run_id, "Starting fresh run");
            }
        }
        self.optimizer
            .set_learning_rate(self.scheduler.learning_rate());
        Ok(())
    }

    fn run_epoch(
        &mut self,
        train: &dyn BatchSource,
        val: &dyn BatchSource,
    ) -> Result<(EpochRecord, bool)> {
        let epoch = self.progress.epoch;
        let started = Instant::now();
        self.store
            .save(&self.checkpoints.mid, &self.snapshot()?, &self.metadata)?;

        let mut rng = self.seeds.epoch_rng(self.epochs, epoch);
        tracing::info!(
            epoch,
            budget = self.epochs,
            lr = self.optimizer.learning_rate(),
            "Epoch started"
        );
        self.train_pass(train, &mut rng)?;
        let lr = self.optimizer.learning_rate();

        let (train_loss, train_acc) = self.evaluate(train, "train")?;
        let (val_loss, val_acc) = self.evaluate(val, "validation")?;
        let record = self.record(
            epoch,
            started.elapsed().as_secs_f64(),
            [train_loss, val_loss, train_acc, val_acc],
            lr,
        )?;
        tracing::info!(
            epoch,
            train_loss,
            val_loss,
            train_acc,
            val_acc,
            secs = record.time_secs,
            "Epoch finished"
        );

        let mut stop = false;
        for observer in &mut self.observers {
            if observer.on_epoch_end(&record)? == CallbackAction::Stop {
                stop = true;
            }
        }

        self.progress.epoch += 1;
        if self.scheduler.granularity() == StepGranularity::PerEpoch {
            self.scheduler.step();
            self.optimizer
                .set_learning_rate(self.scheduler.learning_rate());
        }

        let improved = val_acc > self.progress.best_val_acc;
        if improved {
            self.progress.best_val_acc = val_acc;
        }
        let state = self.snapshot()?;
        let best = if improved {
            tracing::info!(epoch, val_acc, "New best validation accuracy");
            self.store
                .save(&self.checkpoints.best, &state, &self.metadata)
        } else {
            Ok(())
        };
        let last = self
            .store
            .save(&self.checkpoints.last, &state, &self.metadata);
        if let Err(e) = &best {
            tracing::error!(error = %e, "Failed to write best checkpoint");
        }
        if let Err(e) = &last {
            tracing::error!(error = %e, "Failed to write final checkpoint");
        }
        best?;
        last?;
        Ok((record, stop))
    }

    fn train_pass(&mut self, source: &dyn BatchSource, rng: &mut SessionRng) -> Result<()> {
        self.model.set_mode(Mode::Train);
        let per_batch = self.scheduler.granularity() == StepGranularity::PerBatch;
        let mut batches = 0usize;
        for batch in source.batches(Some(rng))? {
            let batch = batch?;
            self.optimizer.zero_gradients();
            let logits = self.model.forward(&batch.inputs)?;
            let loss = candle_nn::loss::cross_entropy(&logits, &batch.labels)?;
            self.optimizer.backward(&loss)?;
            self.optimizer.step()?;
            if per_batch {
                self.scheduler.step();
                self.optimizer
                    .set_learning_rate(self.scheduler.learning_rate());
            }
            batches += 1;
        }
        if batches == 0 {
            return Err(LabError::empty_dataset("train").into());
        }
        tracing::debug!(batches, "Training pass done");
        Ok(())
    }

    /// Per-example mean loss and accuracy over one full pass.
    fn evaluate(&mut self, source: &dyn BatchSource, split: &str) -> Result<(f64, f64)> {
        self.model.set_mode(Mode::Eval);
        let mut loss_sum = 0f64;
        let mut correct = 0f64;
        let mut total = 0usize;
        for batch in source.batches(None)? {
            let batch = batch?;
            let n = batch.labels.dim(0)?;
            let logits = self.model.forward(&batch.inputs)?.detach();
            let loss = candle_nn::loss::cross_entropy(&logits, &batch.labels)?;
            loss_sum += f64::from(loss.to_scalar::<f32>()?) * n as f64;
            let hits = logits
                .argmax(1)?
                .eq(&batch.labels)?
                .to_dtype(DType::F32)?
                .sum_all()?
                .to_scalar::<f32>()?;
            correct += f64::from(hits);
            total += n;
        }
        if total == 0 {
            return Err(LabError::empty_dataset(split).into());
        }
        Ok((loss_sum / total as f64, correct / total as f64))
    }

    fn record(
        &self,
        epoch: u32,
        time_secs: f64,
        [train_loss, val_loss, train_acc, val_acc]: [f64; 4],
        lr: f64,
    ) -> Result<EpochRecord> {
        let md = &self.metadata;
        let s = &md.structure;
        Ok(EpochRecord {
            dataset: md.dataset,
            seed: md.seed,
            epoch,
            time_secs,
            model: md.architecture,
            activation: md.activation,
            sample_size: md.sample_size,
            batch_size: md.batch_size,
            num_params: md.num_params,
            k: s.k,
            p: s.p,
            g: s.g,
            permutation: s.permutation,
            resnet_version: s.resnet_version,
            resnet_width: s.resnet_width,
            hp_key: self.hp_key.clone(),
            hyperparams: md.hyperparams,
            train_loss,
            val_loss,
            train_acc,
            val_acc,
            gen_gap: val_loss - train_loss,
            lr,
            mixing_weights: self.model.mixing_weights()?,
        })
    }

    fn snapshot(&self) -> Result<RunState> {
        Ok(RunState {
            epoch: self.progress.epoch,
            best_val_acc: self.progress.best_val_acc,
            model: self.model.state_dict()?,
            optimizer: self.optimizer.state()?,
            scheduler: self.scheduler.state(),
        })
    }
}

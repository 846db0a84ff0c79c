//! # actsweep-core
//!
//! Backend-agnostic foundation of the actsweep experiment runner:
//! hyperparameter resolution, architecture descriptors, the checkpoint
//! store, the per-epoch metrics log and layered configuration.

pub mod arch;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod hyperparams;
pub mod metrics;
pub mod persistence;
pub mod seed;

pub use arch::{
    ActivationKind, Architecture, DatasetKind, DatasetShape, PermutationMethod, StructuralParams,
};
pub use checkpoint::{
    CheckpointSet, CheckpointStore, OptimizerState, RunMetadata, RunState, SchedulerState,
    TensorBlob, TensorMap,
};
pub use config::{
    ConfigOverrides, ExperimentConfig, OptimizerKind, ScheduleKind, StepGranularity, load_config,
};
pub use error::{LabError, Result};
pub use hyperparams::{
    HyperparamKey, HyperparamTable, HyperparameterRecord, Resolver, SearchSpace, SelectionMode,
};
pub use metrics::{EpochRecord, MetricsLogger};
pub use persistence::RetryPolicy;
pub use seed::{SeedManager, SessionRng};

//! # actsweep-ml
//!
//! Candle-backed side of actsweep: the multi-input activation layer, the
//! MLP/CNN/ResNet model factory, optimizers and learning-rate schedules,
//! dataset sources, and the resumable training-session controller.

pub mod callbacks;
pub mod data;
pub mod error;
pub mod model;
pub mod optim;
pub mod runner;
pub mod schedule;
pub mod session;

pub use callbacks::{CallbackAction, DivergenceGuard, EpochObserver, StopAfter};
pub use data::{Batch, BatchSource, InMemorySource, SplitSpec};
pub use error::{MlError, Result};
pub use model::{KpgActivation, Mode, ParamRole, TrainableModel};
pub use optim::Optimizer;
pub use runner::{PreparedRun, ResumePolicy, default_device, prepare};
pub use schedule::LrScheduler;
pub use session::{RunProgress, TrainingSession};

//! Learning-rate schedules.

use crate::error::{MlError, Result};
use actsweep_core::{HyperparameterRecord, ScheduleKind, SchedulerState, StepGranularity};
use actsweep_core::config::ScheduleConfig;

/// A learning rate that advances in steps.
pub trait LrScheduler {
    /// Learning rate for the current step.
    fn learning_rate(&self) -> f64;

    fn step(&mut self);

    /// Whether [`LrScheduler::step`] runs after every batch or every epoch.
    fn granularity(&self) -> StepGranularity;

    fn state(&self) -> SchedulerState;

    fn load_state(&mut self, state: &SchedulerState) -> Result<()>;
}

/// Build the configured schedule.
///
/// `batches_per_epoch` is the real length of the training source; cycle
/// lengths derive from it.
pub fn build(
    config: &ScheduleConfig,
    hp: &HyperparameterRecord,
    epochs: u32,
    batches_per_epoch: usize,
) -> Box<dyn LrScheduler> {
    let granularity = config.effective_granularity();
    let total_steps = match granularity {
        StepGranularity::PerBatch => epochs as u64 * batches_per_epoch as u64,
        StepGranularity::PerEpoch => u64::from(epochs),
    };
    match config.kind {
        ScheduleKind::Cyclic => Box::new(CyclicLr::new(
            config.base_lr,
            hp.max_lr,
            hp.cycle_peak,
            total_steps,
            granularity,
        )),
        ScheduleKind::Exponential => {
            Box::new(ExponentialLr::new(hp.max_lr, config.gamma, granularity))
        }
    }
}

fn check_kind(state: &SchedulerState, kind: &str) -> Result<()> {
    if state.kind != kind {
        return Err(MlError::state(format!(
            "checkpoint holds {} schedule state, run uses {kind}",
            state.kind
        )));
    }
    Ok(())
}

/// Triangular cycle from `base_lr` up to `max_lr` and back.
///
/// The rising phase lasts `cycle_peak * total_steps` steps and the falling
/// phase the remainder, so one cycle spans the whole run.
#[derive(Debug, Clone)]
pub struct CyclicLr {
    base_lr: f64,
    max_lr: f64,
    step_up: u64,
    step_down: u64,
    steps: u64,
    granularity: StepGranularity,
}

impl CyclicLr {
    pub fn new(
        base_lr: f64,
        max_lr: f64,
        cycle_peak: f64,
        total_steps: u64,
        granularity: StepGranularity,
    ) -> Self {
        let step_up = ((cycle_peak * total_steps as f64).floor() as u64).max(1);
        let step_down = total_steps.saturating_sub(step_up).max(1);
        Self {
            base_lr,
            max_lr,
            step_up,
            step_down,
            steps: 0,
            granularity,
        }
    }

    pub fn step_sizes(&self) -> (u64, u64) {
        (self.step_up, self.step_down)
    }
}

impl LrScheduler for CyclicLr {
    fn learning_rate(&self) -> f64 {
        let cycle = self.step_up + self.step_down;
        let pos = self.steps % cycle;
        let scale = if pos <= self.step_up {
            pos as f64 / self.step_up as f64
        } else {
            (cycle - pos) as f64 / self.step_down as f64
        };
        self.base_lr + (self.max_lr - self.base_lr) * scale
    }

    fn step(&mut self) {
        self.steps += 1;
    }

    fn granularity(&self) -> StepGranularity {
        self.granularity
    }

    fn state(&self) -> SchedulerState {
        SchedulerState {
            kind: "cyclic".into(),
            steps: self.steps,
            learning_rate: self.learning_rate(),
        }
    }

    fn load_state(&mut self, state: &SchedulerState) -> Result<()> {
        check_kind(state, "cyclic")?;
        self.steps = state.steps;
        Ok(())
    }
}

/// `initial_lr * gamma^steps`.
#[derive(Debug, Clone)]
pub struct ExponentialLr {
    initial_lr: f64,
    gamma: f64,
    steps: u64,
    granularity: StepGranularity,
}

impl ExponentialLr {
    pub fn new(initial_lr: f64, gamma: f64, granularity: StepGranularity) -> Self {
        Self {
            initial_lr,
            gamma,
            steps: 0,
            granularity,
        }
    }
}

impl LrScheduler for ExponentialLr {
    fn learning_rate(&self) -> f64 {
        self.initial_lr * self.gamma.powf(self.steps as f64)
    }

    fn step(&mut self) {
        self.steps += 1;
    }

    fn granularity(&self) -> StepGranularity {
        self.granularity
    }

    fn state(&self) -> SchedulerState {
        SchedulerState {
            kind: "exponential".into(),
            steps: self.steps,
            learning_rate: self.learning_rate(),
        }
    }

    fn load_state(&mut self, state: &SchedulerState) -> Result<()> {
        check_kind(state, "exponential")?;
        self.steps = state.steps;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hp() -> HyperparameterRecord {
        HyperparameterRecord::new(0.9, 0.99, 1e-8, 0.0, 1e-3, 0.25).unwrap()
    }

    #[test]
    fn test_cycle_derives_from_real_loader_length() {
        let config = ScheduleConfig::default();
        let sched = CyclicLr::new(1e-8, 1e-3, 0.25, 10 * 37, StepGranularity::PerBatch);
        assert_eq!(sched.step_sizes(), (92, 278));

        let built = build(&config, &hp(), 10, 37);
        assert_eq!(built.granularity(), StepGranularity::PerBatch);
        assert_eq!(built.state().learning_rate, 1e-8);
    }

    #[test]
    fn test_triangle_shape() {
        let mut sched = CyclicLr::new(0.0, 1.0, 0.25, 8, StepGranularity::PerBatch);
        let mut lrs = Vec::new();
        for _ in 0..=8 {
            lrs.push(sched.learning_rate());
            sched.step();
        }
        assert_eq!(lrs, vec![0.0, 0.5, 1.0, 5.0 / 6.0, 4.0 / 6.0, 0.5, 2.0 / 6.0, 1.0 / 6.0, 0.0]);
    }

    #[test]
    fn test_tiny_runs_never_divide_by_zero() {
        let sched = CyclicLr::new(1e-8, 1e-3, 0.1, 1, StepGranularity::PerEpoch);
        assert_eq!(sched.step_sizes(), (1, 1));
        assert!(sched.learning_rate().is_finite());
    }

    #[test]
    fn test_exponential_and_state() {
        let config = ScheduleConfig {
            kind: ScheduleKind::Exponential,
            gamma: 0.5,
            ..ScheduleConfig::default()
        };
        let mut sched = build(&config, &hp(), 5, 100);
        assert_eq!(sched.granularity(), StepGranularity::PerEpoch);
        sched.step();
        sched.step();
        assert!((sched.learning_rate() - 2.5e-4).abs() < 1e-12);

        let state = sched.state();
        let mut fresh = build(&config, &hp(), 5, 100);
        fresh.load_state(&state).unwrap();
        assert_eq!(fresh.learning_rate(), sched.learning_rate());

        let cyclic = build(&ScheduleConfig::default(), &hp(), 5, 100);
        assert!(fresh.load_state(&cyclic.state()).is_err());
    }
}

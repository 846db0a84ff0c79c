//! Epoch observers: the metrics log, time-sliced stopping and divergence detection.

use crate::error::Result;
use actsweep_core::{EpochRecord, MetricsLogger};

/// Action an observer can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Trait for per-epoch observers.
pub trait EpochObserver {
    /// Called once per completed epoch, before the epoch counter advances.
    fn on_epoch_end(&mut self, record: &EpochRecord) -> Result<CallbackAction>;
}

impl EpochObserver for MetricsLogger {
    fn on_epoch_end(&mut self, record: &EpochRecord) -> Result<CallbackAction> {
        self.append(record)?;
        Ok(CallbackAction::Continue)
    }
}

/// Stops after a fixed number of epochs executed in this process, so a long
/// run can be split across time-limited jobs and resumed.
#[derive(Debug, Clone)]
pub struct StopAfter {
    pub epochs: u32,
    seen: u32,
}

impl StopAfter {
    pub fn new(epochs: u32) -> Self {
        Self { epochs, seen: 0 }
    }
}

impl EpochObserver for StopAfter {
    fn on_epoch_end(&mut self, record: &EpochRecord) -> Result<CallbackAction> {
        self.seen += 1;
        if self.seen >= self.epochs {
            tracing::info!(
                epoch = record.epoch,
                executed = self.seen,
                "Epoch allowance for this process used up"
            );
            return Ok(CallbackAction::Stop);
        }
        Ok(CallbackAction::Continue)
    }
}

/// Stops the run once a loss stops being finite.
#[derive(Debug, Clone, Default)]
pub struct DivergenceGuard;

impl EpochObserver for DivergenceGuard {
    fn on_epoch_end(&mut self, record: &EpochRecord) -> Result<CallbackAction> {
        // Detect NaN/Inf
        if !record.train_loss.is_finite() || !record.val_loss.is_finite() {
            tracing::warn!(
                epoch = record.epoch,
                train_loss = record.train_loss,
                val_loss = record.val_loss,
                "Loss diverged, stopping"
            );
            return Ok(CallbackAction::Stop);
        }
        Ok(CallbackAction::Continue)
    }
}

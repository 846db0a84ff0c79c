//! Optimizers over a model's parameter groups.
//!
//! Moment estimates are kept as plain tensors next to the variable they
//! track, so the whole optimizer state can be snapshotted into a
//! checkpoint and restored bit-exactly.

pub mod adam;
pub mod rmsprop;

pub use adam::Adam;
pub use rmsprop::RmsProp;

use crate::error::{MlError, Result};
use crate::model::{ParameterGroup, blob_to_tensor, tensor_to_blob};
use actsweep_core::{HyperparameterRecord, OptimizerKind, OptimizerState, TensorMap};
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

/// Gradient-based parameter updates.
pub trait Optimizer {
    /// Compute gradients of `loss` for the next [`Optimizer::step`].
    fn backward(&mut self, loss: &Tensor) -> Result<()>;

    /// Apply one update from the stored gradients.
    fn step(&mut self) -> Result<()>;

    fn zero_gradients(&mut self);

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn state(&self) -> Result<OptimizerState>;

    fn load_state(&mut self, state: &OptimizerState) -> Result<()>;
}

/// Build the configured optimizer over `groups`.
pub fn build(
    kind: OptimizerKind,
    groups: Vec<ParameterGroup>,
    hp: &HyperparameterRecord,
) -> Result<Box<dyn Optimizer>> {
    Ok(match kind {
        OptimizerKind::Adam => Box::new(Adam::new(groups, hp)?),
        OptimizerKind::Rmsprop => Box::new(RmsProp::new(groups, hp)?),
    })
}

/// One parameter with its decay and moment buffers.
#[derive(Debug)]
pub(crate) struct Slot {
    pub name: String,
    pub var: Var,
    pub weight_decay: f64,
    pub moments: Vec<Tensor>,
}

impl Slot {
    /// One slot per trainable variable, each with `moments` zeroed buffers.
    pub fn from_groups(groups: Vec<ParameterGroup>, base_decay: f64, moments: usize) -> Result<Vec<Slot>> {
        let mut slots = Vec::new();
        for group in groups {
            let decay = group.weight_decay(base_decay);
            for (name, var) in group.vars {
                let zeros = var.as_tensor().zeros_like()?;
                slots.push(Slot {
                    name,
                    var,
                    weight_decay: decay,
                    moments: vec![zeros; moments],
                });
            }
        }
        Ok(slots)
    }

    /// The gradient with coupled L2 decay added.
    pub fn decayed_grad(&self, grads: &GradStore) -> Result<Option<Tensor>> {
        let Some(grad) = grads.get(self.var.as_tensor()) else {
            return Ok(None);
        };
        if self.weight_decay == 0.0 {
            return Ok(Some(grad.clone()));
        }
        let theta = self.var.as_tensor().detach();
        Ok(Some((grad + theta.affine(self.weight_decay, 0.0)?)?))
    }
}

/// Snapshot slots as `<prefix>.<param>` entries, one prefix per moment.
pub(crate) fn save_slots(slots: &[Slot], prefixes: &[&str]) -> Result<TensorMap> {
    let mut map = TensorMap::new();
    for slot in slots {
        for (prefix, moment) in prefixes.iter().zip(&slot.moments) {
            map.insert(format!("{prefix}.{}", slot.name), tensor_to_blob(moment)?);
        }
    }
    Ok(map)
}

pub(crate) fn load_slots(slots: &mut [Slot], prefixes: &[&str], map: &TensorMap) -> Result<()> {
    let expected = slots.len() * prefixes.len();
    if map.len() != expected {
        return Err(MlError::state(format!(
            "optimizer state has {} slots, expected {expected}",
            map.len()
        )));
    }
    for slot in slots.iter_mut() {
        for (prefix, moment) in prefixes.iter().zip(slot.moments.iter_mut()) {
            let key = format!("{prefix}.{}", slot.name);
            let blob = map
                .get(&key)
                .ok_or_else(|| MlError::state(format!("optimizer state is missing {key}")))?;
            if blob.shape.as_slice() != slot.var.dims() {
                return Err(MlError::state(format!(
                    "optimizer slot {key} has shape {:?}, expected {:?}",
                    blob.shape,
                    slot.var.dims()
                )));
            }
            *moment = blob_to_tensor(blob, slot.var.device())?;
        }
    }
    Ok(())
}

pub(crate) fn check_kind(state: &OptimizerState, kind: &str) -> Result<()> {
    if state.kind != kind {
        return Err(MlError::state(format!(
            "checkpoint holds {} optimizer state, run uses {kind}",
            state.kind
        )));
    }
    Ok(())
}

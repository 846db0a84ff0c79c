//! Adam with coupled L2 weight decay and bias correction.

use super::{Optimizer, Slot, check_kind, load_slots, save_slots};
use crate::error::Result;
use crate::model::ParameterGroup;
use actsweep_core::{HyperparameterRecord, OptimizerState};
use candle_core::Tensor;
use candle_core::backprop::GradStore;

const KIND: &str = "adam";
const MOMENTS: [&str; 2] = ["m", "v"];

pub struct Adam {
    slots: Vec<Slot>,
    beta_1: f64,
    beta_2: f64,
    eps: f64,
    lr: f64,
    step: u64,
    grads: Option<GradStore>,
}

impl Adam {
    pub fn new(groups: Vec<ParameterGroup>, hp: &HyperparameterRecord) -> Result<Self> {
        Ok(Self {
            slots: Slot::from_groups(groups, hp.weight_decay, MOMENTS.len())?,
            beta_1: hp.beta_1,
            beta_2: hp.beta_2,
            eps: hp.eps,
            lr: hp.max_lr,
            step: 0,
            grads: None,
        })
    }
}

impl Optimizer for Adam {
    fn backward(&mut self, loss: &Tensor) -> Result<()> {
        self.grads = Some(loss.backward()?);
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        let Some(grads) = self.grads.take() else {
            return Ok(());
        };
        self.step += 1;
        let t = self.step as i32;
        let correction_1 = 1.0 - self.beta_1.powi(t);
        let correction_2 = 1.0 - self.beta_2.powi(t);

        for slot in &mut self.slots {
            let Some(grad) = slot.decayed_grad(&grads)? else {
                continue;
            };
            let m = (slot.moments[0].affine(self.beta_1, 0.0)? + grad.affine(1.0 - self.beta_1, 0.0)?)?;
            let v = (slot.moments[1].affine(self.beta_2, 0.0)?
                + grad.sqr()?.affine(1.0 - self.beta_2, 0.0)?)?;
            let m_hat = m.affine(1.0 / correction_1, 0.0)?;
            let denom = v.affine(1.0 / correction_2, 0.0)?.sqrt()?.affine(1.0, self.eps)?;
            let update = m_hat.div(&denom)?.affine(self.lr, 0.0)?;
            let theta = slot.var.as_tensor().detach();
            slot.var.set(&(theta - update)?)?;
            slot.moments = vec![m, v];
        }
        Ok(())
    }

    fn zero_gradients(&mut self) {
        self.grads = None;
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn state(&self) -> Result<OptimizerState> {
        Ok(OptimizerState {
            kind: KIND.to_string(),
            step: self.step,
            learning_rate: self.lr,
            slots: save_slots(&self.slots, &MOMENTS)?,
        })
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        check_kind(state, KIND)?;
        load_slots(&mut self.slots, &MOMENTS, &state.slots)?;
        self.step = state.step;
        self.lr = state.learning_rate;
        self.grads = None;
        Ok(())
    }
}

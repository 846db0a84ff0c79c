//! RMSprop with coupled L2 weight decay.

use super::{Optimizer, Slot, check_kind, load_slots, save_slots};
use crate::error::Result;
use crate::model::ParameterGroup;
use actsweep_core::{HyperparameterRecord, OptimizerState};
use candle_core::Tensor;
use candle_core::backprop::GradStore;

const KIND: &str = "rmsprop";
const MOMENTS: [&str; 1] = ["v"];
const ALPHA: f64 = 0.99;

pub struct RmsProp {
    slots: Vec<Slot>,
    eps: f64,
    lr: f64,
    step: u64,
    grads: Option<GradStore>,
}

impl RmsProp {
    pub fn new(groups: Vec<ParameterGroup>, hp: &HyperparameterRecord) -> Result<Self> {
        Ok(Self {
            slots: Slot::from_groups(groups, hp.weight_decay, MOMENTS.len())?,
            eps: hp.eps,
            lr: hp.max_lr,
            step: 0,
            grads: None,
        })
    }
}

impl Optimizer for RmsProp {
    fn backward(&mut self, loss: &Tensor) -> Result<()> {
        self.grads = Some(loss.backward()?);
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        let Some(grads) = self.grads.take() else {
            return Ok(());
        };
        self.step += 1;
        for slot in &mut self.slots {
            let Some(grad) = slot.decayed_grad(&grads)? else {
                continue;
            };
            let v = (slot.moments[0].affine(ALPHA, 0.0)? + grad.sqr()?.affine(1.0 - ALPHA, 0.0)?)?;
            let denom = v.sqrt()?.affine(1.0, self.eps)?;
            let update = grad.div(&denom)?.affine(self.lr, 0.0)?;
            let theta = slot.var.as_tensor().detach();
            slot.var.set(&(theta - update)?)?;
            slot.moments = vec![v];
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParamRole, ParamStore};
    use candle_core::Device;

    #[test]
    fn test_update_and_decay() {
        let mut params = ParamStore::new();
        let var = params
            .insert(
                "linear.0.weight",
                Tensor::new(&[1f32], &Device::Cpu).unwrap(),
                ParamRole::Weights,
            )
            .unwrap();
        let hp = HyperparameterRecord::new(0.9, 0.999, 1e-8, 0.5, 0.01, 0.3).unwrap();
        let mut opt = RmsProp::new(params.groups(), &hp).unwrap();

        let loss = var.as_tensor().sum_all().unwrap();
        opt.backward(&loss).unwrap();
        opt.step().unwrap();

        // g = 1 + 0.5 * 1, v = 0.01 * g^2, step = lr * g / sqrt(v) = lr * 10
        let w = params.state_dict().unwrap()["linear.0.weight"].to_f32().unwrap();
        assert!((w[0] - 0.9).abs() < 1e-4);

        let state = opt.state().unwrap();
        assert_eq!(state.kind, "rmsprop");
        assert_eq!(state.slots.keys().collect::<Vec<_>>(), vec!["v.linear.0.weight"]);
    }
}

//! Batch normalisation with explicit running-statistics buffers.

use super::init;
use super::{Mode, ParamRole, ParamStore};
use crate::error::{MlError, Result};
use candle_core::{Device, Tensor, Var};

const MOMENTUM: f64 = 0.1;
const EPS: f64 = 1e-5;

/// Normalises dim 1 of `(N, C)` or `(N, C, H, W)` inputs.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    channels: usize,
    weight: Var,
    bias: Var,
    running_mean: Var,
    running_var: Var,
}

impl BatchNorm {
    pub fn new(name: &str, channels: usize, params: &mut ParamStore, device: &Device) -> Result<Self> {
        let weight = params.insert(
            format!("{name}.weight"),
            init::ones(&[channels], device)?,
            ParamRole::Normalization,
        )?;
        let bias = params.insert(
            format!("{name}.bias"),
            init::zeros(&[channels], device)?,
            ParamRole::Normalization,
        )?;
        let running_mean = params.insert(
            format!("{name}.running_mean"),
            init::zeros(&[channels], device)?,
            ParamRole::Buffer,
        )?;
        let running_var = params.insert(
            format!("{name}.running_var"),
            init::ones(&[channels], device)?,
            ParamRole::Buffer,
        )?;
        Ok(Self {
            channels,
            weight,
            bias,
            running_mean,
            running_var,
        })
    }

    pub fn forward(&self, xs: &Tensor, mode: Mode) -> Result<Tensor> {
        let rank = xs.rank();
        if (rank != 2 && rank != 4) || xs.dim(1)? != self.channels {
            return Err(MlError::Training(format!(
                "batch norm over {} channels got input of shape {:?}",
                self.channels,
                xs.dims()
            )));
        }
        let stat_shape: Vec<usize> = if rank == 2 {
            vec![1, self.channels]
        } else {
            vec![1, self.channels, 1, 1]
        };

        let (mean, var) = match mode {
            Mode::Train => {
                // (C, N * H * W) view of the batch
                let per_channel = xs.transpose(0, 1)?.flatten_from(1)?;
                let count = per_channel.dim(1)?;
                let mean = per_channel.mean_keepdim(1)?;
                let var = per_channel.broadcast_sub(&mean)?.sqr()?.mean(1)?;
                let mean = mean.squeeze(1)?;
                self.update_running(&mean, &var, count)?;
                (mean, var)
            }
            Mode::Eval => (
                self.running_mean.as_tensor().clone(),
                self.running_var.as_tensor().clone(),
            ),
        };

        let mean = mean.reshape(stat_shape.as_slice())?;
        let std = var.affine(1.0, EPS)?.sqrt()?.reshape(stat_shape.as_slice())?;
        let weight = self.weight.as_tensor().reshape(stat_shape.as_slice())?;
        let bias = self.bias.as_tensor().reshape(stat_shape.as_slice())?;
        let normed = xs.broadcast_sub(&mean)?.broadcast_div(&std)?;
        Ok(normed.broadcast_mul(&weight)?.broadcast_add(&bias)?)
    }

    fn update_running(&self, mean: &Tensor, var: &Tensor, count: usize) -> Result<()> {
        let unbiased = if count > 1 {
            count as f64 / (count - 1) as f64
        } else {
            1.0
        };
        let mean = mean.detach();
        let var = var.detach().affine(unbiased, 0.0)?;
        let rm = (self.running_mean.as_tensor().affine(1.0 - MOMENTUM, 0.0)? + mean.affine(MOMENTUM, 0.0)?)?;
        let rv = (self.running_var.as_tensor().affine(1.0 - MOMENTUM, 0.0)? + var.affine(MOMENTUM, 0.0)?)?;
        self.running_mean.set(&rm)?;
        self.running_var.set(&rv)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_train_mode_normalises_and_tracks_stats() {
        let dev = Device::Cpu;
        let mut params = ParamStore::new();
        let bn = BatchNorm::new("norm.0", 2, &mut params, &dev).unwrap();
        let x = Tensor::new(&[[1f32, 10.0], [3.0, 30.0]], &dev).unwrap();

        let y = bn.forward(&x, Mode::Train).unwrap();
        let y = y.to_vec2::<f32>().unwrap();
        assert!((y[0][0] + 1.0).abs() < 1e-3);
        assert!((y[1][1] - 1.0).abs() < 1e-3);

        let state = params.state_dict().unwrap();
        let rm = state["norm.0.running_mean"].to_f32().unwrap();
        assert!((rm[0] - 0.2).abs() < 1e-6);
        assert!((rm[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_eval_mode_leaves_buffers_alone() {
        let dev = Device::Cpu;
        let mut params = ParamStore::new();
        let bn = BatchNorm::new("norm.0", 3, &mut params, &dev).unwrap();
        let x = Tensor::ones((2, 3, 4, 4), candle_core::DType::F32, &dev).unwrap();
        let before = params.state_dict().unwrap();
        let y = bn.forward(&x, Mode::Eval).unwrap();
        assert_eq!(y.dims(), &[2, 3, 4, 4]);
        assert_eq!(params.state_dict().unwrap(), before);
    }
}

//! Linear and convolution layers backed by registered variables.

use super::init;
use super::{ParamRole, ParamStore};
use crate::error::Result;
use actsweep_core::SessionRng;
use candle_core::{Device, Tensor, Var};

#[derive(Debug, Clone)]
pub struct Linear {
    weight: Var,
    bias: Var,
}

impl Linear {
    pub fn new(
        name: &str,
        in_features: usize,
        out_features: usize,
        params: &mut ParamStore,
        rng: &mut SessionRng,
        device: &Device,
    ) -> Result<Self> {
        let weight = init::he_uniform(&[out_features, in_features], in_features, rng, device)?;
        let weight = params.insert(format!("{name}.weight"), weight, ParamRole::Weights)?;
        let bias = params.insert(
            format!("{name}.bias"),
            init::zeros(&[out_features], device)?,
            ParamRole::Weights,
        )?;
        Ok(Self { weight, bias })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = xs.matmul(&self.weight.as_tensor().t()?)?;
        Ok(ys.broadcast_add(self.bias.as_tensor())?)
    }
}

/// Square-kernel 2-d convolution, optionally without bias.
#[derive(Debug, Clone)]
pub struct Conv2d {
    weight: Var,
    bias: Option<Var>,
    padding: usize,
    stride: usize,
}

impl Conv2d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        bias: bool,
        params: &mut ParamStore,
        rng: &mut SessionRng,
        device: &Device,
    ) -> Result<Self> {
        let fan_in = in_channels * kernel * kernel;
        let weight = init::he_uniform(
            &[out_channels, in_channels, kernel, kernel],
            fan_in,
            rng,
            device,
        )?;
        let weight = params.insert(format!("{name}.weight"), weight, ParamRole::Weights)?;
        let bias = if bias {
            Some(params.insert(
                format!("{name}.bias"),
                init::zeros(&[out_channels], device)?,
                ParamRole::Weights,
            )?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            padding: kernel / 2,
            stride,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = xs.conv2d(self.weight.as_tensor(), self.padding, self.stride, 1, 1)?;
        match &self.bias {
            Some(bias) => {
                let bias = bias.as_tensor().reshape((1, bias.dim(0)?, 1, 1))?;
                Ok(ys.broadcast_add(&bias)?)
            }
            None => Ok(ys),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use rand::SeedableRng;

    #[test]
    fn test_linear_and_conv_shapes() {
        let dev = Device::Cpu;
        let mut params = ParamStore::new();
        let mut rng = SessionRng::seed_from_u64(0);
        let linear = Linear::new("linear.0", 5, 3, &mut params, &mut rng, &dev).unwrap();
        let x = Tensor::ones((2, 5), DType::F32, &dev).unwrap();
        assert_eq!(linear.forward(&x).unwrap().dims(), &[2, 3]);

        let conv = Conv2d::new("conv.0", 2, 4, 3, 2, false, &mut params, &mut rng, &dev).unwrap();
        let x = Tensor::ones((1, 2, 8, 8), DType::F32, &dev).unwrap();
        assert_eq!(conv.forward(&x).unwrap().dims(), &[1, 4, 4, 4]);
        assert_eq!(params.len(), 3);
    }
}

//! Seeded parameter initialisation.
//!
//! Initial values are drawn from the caller's generator on the host and
//! then moved to the device, so a given seed always yields the same network.

use crate::error::Result;
use actsweep_core::SessionRng;
use candle_core::{DType, Device, Tensor};
use rand::distributions::{Distribution, Uniform};

/// He-uniform: `U(-sqrt(6 / fan_in), sqrt(6 / fan_in))`.
pub fn he_uniform(
    shape: &[usize],
    fan_in: usize,
    rng: &mut SessionRng,
    device: &Device,
) -> Result<Tensor> {
    let bound = (6.0 / fan_in.max(1) as f64).sqrt() as f32;
    let dist = Uniform::new_inclusive(-bound, bound);
    let count: usize = shape.iter().product();
    let values: Vec<f32> = dist.sample_iter(&mut *rng).take(count).collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}

pub fn zeros(shape: &[usize], device: &Device) -> Result<Tensor> {
    Ok(Tensor::zeros(shape, DType::F32, device)?)
}

pub fn ones(shape: &[usize], device: &Device) -> Result<Tensor> {
    Ok(Tensor::ones(shape, DType::F32, device)?)
}

//! Permuted, grouped multi-input activations.
//!
//! A layer with `C = units * k` pre-activation channels first builds `p`
//! copies of them (the identity plus `p - 1` permutations that stay inside
//! each of the `g` channel groups), concatenates the copies along dim 1 and
//! then reduces every run of `k` consecutive channels to one output unit.
//! Single-valued activations have `k = 1` and act elementwise.

use super::{ParamRole, ParamStore};
use crate::error::{MlError, Result};
use actsweep_core::{ActivationKind, LabError, PermutationMethod, SessionRng, StructuralParams};
use candle_core::{Device, Tensor, Var};
use rand::seq::SliceRandom;

#[derive(Debug, Clone)]
pub struct KpgActivation {
    kind: ActivationKind,
    k: usize,
    in_channels: usize,
    /// Channel index of each permuted copy; `None` is the identity.
    copies: Vec<Option<Tensor>>,
    alpha_primes: Option<Var>,
}

impl KpgActivation {
    pub fn new(
        name: &str,
        kind: ActivationKind,
        in_channels: usize,
        structure: &StructuralParams,
        params: &mut ParamStore,
        rng: &mut SessionRng,
        device: &Device,
    ) -> Result<Self> {
        let StructuralParams { k, p, g, .. } = *structure;
        if in_channels % k != 0 || in_channels % g != 0 {
            return Err(LabError::InvalidStructure {
                architecture: name.to_string(),
                activation: kind.to_string(),
                reason: format!("{in_channels} channels are not divisible by k = {k} and g = {g}"),
            }
            .into());
        }

        let mut copies = vec![None];
        for copy in 1..p {
            let index = permutation(structure.permutation, copy, in_channels, g, rng);
            copies.push(Some(Tensor::from_vec(index, in_channels, device)?));
        }

        let units = in_channels / k * p;
        let alpha_primes = if kind.has_mixing_coefficients() {
            Some(params.insert(
                format!("{name}.alpha_primes"),
                Tensor::zeros((units, 3), candle_core::DType::F32, device)?,
                ParamRole::Mixing,
            )?)
        } else {
            None
        };

        Ok(Self {
            kind,
            k,
            in_channels,
            copies,
            alpha_primes,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.in_channels / self.k * self.copies.len()
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let rank = xs.rank();
        if (rank != 2 && rank != 4) || xs.dim(1)? != self.in_channels {
            return Err(MlError::Training(format!(
                "{} activation over {} channels got input of shape {:?}",
                self.kind,
                self.in_channels,
                xs.dims()
            )));
        }

        let mut parts = Vec::with_capacity(self.copies.len());
        for copy in &self.copies {
            parts.push(match copy {
                None => xs.clone(),
                Some(index) => xs.index_select(index, 1)?,
            });
        }
        let xs = if parts.len() == 1 {
            parts.swap_remove(0)
        } else {
            Tensor::cat(&parts, 1)?
        };

        match self.kind {
            ActivationKind::Relu => Ok(xs.relu()?),
            ActivationKind::Abs => Ok(xs.abs()?),
            ActivationKind::Swish => {
                let gate = (xs.neg()?.exp()? + 1.0)?;
                Ok(xs.div(&gate)?)
            }
            ActivationKind::LeakyRelu => Ok(xs.maximum(&xs.affine(0.01, 0.0)?)?),
            ActivationKind::Max => Ok(self.grouped(&xs)?.max(2)?),
            ActivationKind::L1 => Ok(self.grouped(&xs)?.abs()?.sum(2)?),
            ActivationKind::L2 => l2(&self.grouped(&xs)?),
            ActivationKind::Combinact => self.combinact(&xs),
        }
    }

    /// `(N, C, ...)` to `(N, C / k, k, ...)`.
    fn grouped(&self, xs: &Tensor) -> Result<Tensor> {
        let mut shape = xs.dims().to_vec();
        shape[1] /= self.k;
        shape.insert(2, self.k);
        Ok(xs.reshape(shape)?)
    }

    fn combinact(&self, xs: &Tensor) -> Result<Tensor> {
        let alpha = self.softmax_alphas()?;
        let grouped = self.grouped(xs)?;
        let reductions = [
            grouped.max(2)?,
            l2(&grouped)?,
            grouped.abs()?.sum(2)?,
        ];
        let units = reductions[0].dim(1)?;
        let mut coef_shape = vec![1, units];
        coef_shape.resize(xs.rank(), 1);

        let mut mixed: Option<Tensor> = None;
        for (j, reduced) in reductions.iter().enumerate() {
            let coef = alpha.narrow(1, j, 1)?.reshape(coef_shape.as_slice())?;
            let term = reduced.broadcast_mul(&coef)?;
            mixed = Some(match mixed {
                None => term,
                Some(acc) => (acc + term)?,
            });
        }
        mixed.ok_or_else(|| MlError::Training("combinact has no reductions".into()))
    }

    fn softmax_alphas(&self) -> Result<Tensor> {
        let alpha_primes = self
            .alpha_primes
            .as_ref()
            .ok_or_else(|| MlError::Training(format!("{} has no mixing coefficients", self.kind)))?;
        Ok(candle_nn::ops::softmax(alpha_primes.as_tensor(), 1)?)
    }

    /// Softmax mixing weights averaged over units, ordered max, l2, l1.
    pub fn mixing_weights(&self) -> Result<Option<Vec<f64>>> {
        if self.alpha_primes.is_none() {
            return Ok(None);
        }
        let mean = self.softmax_alphas()?.mean(0)?.to_vec1::<f32>()?;
        Ok(Some(mean.into_iter().map(f64::from).collect()))
    }
}

fn l2(grouped: &Tensor) -> Result<Tensor> {
    Ok(grouped.sqr()?.sum(2)?.affine(1.0, 1e-8)?.sqrt()?)
}

/// Index of permuted copy `copy`, permuting only within each of `groups`
/// contiguous channel groups.
fn permutation(
    method: PermutationMethod,
    copy: usize,
    channels: usize,
    groups: usize,
    rng: &mut SessionRng,
) -> Vec<u32> {
    let size = channels / groups;
    let mut index = Vec::with_capacity(channels);
    for group in 0..groups {
        let mut local: Vec<u32> = (group * size..(group + 1) * size).map(|i| i as u32).collect();
        match method {
            PermutationMethod::Shuffle => local.shuffle(rng),
            PermutationMethod::Roll => local.rotate_right(copy % size.max(1)),
        }
        index.extend(local);
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn structure(k: usize, p: usize, g: usize, permutation: PermutationMethod) -> StructuralParams {
        StructuralParams {
            k,
            p,
            g,
            permutation,
            ..StructuralParams::default()
        }
    }

    fn build(kind: ActivationKind, channels: usize, s: &StructuralParams) -> (KpgActivation, ParamStore) {
        let mut params = ParamStore::new();
        let act = KpgActivation::new(
            "act.0",
            kind,
            channels,
            s,
            &mut params,
            &mut SessionRng::seed_from_u64(5),
            &Device::Cpu,
        )
        .unwrap();
        (act, params)
    }

    #[test]
    fn test_max_reduces_pairs() {
        let (act, params) = build(ActivationKind::Max, 4, &structure(2, 1, 1, PermutationMethod::Shuffle));
        assert!(params.is_empty());
        let x = Tensor::new(&[[1f32, -2.0, 0.5, 3.0]], &Device::Cpu).unwrap();
        let y = act.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(y, vec![vec![1.0, 3.0]]);
        assert_eq!(act.out_channels(), 2);
    }

    #[test]
    fn test_l1_and_l2_on_feature_maps() {
        let s = structure(2, 1, 1, PermutationMethod::Shuffle);
        let x = Tensor::new(&[3f32, -4.0], &Device::Cpu)
            .unwrap()
            .reshape((1, 2, 1, 1))
            .unwrap();
        let (l1, _) = build(ActivationKind::L1, 2, &s);
        let (l2, _) = build(ActivationKind::L2, 2, &s);
        let a = l1.forward(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = l2.forward(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, vec![7.0]);
        assert!((b[0] - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_copies_widen_the_output() {
        let s = structure(2, 3, 2, PermutationMethod::Roll);
        let (act, _) = build(ActivationKind::Max, 8, &s);
        assert_eq!(act.out_channels(), 12);
        let x = Tensor::ones((5, 8), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert_eq!(act.forward(&x).unwrap().dims(), &[5, 12]);
    }

    #[test]
    fn test_permutations_stay_inside_groups() {
        let mut rng = SessionRng::seed_from_u64(9);
        let index = permutation(PermutationMethod::Shuffle, 1, 12, 3, &mut rng);
        for (group, chunk) in index.chunks(4).enumerate() {
            let mut sorted = chunk.to_vec();
            sorted.sort_unstable();
            let expected: Vec<u32> = (group as u32 * 4..group as u32 * 4 + 4).collect();
            assert_eq!(sorted, expected);
        }
        assert_eq!(
            permutation(PermutationMethod::Roll, 1, 4, 1, &mut rng),
            vec![3, 0, 1, 2]
        );
    }

    #[test]
    fn test_combinact_starts_as_even_mixture() {
        let s = structure(2, 1, 1, PermutationMethod::Shuffle);
        let (act, params) = build(ActivationKind::Combinact, 2, &s);
        assert_eq!(params.num_trainable(), 3);
        let weights = act.mixing_weights().unwrap().unwrap();
        assert!(weights.iter().all(|w| (w - 1.0 / 3.0).abs() < 1e-6));

        let x = Tensor::new(&[[3f32, -4.0]], &Device::Cpu).unwrap();
        let y = act.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        assert!((y[0][0] - (3.0 + 5.0 + 7.0) / 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_single_valued_kinds() {
        let s = structure(1, 1, 1, PermutationMethod::Shuffle);
        let x = Tensor::new(&[[-2f32, 2.0]], &Device::Cpu).unwrap();
        let run = |kind| build(kind, 2, &s).0.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(run(ActivationKind::Relu), vec![vec![0.0, 2.0]]);
        assert_eq!(run(ActivationKind::Abs), vec![vec![2.0, 2.0]]);
        let leaky = run(ActivationKind::LeakyRelu);
        assert!((leaky[0][0] + 0.02).abs() < 1e-6);
        let swish = run(ActivationKind::Swish);
        assert!((swish[0][1] - 2.0 / (1.0 + (-2f32).exp())).abs() < 1e-5);
    }

    #[test]
    fn test_indivisible_channels_are_an_invalid_structure() {
        let err = KpgActivation::new(
            "act.1",
            ActivationKind::Max,
            5,
            &structure(2, 1, 1, PermutationMethod::Shuffle),
            &mut ParamStore::new(),
            &mut SessionRng::seed_from_u64(5),
            &Device::Cpu,
        )
        .err()
        .unwrap();
        match err.as_lab() {
            Some(LabError::InvalidStructure {
                architecture,
                activation,
                reason,
            }) => {
                assert_eq!(architecture, "act.1");
                assert_eq!(activation, "max");
                assert!(reason.contains("k = 2"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}

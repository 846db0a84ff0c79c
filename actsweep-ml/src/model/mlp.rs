//! Fully connected network: `linear -> batch norm -> activation` per hidden
//! layer, then a linear classifier.

use super::activation::KpgActivation;
use super::layers::Linear;
use super::norm::BatchNorm;
use super::{Mode, ParamStore, TrainableModel, collect_mixing};
use crate::error::Result;
use actsweep_core::{ActivationKind, DatasetShape, SessionRng, StructuralParams};
use candle_core::{Device, Tensor};

#[derive(Debug)]
struct Hidden {
    linear: Linear,
    norm: BatchNorm,
    act: KpgActivation,
}

#[derive(Debug)]
pub struct Mlp {
    hidden: Vec<Hidden>,
    output: Linear,
    params: ParamStore,
    mode: Mode,
}

impl Mlp {
    pub fn new(
        activation: ActivationKind,
        shape: DatasetShape,
        structure: &StructuralParams,
        rng: &mut SessionRng,
        device: &Device,
    ) -> Result<Self> {
        let mut params = ParamStore::new();
        let mut hidden = Vec::with_capacity(structure.layers.len());
        let mut width = shape.flat_features();
        for (i, &units) in structure.layers.iter().enumerate() {
            let pre = units * structure.k;
            let linear = Linear::new(&format!("linear.{i}"), width, pre, &mut params, rng, device)?;
            let norm = BatchNorm::new(&format!("norm.{i}"), pre, &mut params, device)?;
            let act = KpgActivation::new(
                &format!("mix.{i}"),
                activation,
                pre,
                structure,
                &mut params,
                rng,
                device,
            )?;
            width = act.out_channels();
            hidden.push(Hidden { linear, norm, act });
        }
        let output = Linear::new("linear.out", width, shape.classes, &mut params, rng, device)?;
        Ok(Self {
            hidden,
            output,
            params,
            mode: Mode::Train,
        })
    }
}

impl TrainableModel for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.flatten_from(1)?;
        for layer in &self.hidden {
            xs = layer.linear.forward(&xs)?;
            xs = layer.norm.forward(&xs, self.mode)?;
            xs = layer.act.forward(&xs)?;
        }
        self.output.forward(&xs)
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn params(&self) -> &ParamStore {
        &self.params
    }

    fn mixing_weights(&self) -> Result<Option<Vec<Vec<f64>>>> {
        collect_mixing(self.hidden.iter().map(|h| &h.act))
    }
}

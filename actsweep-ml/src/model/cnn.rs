//! Convolutional network: `conv3x3 -> batch norm -> activation -> maxpool`
//! per block, then a linear classifier over the flattened maps.

use super::activation::KpgActivation;
use super::layers::{Conv2d, Linear};
use super::norm::BatchNorm;
use super::{Mode, ParamStore, TrainableModel, collect_mixing};
use crate::error::Result;
use actsweep_core::{ActivationKind, DatasetShape, SessionRng, StructuralParams};
use candle_core::{Device, Tensor};

#[derive(Debug)]
struct Block {
    conv: Conv2d,
    norm: BatchNorm,
    act: KpgActivation,
}

#[derive(Debug)]
pub struct Cnn {
    blocks: Vec<Block>,
    output: Linear,
    params: ParamStore,
    mode: Mode,
}

impl Cnn {
    /// Spatial side after `blocks` 2x2 poolings.
    pub fn final_spatial(spatial: usize, blocks: usize) -> usize {
        (0..blocks).fold(spatial, |side, _| side / 2)
    }

    pub fn new(
        activation: ActivationKind,
        shape: DatasetShape,
        structure: &StructuralParams,
        rng: &mut SessionRng,
        device: &Device,
    ) -> Result<Self> {
        let mut params = ParamStore::new();
        let mut blocks = Vec::with_capacity(structure.layers.len());
        let mut channels = shape.channels;
        for (i, &units) in structure.layers.iter().enumerate() {
            let pre = units * structure.k;
            let conv = Conv2d::new(
                &format!("conv.{i}"),
                channels,
                pre,
                3,
                1,
                true,
                &mut params,
                rng,
                device,
            )?;
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
            channels = act.out_channels();
            blocks.push(Block { conv, norm, act });
        }
        let side = Self::final_spatial(shape.spatial, structure.layers.len());
        let output = Linear::new(
            "linear.out",
            channels * side * side,
            shape.classes,
            &mut params,
            rng,
            device,
        )?;
        Ok(Self {
            blocks,
            output,
            params,
            mode: Mode::Train,
        })
    }
}

impl TrainableModel for Cnn {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for block in &self.blocks {
            xs = block.conv.forward(&xs)?;
            xs = block.norm.forward(&xs, self.mode)?;
            xs = block.act.forward(&xs)?;
            xs = xs.max_pool2d(2)?;
        }
        self.output.forward(&xs.flatten_from(1)?)
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
        collect_mixing(self.blocks.iter().map(|b| &b.act))
    }
}

//! Pre-activation ResNet-18/34 with multi-input activations.
//!
//! Every activation maps `c * k` channels to `c * p`, so block outputs carry
//! `planes * k` channels and each convolution reads `planes * p`.

use super::activation::KpgActivation;
use super::layers::{Conv2d, Linear};
use super::norm::BatchNorm;
use super::{Mode, ParamStore, TrainableModel, collect_mixing};
use crate::error::Result;
use actsweep_core::{ActivationKind, DatasetShape, SessionRng, StructuralParams};
use candle_core::{Device, Tensor};

const STRIDES: [usize; 4] = [1, 2, 2, 2];

/// Blocks per stage.
pub fn stage_depths(version: u32) -> [usize; 4] {
    match version {
        34 => [3, 4, 6, 3],
        _ => [2, 2, 2, 2],
    }
}

#[derive(Debug)]
struct PreActBlock {
    bn1: BatchNorm,
    act1: KpgActivation,
    conv1: Conv2d,
    bn2: BatchNorm,
    act2: KpgActivation,
    conv2: Conv2d,
    shortcut: Option<Conv2d>,
}

impl PreActBlock {
    #[allow(clippy::too_many_arguments)]
    fn new(
        name: &str,
        in_channels: usize,
        planes: usize,
        stride: usize,
        activation: ActivationKind,
        structure: &StructuralParams,
        params: &mut ParamStore,
        rng: &mut SessionRng,
        device: &Device,
    ) -> Result<Self> {
        let k = structure.k;
        let bn1 = BatchNorm::new(&format!("norm.{name}.bn1"), in_channels, params, device)?;
        let act1 = KpgActivation::new(
            &format!("mix.{name}.act1"),
            activation,
            in_channels,
            structure,
            params,
            rng,
            device,
        )?;
        let conv1 = Conv2d::new(
            &format!("conv.{name}.conv1"),
            act1.out_channels(),
            planes * k,
            3,
            stride,
            false,
            params,
            rng,
            device,
        )?;
        let bn2 = BatchNorm::new(&format!("norm.{name}.bn2"), planes * k, params, device)?;
        let act2 = KpgActivation::new(
            &format!("mix.{name}.act2"),
            activation,
            planes * k,
            structure,
            params,
            rng,
            device,
        )?;
        let conv2 = Conv2d::new(
            &format!("conv.{name}.conv2"),
            act2.out_channels(),
            planes * k,
            3,
            1,
            false,
            params,
            rng,
            device,
        )?;
        let shortcut = if stride != 1 || in_channels != planes * k {
            Some(Conv2d::new(
                &format!("conv.{name}.shortcut"),
                act1.out_channels(),
                planes * k,
                1,
                stride,
                false,
                params,
                rng,
                device,
            )?)
        } else {
            None
        };
        Ok(Self {
            bn1,
            act1,
            conv1,
            bn2,
            act2,
            conv2,
            shortcut,
        })
    }

    fn forward(&self, xs: &Tensor, mode: Mode) -> Result<Tensor> {
        let a1 = self.act1.forward(&self.bn1.forward(xs, mode)?)?;
        let residual = match &self.shortcut {
            Some(conv) => conv.forward(&a1)?,
            None => xs.clone(),
        };
        let h = self.conv1.forward(&a1)?;
        let h = self.act2.forward(&self.bn2.forward(&h, mode)?)?;
        let h = self.conv2.forward(&h)?;
        Ok((h + residual)?)
    }
}

#[derive(Debug)]
pub struct PreActResNet {
    stem: Conv2d,
    blocks: Vec<PreActBlock>,
    final_norm: BatchNorm,
    final_act: KpgActivation,
    output: Linear,
    params: ParamStore,
    mode: Mode,
}

impl PreActResNet {
    pub fn new(
        activation: ActivationKind,
        shape: DatasetShape,
        structure: &StructuralParams,
        rng: &mut SessionRng,
        device: &Device,
    ) -> Result<Self> {
        let mut params = ParamStore::new();
        let k = structure.k;
        let width = structure.resnet_width;
        let stem = Conv2d::new(
            "conv.stem",
            shape.channels,
            width * k,
            3,
            1,
            false,
            &mut params,
            rng,
            device,
        )?;

        let mut blocks = Vec::new();
        let mut channels = width * k;
        for (stage, (&depth, &stride)) in stage_depths(structure.resnet_version)
            .iter()
            .zip(STRIDES.iter())
            .enumerate()
        {
            let planes = width << stage;
            for b in 0..depth {
                let block = PreActBlock::new(
                    &format!("layer{}.{b}", stage + 1),
                    channels,
                    planes,
                    if b == 0 { stride } else { 1 },
                    activation,
                    structure,
                    &mut params,
                    rng,
                    device,
                )?;
                channels = planes * k;
                blocks.push(block);
            }
        }

        let final_norm = BatchNorm::new("norm.final", channels, &mut params, device)?;
        let final_act = KpgActivation::new(
            "mix.final",
            activation,
            channels,
            structure,
            &mut params,
            rng,
            device,
        )?;
        let output = Linear::new(
            "linear.out",
            final_act.out_channels(),
            shape.classes,
            &mut params,
            rng,
            device,
        )?;
        Ok(Self {
            stem,
            blocks,
            final_norm,
            final_act,
            output,
            params,
            mode: Mode::Train,
        })
    }
}

impl TrainableModel for PreActResNet {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = self.stem.forward(xs)?;
        for block in &self.blocks {
            xs = block.forward(&xs, self.mode)?;
        }
        let xs = self
            .final_act
            .forward(&self.final_norm.forward(&xs, self.mode)?)?;
        let pooled = xs.flatten_from(2)?.mean(2)?;
        self.output.forward(&pooled)
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
        let acts = self
            .blocks
            .iter()
            .flat_map(|b| [&b.act1, &b.act2])
            .chain(std::iter::once(&self.final_act));
        collect_mixing(acts)
    }
}

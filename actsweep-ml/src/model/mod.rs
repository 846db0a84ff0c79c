//! Trainable models and the parameter bookkeeping they share.

pub mod activation;
pub mod cnn;
pub mod factory;
pub mod init;
pub mod layers;
pub mod mlp;
pub mod norm;
pub mod resnet;

pub use activation::KpgActivation;
pub use factory::build;

use crate::error::{MlError, Result};
use actsweep_core::{TensorBlob, TensorMap};
use candle_core::{Device, Tensor, Var};
use std::collections::BTreeMap;

/// Whether layers use batch statistics and update running buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// How the optimizer treats a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParamRole {
    /// Linear and convolution weights and biases.
    Weights,
    /// Batch-norm scale and shift.
    Normalization,
    /// Learned mixing coefficients of combinact activations.
    Mixing,
    /// Non-trainable state such as running statistics.
    Buffer,
}

impl ParamRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Weights => "weights",
            Self::Normalization => "normalization",
            Self::Mixing => "mixing",
            Self::Buffer => "buffer",
        }
    }
}

/// Parameters that share an optimizer treatment.
#[derive(Debug, Clone)]
pub struct ParameterGroup {
    pub role: ParamRole,
    pub vars: Vec<(String, Var)>,
}

impl ParameterGroup {
    /// Weight decay applied to this group for a run-level decay of `base`.
    pub fn weight_decay(&self, base: f64) -> f64 {
        match self.role {
            ParamRole::Weights => base,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone)]
struct Param {
    var: Var,
    role: ParamRole,
}

/// Every tensor a model owns, by name.
///
/// Layers keep clones of the [`Var`]s they register, which share storage
/// with the entries here.
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    entries: BTreeMap<String, Param>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tensor` under `name` and return the live variable.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor, role: ParamRole) -> Result<Var> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(MlError::state(format!("parameter {name} registered twice")));
        }
        let var = Var::from_tensor(&tensor)?;
        self.entries.insert(
            name,
            Param {
                var: var.clone(),
                role,
            },
        );
        Ok(var)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Trainable parameters grouped by role, in name order within a group.
    pub fn groups(&self) -> Vec<ParameterGroup> {
        let mut groups: Vec<ParameterGroup> = Vec::new();
        for role in [ParamRole::Weights, ParamRole::Normalization, ParamRole::Mixing] {
            let vars: Vec<(String, Var)> = self
                .entries
                .iter()
                .filter(|(_, p)| p.role == role)
                .map(|(name, p)| (name.clone(), p.var.clone()))
                .collect();
            if !vars.is_empty() {
                groups.push(ParameterGroup { role, vars });
            }
        }
        groups
    }

    /// Count of trainable scalars.
    pub fn num_trainable(&self) -> usize {
        self.entries
            .values()
            .filter(|p| p.role != ParamRole::Buffer)
            .map(|p| p.var.elem_count())
            .sum()
    }

    /// Snapshot of every tensor, buffers included.
    pub fn state_dict(&self) -> Result<TensorMap> {
        self.entries
            .iter()
            .map(|(name, p)| Ok((name.clone(), tensor_to_blob(p.var.as_tensor())?)))
            .collect()
    }

    /// Overwrite every tensor from `state`, which must hold exactly the
    /// registered names with matching shapes.
    pub fn load_state_dict(&self, state: &TensorMap) -> Result<()> {
        if let Some(extra) = state.keys().find(|k| !self.entries.contains_key(*k)) {
            return Err(MlError::state(format!("unexpected tensor {extra} in model state")));
        }
        for (name, p) in &self.entries {
            let blob = state
                .get(name)
                .ok_or_else(|| MlError::state(format!("model state is missing {name}")))?;
            if blob.shape.as_slice() != p.var.dims() {
                return Err(MlError::state(format!(
                    "tensor {name} has shape {:?}, expected {:?}",
                    blob.shape,
                    p.var.dims()
                )));
            }
            let tensor = blob_to_tensor(blob, p.var.device())?;
            p.var.set(&tensor)?;
        }
        Ok(())
    }
}

pub fn tensor_to_blob(tensor: &Tensor) -> Result<TensorBlob> {
    let values = tensor.flatten_all()?.to_vec1::<f32>()?;
    Ok(TensorBlob::from_f32(tensor.dims().to_vec(), &values))
}

pub fn blob_to_tensor(blob: &TensorBlob, device: &Device) -> Result<Tensor> {
    let values = blob.to_f32().map_err(MlError::state)?;
    Ok(Tensor::from_vec(values, blob.shape.as_slice(), device)?)
}

/// A network the training session can drive.
pub trait TrainableModel {
    /// Logits of shape `(batch, classes)`.
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    fn mode(&self) -> Mode;

    fn set_mode(&mut self, mode: Mode);

    fn params(&self) -> &ParamStore;

    /// Mean softmax mixing weights of each learned-mixing activation layer.
    fn mixing_weights(&self) -> Result<Option<Vec<Vec<f64>>>> {
        Ok(None)
    }

    fn parameter_groups(&self) -> Vec<ParameterGroup> {
        self.params().groups()
    }

    fn num_parameters(&self) -> usize {
        self.params().num_trainable()
    }

    fn state_dict(&self) -> Result<TensorMap> {
        self.params().state_dict()
    }

    fn load_state_dict(&self, state: &TensorMap) -> Result<()> {
        self.params().load_state_dict(state)
    }
}

/// Collect mixing weights from a model's activation layers.
pub(crate) fn collect_mixing<'a>(
    acts: impl IntoIterator<Item = &'a KpgActivation>,
) -> Result<Option<Vec<Vec<f64>>>> {
    let mut layers = Vec::new();
    for act in acts {
        if let Some(weights) = act.mixing_weights()? {
            layers.push(weights);
        }
    }
    Ok(if layers.is_empty() { None } else { Some(layers) })
}

//! Architecture descriptors: model families, activations, datasets and the
//! structural parameters that shape a network.

use crate::error::{LabError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    #[serde(alias = "nn")]
    Mlp,
    Cnn,
    Resnet,
}

impl Architecture {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mlp => "mlp",
            Self::Cnn => "cnn",
            Self::Resnet => "resnet",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Activation applied after every hidden layer.
///
/// Multi-valued activations reduce `k` pre-activations into one output unit;
/// single-valued ones act elementwise and require `k = 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    Relu,
    Abs,
    Swish,
    LeakyRelu,
    Max,
    L1,
    L2,
    Combinact,
}

impl ActivationKind {
    pub const ALL: [ActivationKind; 8] = [
        Self::Relu,
        Self::Abs,
        Self::Swish,
        Self::LeakyRelu,
        Self::Max,
        Self::L1,
        Self::L2,
        Self::Combinact,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Relu => "relu",
            Self::Abs => "abs",
            Self::Swish => "swish",
            Self::LeakyRelu => "leaky_relu",
            Self::Max => "max",
            Self::L1 => "l1",
            Self::L2 => "l2",
            Self::Combinact => "combinact",
        }
    }

    pub fn is_single_valued(self) -> bool {
        matches!(self, Self::Relu | Self::Abs | Self::Swish | Self::LeakyRelu)
    }

    /// Whether the activation owns learned mixing coefficients.
    pub fn has_mixing_coefficients(self) -> bool {
        self == Self::Combinact
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Datasets with a known input/output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Mnist,
    FashionMnist,
    Cifar10,
    Cifar100,
    Svhn,
    Synthetic,
}

impl DatasetKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "mnist" => Ok(Self::Mnist),
            "fashion_mnist" => Ok(Self::FashionMnist),
            "cifar10" => Ok(Self::Cifar10),
            "cifar100" => Ok(Self::Cifar100),
            "svhn" => Ok(Self::Svhn),
            "synthetic" => Ok(Self::Synthetic),
            other => Err(LabError::UnsupportedDataset {
                name: other.to_string(),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mnist => "mnist",
            Self::FashionMnist => "fashion_mnist",
            Self::Cifar10 => "cifar10",
            Self::Cifar100 => "cifar100",
            Self::Svhn => "svhn",
            Self::Synthetic => "synthetic",
        }
    }

    pub fn shape(self) -> DatasetShape {
        match self {
            Self::Mnist | Self::FashionMnist => DatasetShape::new(1, 28, 10),
            Self::Cifar10 | Self::Svhn => DatasetShape::new(3, 32, 10),
            Self::Cifar100 => DatasetShape::new(3, 32, 100),
            Self::Synthetic => DatasetShape::new(1, 8, 4),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input channels, square spatial side and number of classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetShape {
    pub channels: usize,
    pub spatial: usize,
    pub classes: usize,
}

impl DatasetShape {
    pub fn new(channels: usize, spatial: usize, classes: usize) -> Self {
        Self {
            channels,
            spatial,
            classes,
        }
    }

    /// Width of one example once flattened for an MLP.
    pub fn flat_features(&self) -> usize {
        self.channels * self.spatial * self.spatial
    }
}

/// How the `p` permuted copies of a layer's pre-activations are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermutationMethod {
    #[default]
    Shuffle,
    Roll,
}

impl PermutationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shuffle => "shuffle",
            Self::Roll => "roll",
        }
    }
}

/// Shape-controlling parameters of a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralParams {
    /// Output units (MLP) or channels (CNN) per hidden layer.
    #[serde(default = "default_layers")]
    pub layers: Vec<usize>,
    /// Pre-activation values combined into one output unit.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Permuted copies of the pre-activations.
    #[serde(default = "default_one")]
    pub p: usize,
    /// Groups within which permutations act.
    #[serde(default = "default_one")]
    pub g: usize,
    #[serde(default)]
    pub permutation: PermutationMethod,
    #[serde(default = "default_resnet_version")]
    pub resnet_version: u32,
    #[serde(default = "default_resnet_width")]
    pub resnet_width: usize,
}

impl Default for StructuralParams {
    fn default() -> Self {
        Self {
            layers: default_layers(),
            k: default_k(),
            p: 1,
            g: 1,
            permutation: PermutationMethod::Shuffle,
            resnet_version: default_resnet_version(),
            resnet_width: default_resnet_width(),
        }
    }
}

fn default_layers() -> Vec<usize> {
    vec![250, 200]
}

fn default_k() -> usize {
    2
}

fn default_one() -> usize {
    1
}

fn default_resnet_version() -> u32 {
    18
}

fn default_resnet_width() -> usize {
    4
}

impl StructuralParams {
    /// Adjust user-supplied parameters to what the activation admits.
    ///
    /// Single-valued activations are forced to `k = 1`. Multi-valued
    /// activations on a ResNet get `ceil(k / 2)` extra base width.
    pub fn normalized_for(mut self, architecture: Architecture, activation: ActivationKind) -> Self {
        if activation.is_single_valued() {
            if self.k != 1 {
                tracing::warn!(
                    activation = %activation,
                    k = self.k,
                    "Single-valued activation, forcing k = 1"
                );
            }
            self.k = 1;
        } else if architecture == Architecture::Resnet {
            self.resnet_width += self.k.div_ceil(2);
        }
        self
    }

    /// Check the structural preconditions of building `architecture` with
    /// `activation`. Nothing is built when this fails.
    pub fn validate(&self, architecture: Architecture, activation: ActivationKind) -> Result<()> {
        let invalid = |reason: String| LabError::InvalidStructure {
            architecture: architecture.to_string(),
            activation: activation.to_string(),
            reason,
        };

        if self.k == 0 || self.p == 0 || self.g == 0 {
            return Err(invalid(format!(
                "k, p and g must be positive (k = {}, p = {}, g = {})",
                self.k, self.p, self.g
            )));
        }
        if activation.is_single_valued() && self.k != 1 {
            return Err(invalid(format!(
                "single-valued activation requires k = 1 (got k = {})",
                self.k
            )));
        }

        match architecture {
            Architecture::Mlp | Architecture::Cnn => {
                if self.layers.is_empty() {
                    return Err(invalid("at least one hidden layer is required".into()));
                }
                for (i, &width) in self.layers.iter().enumerate() {
                    if width == 0 {
                        return Err(invalid(format!("layer {i} has zero width")));
                    }
                    if (width * self.k) % self.g != 0 {
                        return Err(invalid(format!(
                            "layer {i}: {} pre-activations cannot be split into g = {} groups",
                            width * self.k,
                            self.g
                        )));
                    }
                }
            }
            Architecture::Resnet => {
                if !matches!(self.resnet_version, 18 | 34) {
                    return Err(invalid(format!(
                        "unsupported resnet version {} (expected 18 or 34)",
                        self.resnet_version
                    )));
                }
                if self.resnet_width == 0 {
                    return Err(invalid("resnet width must be positive".into()));
                }
                if (self.resnet_width * self.k) % self.g != 0 {
                    return Err(invalid(format!(
                        "{} base channels cannot be split into g = {} groups",
                        self.resnet_width * self.k,
                        self.g
                    )));
                }
            }
        }
        Ok(())
    }
}

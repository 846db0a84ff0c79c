//! Batch sources and dataset loading.
//!
//! Datasets are decoded on the host into a [`RawDataset`], split into a
//! training subset and a held-out validation tail, and then served as
//! tensors by an [`InMemorySource`].

pub mod cifar;
pub mod idx;
pub mod synthetic;

use crate::error::{MlError, Result};
use actsweep_core::{DatasetKind, DatasetShape, SessionRng};
use candle_core::{Device, Tensor};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use std::path::Path;

/// One mini-batch: `(B, C, H, W)` inputs and `(B,)` `u32` labels.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Tensor,
    pub labels: Tensor,
}

/// A restartable source of mini-batches.
pub trait BatchSource {
    /// Batches per pass.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn num_examples(&self) -> usize;

    /// A fresh pass. With a generator the example order is shuffled by it,
    /// otherwise examples come in storage order.
    fn batches<'a>(
        &'a self,
        rng: Option<&mut SessionRng>,
    ) -> Result<Box<dyn Iterator<Item = Result<Batch>> + 'a>>;
}

/// Decoded examples with normalised `f32` pixels in `C x H x W` order.
#[derive(Debug, Clone)]
pub struct RawDataset {
    pub shape: DatasetShape,
    pub pixels: Vec<f32>,
    pub labels: Vec<u32>,
}

impl RawDataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn example_len(&self) -> usize {
        self.shape.flat_features()
    }
}

/// Tensors held in memory, served in fixed-size batches.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    inputs: Tensor,
    labels: Tensor,
    batch_size: usize,
}

impl InMemorySource {
    pub fn new(inputs: Tensor, labels: Tensor, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(MlError::dataset("batch size must be positive"));
        }
        if inputs.dim(0)? != labels.dim(0)? {
            return Err(MlError::dataset(format!(
                "{} inputs but {} labels",
                inputs.dim(0)?,
                labels.dim(0)?
            )));
        }
        Ok(Self {
            inputs,
            labels,
            batch_size,
        })
    }

    /// Gather the examples at `indices` from `raw`.
    pub fn from_raw(raw: &RawDataset, indices: &[usize], batch_size: usize, device: &Device) -> Result<Self> {
        let width = raw.example_len();
        let mut pixels = Vec::with_capacity(indices.len() * width);
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            pixels.extend_from_slice(&raw.pixels[i * width..(i + 1) * width]);
            labels.push(raw.labels[i]);
        }
        let s = raw.shape;
        let inputs = Tensor::from_vec(pixels, (indices.len(), s.channels, s.spatial, s.spatial), device)?;
        let labels = Tensor::from_vec(labels, indices.len(), device)?;
        Self::new(inputs, labels, batch_size)
    }

    fn batch(&self, order: Option<&Tensor>, index: usize) -> Result<Batch> {
        let start = index * self.batch_size;
        let len = self.batch_size.min(self.num_examples() - start);
        Ok(match order {
            Some(order) => {
                let idx = order.narrow(0, start, len)?;
                Batch {
                    inputs: self.inputs.index_select(&idx, 0)?,
                    labels: self.labels.index_select(&idx, 0)?,
                }
            }
            None => Batch {
                inputs: self.inputs.narrow(0, start, len)?,
                labels: self.labels.narrow(0, start, len)?,
            },
        })
    }
}

impl BatchSource for InMemorySource {
    fn len(&self) -> usize {
        self.num_examples().div_ceil(self.batch_size)
    }

    fn num_examples(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }

    fn batches<'a>(
        &'a self,
        rng: Option<&mut SessionRng>,
    ) -> Result<Box<dyn Iterator<Item = Result<Batch>> + 'a>> {
        let order = match rng {
            Some(rng) => {
                let n = self.num_examples();
                let mut idx: Vec<u32> = (0..n as u32).collect();
                idx.shuffle(rng);
                Some(Tensor::from_vec(idx, n, self.inputs.device())?)
            }
            None => None,
        };
        Ok(Box::new(
            (0..self.len()).map(move |b| self.batch(order.as_ref(), b)),
        ))
    }
}

/// How a dataset is cut into training and validation sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitSpec {
    pub seed: u64,
    /// Training examples drawn from the non-validation part; all when unset.
    pub sample_size: Option<usize>,
    /// Held-out examples at the end of the training files.
    pub validation_size: usize,
    pub batch_size: usize,
}

impl SplitSpec {
    /// Training and validation indices into a dataset of `total` examples.
    ///
    /// The subset is drawn without replacement by a generator seeded with
    /// `seed + sample_size`, and returned in storage order.
    pub fn indices(&self, total: usize) -> Result<(Vec<usize>, Vec<usize>)> {
        if self.validation_size >= total {
            return Err(MlError::dataset(format!(
                "validation size {} leaves no training examples out of {total}",
                self.validation_size
            )));
        }
        let pool = total - self.validation_size;
        let validation: Vec<usize> = (pool..total).collect();
        let train = match self.sample_size {
            None => (0..pool).collect(),
            Some(size) if size > pool => {
                return Err(MlError::dataset(format!(
                    "sample size {size} exceeds the {pool} available training examples"
                )));
            }
            Some(size) => {
                let mut rng = SessionRng::seed_from_u64(self.seed.wrapping_add(size as u64));
                let mut picked = rand::seq::index::sample(&mut rng, pool, size).into_vec();
                picked.sort_unstable();
                picked
            }
        };
        Ok((train, validation))
    }
}

/// Decode the training files of `kind` below `data_dir`.
pub fn load_raw(kind: DatasetKind, data_dir: &Path, split: &SplitSpec) -> Result<RawDataset> {
    let raw = match kind {
        DatasetKind::Mnist | DatasetKind::FashionMnist => idx::load(kind, &data_dir.join(kind.as_str()))?,
        DatasetKind::Cifar10 | DatasetKind::Cifar100 | DatasetKind::Svhn => {
            cifar::load(kind, &data_dir.join(kind.as_str()))?
        }
        DatasetKind::Synthetic => {
            let count = split.sample_size.unwrap_or(synthetic::DEFAULT_TRAIN_EXAMPLES) + split.validation_size;
            synthetic::generate(count)
        }
    };
    tracing::info!(dataset = %kind, examples = raw.len(), "Dataset loaded");
    Ok(raw)
}

/// Load `kind` and cut it into `(train, validation)` sources.
pub fn load_splits(
    kind: DatasetKind,
    data_dir: &Path,
    split: &SplitSpec,
    device: &Device,
) -> Result<(InMemorySource, InMemorySource)> {
    let raw = load_raw(kind, data_dir, split)?;
    let (train, validation) = split.indices(raw.len())?;
    tracing::debug!(
        train = train.len(),
        validation = validation.len(),
        "Dataset split"
    );
    Ok((
        InMemorySource::from_raw(&raw, &train, split.batch_size, device)?,
        InMemorySource::from_raw(&raw, &validation, split.batch_size, device)?,
    ))
}

//! Checkpoint store for resumable runs.
//!
//! A checkpoint file is a JSON envelope holding a list of tagged sections
//! (metadata, progress, model, optimizer, scheduler). Sections are
//! (de)serialized independently and unknown tags are skipped, so newer
//! writers can add sections without breaking older readers. Tensors are
//! stored as base64 of little-endian `f32`, which round-trips bit-exactly.

use crate::arch::{ActivationKind, Architecture, DatasetKind, StructuralParams};
use crate::error::{LabError, Result};
use crate::hyperparams::HyperparameterRecord;
use crate::persistence::{self, RetryPolicy};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CHECKPOINT_FORMAT: &str = "actsweep-checkpoint";
pub const CHECKPOINT_VERSION: u32 = 1;

/// A dense `f32` tensor in serialized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorBlob {
    pub shape: Vec<usize>,
    /// Base64 of the little-endian `f32` values, row-major.
    pub data: String,
}

impl TensorBlob {
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            shape,
            data: STANDARD.encode(bytes),
        }
    }

    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Decode the values, checking they agree with `shape`.
    pub fn to_f32(&self) -> std::result::Result<Vec<f32>, String> {
        let bytes = STANDARD
            .decode(&self.data)
            .map_err(|e| format!("invalid base64 payload: {e}"))?;
        if bytes.len() != self.elem_count() * 4 {
            return Err(format!(
                "payload holds {} bytes but shape {:?} needs {}",
                bytes.len(),
                self.shape,
                self.elem_count() * 4
            ));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

/// Named tensors, ordered by name.
pub type TensorMap = BTreeMap<String, TensorBlob>;

/// Serializable optimizer internals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: String,
    pub step: u64,
    pub learning_rate: f64,
    /// Per-parameter slots such as `m.<param>` and `v.<param>`.
    pub slots: TensorMap,
}

/// Serializable scheduler internals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub kind: String,
    pub steps: u64,
    pub learning_rate: f64,
}

/// The resumable snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// The next epoch to execute.
    pub epoch: u32,
    pub best_val_acc: f64,
    pub model: TensorMap,
    pub optimizer: OptimizerState,
    pub scheduler: SchedulerState,
}

/// Identifies the run a checkpoint belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub seed: u64,
    pub dataset: DatasetKind,
    pub architecture: Architecture,
    pub activation: ActivationKind,
    pub structure: StructuralParams,
    pub sample_size: usize,
    pub batch_size: usize,
    /// Epoch budget the schedule was built for.
    pub epochs: u32,
    pub num_params: usize,
    pub hyperparams: HyperparameterRecord,
}

impl RunMetadata {
    /// A fresh identifier for a run that is not resuming.
    pub fn new_run_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Explain why a checkpoint written under `self` cannot resume `expected`.
    pub fn mismatch(&self, expected: &RunMetadata) -> Option<String> {
        if self.seed != expected.seed {
            return Some(format!("seed {} != {}", self.seed, expected.seed));
        }
        if self.dataset != expected.dataset {
            return Some(format!("dataset {} != {}", self.dataset, expected.dataset));
        }
        if self.architecture != expected.architecture {
            return Some(format!(
                "architecture {} != {}",
                self.architecture, expected.architecture
            ));
        }
        if self.activation != expected.activation {
            return Some(format!(
                "activation {} != {}",
                self.activation, expected.activation
            ));
        }
        if self.structure != expected.structure {
            return Some(format!(
                "structure {:?} != {:?}",
                self.structure, expected.structure
            ));
        }
        if self.sample_size != expected.sample_size {
            return Some(format!(
                "sample size {} != {}",
                self.sample_size, expected.sample_size
            ));
        }
        if self.batch_size != expected.batch_size {
            return Some(format!(
                "batch size {} != {}",
                self.batch_size, expected.batch_size
            ));
        }
        if self.epochs != expected.epochs {
            return Some(format!("epochs {} != {}", self.epochs, expected.epochs));
        }
        if self.hyperparams != expected.hyperparams {
            return Some(format!(
                "hyperparams {:?} != {:?}",
                self.hyperparams, expected.hyperparams
            ));
        }
        None
    }
}

/// Resume progress stored alongside the tensors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub epoch: u32,
    pub best_val_acc: f64,
}

/// One independently (de)serializable part of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "section", rename_all = "snake_case")]
pub enum Section {
    Metadata(RunMetadata),
    Progress(Progress),
    Model { tensors: TensorMap },
    Optimizer(OptimizerState),
    Scheduler(SchedulerState),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format: String,
    version: u32,
    checksum: String,
    sections: serde_json::Value,
}

fn checksum(sections: &serde_json::Value) -> Result<String> {
    let bytes = serde_json::to_vec(sections)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Reads and writes checkpoint files.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointStore {
    retry: RetryPolicy,
}

impl CheckpointStore {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    /// Serialize `state` and `metadata` and atomically replace `path`.
    pub fn save(&self, path: &Path, state: &RunState, metadata: &RunMetadata) -> Result<()> {
        let sections = vec![
            Section::Metadata(metadata.clone()),
            Section::Progress(Progress {
                epoch: state.epoch,
                best_val_acc: state.best_val_acc,
            }),
            Section::Model {
                tensors: state.model.clone(),
            },
            Section::Optimizer(state.optimizer.clone()),
            Section::Scheduler(state.scheduler.clone()),
        ];
        let sections = serde_json::to_value(&sections)?;
        let envelope = Envelope {
            format: CHECKPOINT_FORMAT.to_string(),
            version: CHECKPOINT_VERSION,
            checksum: checksum(&sections)?,
            sections,
        };
        let bytes = serde_json::to_vec(&envelope)?;
        persistence::atomic_write_with_retry(path, &bytes, self.retry)?;
        tracing::debug!(
            path = %path.display(),
            epoch = state.epoch,
            bytes = bytes.len(),
            "Checkpoint written"
        );
        Ok(())
    }

    /// Load a checkpoint, verifying format, checksum and completeness.
    pub fn load(&self, path: &Path) -> Result<(RunState, RunMetadata)> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LabError::NotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let corrupt = |reason: String| LabError::corrupt(path, reason);

        let envelope: Envelope =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(format!("unreadable: {e}")))?;
        if envelope.format != CHECKPOINT_FORMAT {
            return Err(corrupt(format!("unexpected format '{}'", envelope.format)));
        }
        if envelope.version > CHECKPOINT_VERSION {
            return Err(corrupt(format!(
                "written by format version {}, this build reads up to {}",
                envelope.version, CHECKPOINT_VERSION
            )));
        }
        if checksum(&envelope.sections)? != envelope.checksum {
            return Err(corrupt("checksum mismatch".into()));
        }
        let sections: Vec<Section> = serde_json::from_value(envelope.sections)
            .map_err(|e| corrupt(format!("bad section: {e}")))?;

        let mut metadata = None;
        let mut progress = None;
        let mut model = None;
        let mut optimizer = None;
        let mut scheduler = None;
        for section in sections {
            match section {
                Section::Metadata(m) => metadata = Some(m),
                Section::Progress(p) => progress = Some(p),
                Section::Model { tensors } => model = Some(tensors),
                Section::Optimizer(o) => optimizer = Some(o),
                Section::Scheduler(s) => scheduler = Some(s),
                Section::Unknown => tracing::debug!(
                    path = %path.display(),
                    "Skipping unknown checkpoint section"
                ),
            }
        }
        let missing = |name: &str| corrupt(format!("missing {name} section"));
        let metadata = metadata.ok_or_else(|| missing("metadata"))?;
        let progress = progress.ok_or_else(|| missing("progress"))?;
        let state = RunState {
            epoch: progress.epoch,
            best_val_acc: progress.best_val_acc,
            model: model.ok_or_else(|| missing("model"))?,
            optimizer: optimizer.ok_or_else(|| missing("optimizer"))?,
            scheduler: scheduler.ok_or_else(|| missing("scheduler"))?,
        };
        Ok((state, metadata))
    }
}

/// The three checkpoint destinations of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSet {
    /// Rewritten at the start of every epoch.
    pub mid: PathBuf,
    /// Rewritten at the end of every epoch (the `_final` file).
    pub last: PathBuf,
    /// Rewritten only on strict validation-accuracy improvement.
    pub best: PathBuf,
}

impl CheckpointSet {
    pub fn in_dir(dir: &Path, run_name: &str) -> Self {
        Self {
            mid: dir.join(format!("{run_name}_mid.ckpt")),
            last: dir.join(format!("{run_name}_final.ckpt")),
            best: dir.join(format!("{run_name}_best.ckpt")),
        }
    }

    /// The checkpoint to resume from: the end-of-epoch one if present,
    /// otherwise the start-of-epoch one.
    pub fn resume_candidate(&self) -> Option<&Path> {
        [&self.last, &self.mid]
            .into_iter()
            .find(|p| p.exists())
            .map(PathBuf::as_path)
    }

    pub fn paths(&self) -> [&Path; 3] {
        [
            self.mid.as_path(),
            self.last.as_path(),
            self.best.as_path(),
        ]
    }
}

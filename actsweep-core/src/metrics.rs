//! Per-epoch metrics and the append-only CSV log they are written to.

use crate::arch::{ActivationKind, Architecture, DatasetKind, PermutationMethod};
use crate::error::{LabError, Result};
use crate::hyperparams::HyperparameterRecord;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Everything recorded about one completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub dataset: DatasetKind,
    pub seed: u64,
    pub epoch: u32,
    /// Wall time from epoch start to the end of evaluation.
    pub time_secs: f64,
    pub model: Architecture,
    pub activation: ActivationKind,
    pub sample_size: usize,
    pub batch_size: usize,
    pub num_params: usize,
    pub k: usize,
    pub p: usize,
    pub g: usize,
    pub permutation: PermutationMethod,
    pub resnet_version: u32,
    pub resnet_width: usize,
    pub hp_key: String,
    pub hyperparams: HyperparameterRecord,
    pub train_loss: f64,
    pub val_loss: f64,
    pub train_acc: f64,
    pub val_acc: f64,
    pub gen_gap: f64,
    /// Learning rate in effect when the epoch's training pass ended.
    pub lr: f64,
    /// Per-layer softmax mixing weights of learned-mixing activations.
    pub mixing_weights: Option<Vec<Vec<f64>>>,
}

impl EpochRecord {
    /// Equality on everything except wall time.
    pub fn same_outcome(&self, other: &EpochRecord) -> bool {
        let mut a = self.clone();
        a.time_secs = other.time_secs;
        a == *other
    }
}

/// Flat CSV shape of an [`EpochRecord`]; nested values are JSON text.
#[derive(Debug, Serialize, Deserialize)]
struct EpochRow {
    dataset: DatasetKind,
    seed: u64,
    epoch: u32,
    time: f64,
    model: Architecture,
    actfun: ActivationKind,
    sample_size: usize,
    batch_size: usize,
    num_params: usize,
    k: usize,
    p: usize,
    g: usize,
    perm_method: PermutationMethod,
    resnet_ver: u32,
    resnet_width: usize,
    hp_key: String,
    hyper_params: String,
    train_loss: f64,
    val_loss: f64,
    train_acc: f64,
    val_acc: f64,
    gen_gap: f64,
    curr_lr: f64,
    alphas: String,
}

/// Column names, in row order.
pub const HEADER: [&str; 24] = [
    "dataset",
    "seed",
    "epoch",
    "time",
    "model",
    "actfun",
    "sample_size",
    "batch_size",
    "num_params",
    "k",
    "p",
    "g",
    "perm_method",
    "resnet_ver",
    "resnet_width",
    "hp_key",
    "hyper_params",
    "train_loss",
    "val_loss",
    "train_acc",
    "val_acc",
    "gen_gap",
    "curr_lr",
    "alphas",
];

impl EpochRow {
    fn from_record(r: &EpochRecord) -> Result<Self> {
        Ok(Self {
            dataset: r.dataset,
            seed: r.seed,
            epoch: r.epoch,
            time: r.time_secs,
            model: r.model,
            actfun: r.activation,
            sample_size: r.sample_size,
            batch_size: r.batch_size,
            num_params: r.num_params,
            k: r.k,
            p: r.p,
            g: r.g,
            perm_method: r.permutation,
            resnet_ver: r.resnet_version,
            resnet_width: r.resnet_width,
            hp_key: r.hp_key.clone(),
            hyper_params: serde_json::to_string(&r.hyperparams)?,
            train_loss: r.train_loss,
            val_loss: r.val_loss,
            train_acc: r.train_acc,
            val_acc: r.val_acc,
            gen_gap: r.gen_gap,
            curr_lr: r.lr,
            alphas: serde_json::to_string(&r.mixing_weights)?,
        })
    }

    fn into_record(self) -> Result<EpochRecord> {
        Ok(EpochRecord {
            dataset: self.dataset,
            seed: self.seed,
            epoch: self.epoch,
            time_secs: self.time,
            model: self.model,
            activation: self.actfun,
            sample_size: self.sample_size,
            batch_size: self.batch_size,
            num_params: self.num_params,
            k: self.k,
            p: self.p,
            g: self.g,
            permutation: self.perm_method,
            resnet_version: self.resnet_ver,
            resnet_width: self.resnet_width,
            hp_key: self.hp_key,
            hyperparams: serde_json::from_str(&self.hyper_params)?,
            train_loss: self.train_loss,
            val_loss: self.val_loss,
            train_acc: self.train_acc,
            val_acc: self.val_acc,
            gen_gap: self.gen_gap,
            lr: self.curr_lr,
            mixing_weights: serde_json::from_str(&self.alphas)?,
        })
    }
}

/// Append-only CSV log with one row per epoch.
pub struct MetricsLogger {
    path: PathBuf,
    writer: csv::Writer<File>,
    last_epoch: Option<u32>,
}

impl MetricsLogger {
    /// Start a fresh log at `path`, writing the header.
    ///
    /// A non-empty existing file is only replaced when `overwrite` is set.
    pub fn create(path: &Path, overwrite: bool) -> Result<Self> {
        if !overwrite && path.metadata().is_ok_and(|m| m.len() > 0) {
            return Err(LabError::config(format!(
                "metrics log {} already exists; resume the run or enable overwrite",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(file);
        writer.write_record(HEADER)?;
        writer.flush()?;
        tracing::debug!(path = %path.display(), "Metrics log created");
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            last_epoch: None,
        })
    }

    /// Reopen the log of a resumed run.
    ///
    /// Rows already present are kept; later appends for those epochs are
    /// skipped so a re-executed epoch never produces a duplicate row. A
    /// partially written last row is cut off first.
    pub fn open_append(path: &Path) -> Result<Self> {
        if !path.metadata().is_ok_and(|m| m.len() > 0) {
            return Self::create(path, true);
        }
        if Self::drop_torn_row(path)? == 0 {
            return Self::create(path, true);
        }
        let existing = Self::read_records(path)?;
        let last_epoch = existing.iter().map(|r| r.epoch).max();
        let file = OpenOptions::new().append(true).open(path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(file);
        tracing::debug!(
            path = %path.display(),
            rows = existing.len(),
            ?last_epoch,
            "Metrics log reopened"
        );
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            last_epoch,
        })
    }

    /// Truncate `path` after its last newline. Returns the length kept.
    fn drop_torn_row(path: &Path) -> Result<u64> {
        let bytes = std::fs::read(path)?;
        if bytes.last() == Some(&b'\n') {
            return Ok(bytes.len() as u64);
        }
        let keep = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
        tracing::warn!(
            path = %path.display(),
            dropped_bytes = bytes.len() - keep,
            "Dropping torn trailing row from metrics log"
        );
        OpenOptions::new()
            .write(true)
            .open(path)?
            .set_len(keep as u64)?;
        Ok(keep as u64)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_epoch(&self) -> Option<u32> {
        self.last_epoch
    }

    /// Append one row and flush it. Returns `false` when the epoch is
    /// already in the log.
    pub fn append(&mut self, record: &EpochRecord) -> Result<bool> {
        if self.last_epoch.is_some_and(|last| record.epoch <= last) {
            tracing::warn!(
                epoch = record.epoch,
                path = %self.path.display(),
                "Epoch already logged, skipping row"
            );
            return Ok(false);
        }
        self.writer.serialize(EpochRow::from_record(record)?)?;
        self.writer.flush()?;
        self.last_epoch = Some(record.epoch);
        Ok(true)
    }

    /// Parse a log back into typed records.
    pub fn read_records(path: &Path) -> Result<Vec<EpochRecord>> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        if headers.iter().ne(HEADER.iter().copied()) {
            return Err(LabError::config(format!(
                "{} is not an actsweep metrics log (unexpected header)",
                path.display()
            )));
        }
        let mut records = Vec::new();
        for row in reader.deserialize::<EpochRow>() {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn record(epoch: u32) -> EpochRecord {
        EpochRecord {
            dataset: DatasetKind::Mnist,
            seed: 3,
            epoch,
            time_secs: 1.25,
            model: Architecture::Mlp,
            activation: ActivationKind::Combinact,
            sample_size: 50_000,
            batch_size: 100,
            num_params: 12_345,
            k: 2,
            p: 1,
            g: 1,
            permutation: PermutationMethod::Shuffle,
            resnet_version: 0,
            resnet_width: 0,
            hp_key: "combinact".into(),
            hyperparams: HyperparameterRecord::new(0.07, 0.0006, 4e-8, 5e-6, 0.0054, 0.466)
                .unwrap(),
            train_loss: 0.31,
            val_loss: 0.35,
            train_acc: 0.91,
            val_acc: 0.9,
            gen_gap: 0.04,
            lr: 1e-3,
            mixing_weights: Some(vec![vec![0.2, 0.3, 0.5]]),
        }
    }

    #[test]
    fn test_header_matches_row_fields() {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .serialize(EpochRow::from_record(&record(1)).unwrap())
            .unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(header, HEADER.join(","));
    }

    #[test]
    fn test_three_epochs_make_four_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.csv");
        let mut logger = MetricsLogger::create(&path, false).unwrap();
        for epoch in 1..=3 {
            assert!(logger.append(&record(epoch)).unwrap());
        }
        drop(logger);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert!(text.ends_with('\n'));

        let parsed = MetricsLogger::read_records(&path).unwrap();
        assert_eq!(parsed, vec![record(1), record(2), record(3)]);
    }

    #[test]
    fn test_create_refuses_to_clobber() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.csv");
        let mut logger = MetricsLogger::create(&path, false).unwrap();
        logger.append(&record(1)).unwrap();
        drop(logger);

        assert!(matches!(
            MetricsLogger::create(&path, false),
            Err(LabError::Config(_))
        ));
        assert!(MetricsLogger::create(&path, true).is_ok());
    }

    #[test]
    fn test_reopen_skips_logged_epochs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.csv");
        let mut logger = MetricsLogger::create(&path, false).unwrap();
        logger.append(&record(1)).unwrap();
        logger.append(&record(2)).unwrap();
        drop(logger);

        let mut logger = MetricsLogger::open_append(&path).unwrap();
        assert_eq!(logger.last_epoch(), Some(2));
        assert!(!logger.append(&record(2)).unwrap());
        assert!(logger.append(&record(3)).unwrap());
        drop(logger);

        let epochs: Vec<u32> = MetricsLogger::read_records(&path)
            .unwrap()
            .iter()
            .map(|r| r.epoch)
            .collect();
        assert_eq!(epochs, vec![1, 2, 3]);
    }

    #[test]
    fn test_reopen_drops_torn_last_row() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.csv");
        let mut logger = MetricsLogger::create(&path, false).unwrap();
        logger.append(&record(1)).unwrap();
        logger.append(&record(2)).unwrap();
        drop(logger);

        // A crash mid-append leaves epoch 2's row without its tail.
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 20]).unwrap();
        assert!(MetricsLogger::read_records(&path).is_err());

        let mut logger = MetricsLogger::open_append(&path).unwrap();
        assert_eq!(logger.last_epoch(), Some(1));
        assert!(logger.append(&record(2)).unwrap());
        drop(logger);

        let parsed = MetricsLogger::read_records(&path).unwrap();
        assert_eq!(parsed, vec![record(1), record(2)]);
    }

    #[test]
    fn test_reopen_with_torn_header_starts_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.csv");
        std::fs::write(&path, "dataset,seed,ep").unwrap();

        let logger = MetricsLogger::open_append(&path).unwrap();
        assert_eq!(logger.last_epoch(), None);
        drop(logger);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, format!("{}\n", HEADER.join(",")));
    }

    #[test]
    fn test_open_append_on_missing_file_writes_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("run.csv");
        let logger = MetricsLogger::open_append(&path).unwrap();
        assert_eq!(logger.last_epoch(), None);
        drop(logger);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, format!("{}\n", HEADER.join(",")));
    }

    #[test]
    fn test_same_outcome_ignores_time() {
        let a = record(1);
        let mut b = record(1);
        b.time_secs = 99.0;
        assert!(a.same_outcome(&b));
        b.val_acc = 0.1;
        assert!(!a.same_outcome(&b));
    }
}

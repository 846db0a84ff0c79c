//! CIFAR-style binary batches.
//!
//! Each record is the label byte(s) followed by 3072 pixel bytes in
//! channel-major order. CIFAR-100 records carry a coarse and a fine label;
//! the fine one is used. SVHN is read from the same layout after
//! conversion to `train.bin`.

use super::RawDataset;
use crate::error::{MlError, Result};
use actsweep_core::DatasetKind;
use std::path::{Path, PathBuf};

struct Layout {
    files: Vec<PathBuf>,
    label_bytes: usize,
    mean: [f32; 3],
    std: [f32; 3],
}

fn layout(kind: DatasetKind, dir: &Path) -> Result<Layout> {
    Ok(match kind {
        DatasetKind::Cifar10 => Layout {
            files: (1..=5)
                .map(|i| dir.join(format!("data_batch_{i}.bin")))
                .collect(),
            label_bytes: 1,
            mean: [0.4914, 0.4822, 0.4465],
            std: [0.2470, 0.2435, 0.2616],
        },
        DatasetKind::Cifar100 => Layout {
            files: vec![dir.join("train.bin")],
            label_bytes: 2,
            mean: [0.5071, 0.4865, 0.4409],
            std: [0.2673, 0.2564, 0.2762],
        },
        DatasetKind::Svhn => Layout {
            files: vec![dir.join("train.bin")],
            label_bytes: 1,
            mean: [0.4377, 0.4438, 0.4728],
            std: [0.1980, 0.2010, 0.1970],
        },
        other => {
            return Err(MlError::dataset(format!(
                "{other} is not stored as binary batches"
            )));
        }
    })
}

/// Decode records from one binary batch into `raw`.
fn decode_into(bytes: &[u8], layout: &Layout, raw: &mut RawDataset) -> Result<()> {
    let pixels = raw.example_len();
    let record = layout.label_bytes + pixels;
    if bytes.len() % record != 0 {
        return Err(MlError::dataset(format!(
            "binary batch of {} bytes is not a whole number of {record}-byte records",
            bytes.len()
        )));
    }
    let plane = pixels / 3;
    for chunk in bytes.chunks_exact(record) {
        let label = chunk[layout.label_bytes - 1];
        if u32::from(label) as usize >= raw.shape.classes {
            return Err(MlError::dataset(format!("label {label} out of range")));
        }
        raw.labels.push(u32::from(label));
        for (i, &p) in chunk[layout.label_bytes..].iter().enumerate() {
            let c = i / plane;
            raw.pixels
                .push((f32::from(p) / 255.0 - layout.mean[c]) / layout.std[c]);
        }
    }
    Ok(())
}

pub fn load(kind: DatasetKind, dir: &Path) -> Result<RawDataset> {
    let layout = layout(kind, dir)?;
    let mut raw = RawDataset {
        shape: kind.shape(),
        pixels: Vec::new(),
        labels: Vec::new(),
    };
    for file in &layout.files {
        let bytes = std::fs::read(file).map_err(|e| {
            MlError::dataset(format!("cannot read {}: {e}", file.display()))
        })?;
        decode_into(&bytes, &layout, &mut raw)?;
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cifar100_uses_fine_label() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut bytes = vec![3u8, 42u8];
        bytes.extend(std::iter::repeat_n(0u8, 3072));
        std::fs::write(dir.path().join("train.bin"), &bytes).unwrap();

        let raw = load(DatasetKind::Cifar100, dir.path()).unwrap();
        assert_eq!(raw.labels, vec![42]);
        assert_eq!(raw.pixels.len(), 3072);
        assert!((raw.pixels[0] + 0.5071 / 0.2673).abs() < 1e-5);
        assert!((raw.pixels[2048] + 0.4409 / 0.2762).abs() < 1e-5);
    }

    #[test]
    fn test_partial_record_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("train.bin"), vec![1u8; 100]).unwrap();
        assert!(load(DatasetKind::Svhn, dir.path()).is_err());
    }

    #[test]
    fn test_missing_batches_are_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = load(DatasetKind::Cifar10, dir.path()).unwrap_err();
        assert!(err.to_string().contains("data_batch_1.bin"));
    }
}

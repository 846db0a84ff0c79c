//! MNIST-family IDX files (uncompressed).
//!
//! Expects `train-images-idx3-ubyte` and `train-labels-idx1-ubyte` in the
//! dataset directory.

use super::RawDataset;
use crate::error::{MlError, Result};
use actsweep_core::DatasetKind;
use std::path::Path;

const IMAGES_MAGIC: u32 = 0x0000_0803;
const LABELS_MAGIC: u32 = 0x0000_0801;

/// Mean and standard deviation of the raw `[0, 1]` pixels.
fn normalization(kind: DatasetKind) -> (f32, f32) {
    match kind {
        DatasetKind::FashionMnist => (0.2860, 0.3530),
        _ => (0.1307, 0.3081),
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| MlError::dataset("truncated IDX header"))
}

/// Parse an IDX image file into `(count, rows, cols, pixels)`.
pub fn parse_images(bytes: &[u8]) -> Result<(usize, usize, usize, &[u8])> {
    if read_u32(bytes, 0)? != IMAGES_MAGIC {
        return Err(MlError::dataset("not an IDX image file"));
    }
    let count = read_u32(bytes, 4)? as usize;
    let rows = read_u32(bytes, 8)? as usize;
    let cols = read_u32(bytes, 12)? as usize;
    let body = &bytes[16..];
    if body.len() != count * rows * cols {
        return Err(MlError::dataset(format!(
            "IDX image file holds {} bytes, header promises {}",
            body.len(),
            count * rows * cols
        )));
    }
    Ok((count, rows, cols, body))
}

/// Parse an IDX label file.
pub fn parse_labels(bytes: &[u8]) -> Result<&[u8]> {
    if read_u32(bytes, 0)? != LABELS_MAGIC {
        return Err(MlError::dataset("not an IDX label file"));
    }
    let count = read_u32(bytes, 4)? as usize;
    let body = &bytes[8..];
    if body.len() != count {
        return Err(MlError::dataset(format!(
            "IDX label file holds {} labels, header promises {count}",
            body.len()
        )));
    }
    Ok(body)
}

pub fn load(kind: DatasetKind, dir: &Path) -> Result<RawDataset> {
    let shape = kind.shape();
    let images = std::fs::read(dir.join("train-images-idx3-ubyte"))?;
    let labels = std::fs::read(dir.join("train-labels-idx1-ubyte"))?;
    let (count, rows, cols, pixels) = parse_images(&images)?;
    let labels = parse_labels(&labels)?;
    if rows != shape.spatial || cols != shape.spatial || labels.len() != count {
        return Err(MlError::dataset(format!(
            "{} files in {} do not match the expected {}x{} layout",
            kind,
            dir.display(),
            shape.spatial,
            shape.spatial
        )));
    }
    let (mean, std) = normalization(kind);
    Ok(RawDataset {
        shape,
        pixels: pixels
            .iter()
            .map(|&p| (f32::from(p) / 255.0 - mean) / std)
            .collect(),
        labels: labels.iter().map(|&l| u32::from(l)).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_file(count: u32, side: u32) -> Vec<u8> {
        let mut bytes = IMAGES_MAGIC.to_be_bytes().to_vec();
        for v in [count, side, side] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        bytes.extend(std::iter::repeat_n(255u8, (count * side * side) as usize));
        bytes
    }

    #[test]
    fn test_parse_round_trip() {
        let bytes = image_file(2, 3);
        let (count, rows, cols, body) = parse_images(&bytes).unwrap();
        assert_eq!((count, rows, cols, body.len()), (2, 3, 3, 18));

        let mut labels = LABELS_MAGIC.to_be_bytes().to_vec();
        labels.extend_from_slice(&2u32.to_be_bytes());
        labels.extend_from_slice(&[7, 1]);
        assert_eq!(parse_labels(&labels).unwrap(), &[7, 1]);
    }

    #[test]
    fn test_rejects_bad_files() {
        let mut bytes = image_file(2, 3);
        bytes.pop();
        assert!(parse_images(&bytes).is_err());
        assert!(parse_labels(&image_file(1, 1)).is_err());
        assert!(parse_images(&[0, 0]).is_err());
    }

    #[test]
    fn test_load_normalises() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("train-images-idx3-ubyte"), image_file(1, 28)).unwrap();
        let mut labels = LABELS_MAGIC.to_be_bytes().to_vec();
        labels.extend_from_slice(&1u32.to_be_bytes());
        labels.push(4);
        std::fs::write(dir.path().join("train-labels-idx1-ubyte"), labels).unwrap();

        let raw = load(DatasetKind::Mnist, dir.path()).unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw.labels, vec![4]);
        assert!((raw.pixels[0] - (1.0 - 0.1307) / 0.3081).abs() < 1e-5);
    }
}

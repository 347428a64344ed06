//! CIFAR-10 binary format loader
//!
//! Each record is one label byte followed by 3072 pixel bytes: the 1024 red
//! values, then green, then blue, each plane row-major. That is already the
//! CHW layout the batchers expect.

use std::fs;
use std::path::Path;

use freematch_core::{Error, Result};
use tracing::info;

use crate::dataset::ImageItem;

/// CIFAR-10 class names
pub const CLASS_NAMES: [&str; 10] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

pub const IMAGE_SIZE: usize = 32;
const PIXELS_PER_IMAGE: usize = 3 * IMAGE_SIZE * IMAGE_SIZE;
const RECORD_SIZE: usize = 1 + PIXELS_PER_IMAGE;

const TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const TEST_FILE: &str = "test_batch.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cifar10Split {
    Train,
    Test,
}

/// Load one split from the `cifar-10-batches-bin` directory
pub fn load_cifar10(dir: &Path, split: Cifar10Split) -> Result<Vec<ImageItem>> {
    let files: Vec<&str> = match split {
        Cifar10Split::Train => TRAIN_FILES.to_vec(),
        Cifar10Split::Test => vec![TEST_FILE],
    };

    let mut items = Vec::new();
    for name in files {
        let path = dir.join(name);
        if !path.exists() {
            return Err(Error::Dataset(format!(
                "CIFAR-10 batch not found: {}",
                path.display()
            )));
        }
        let bytes = fs::read(&path)?;
        items.extend(parse_batch(&bytes)?);
    }

    info!("Loaded {} CIFAR-10 {:?} images from {}", items.len(), split, dir.display());
    Ok(items)
}

/// Decode a buffer of concatenated records
pub fn parse_batch(bytes: &[u8]) -> Result<Vec<ImageItem>> {
    if bytes.len() % RECORD_SIZE != 0 {
        return Err(Error::Dataset(format!(
            "CIFAR-10 batch size {} is not a multiple of the record size {}",
            bytes.len(),
            RECORD_SIZE
        )));
    }

    bytes
        .chunks_exact(RECORD_SIZE)
        .map(|record| {
            let label = record[0] as usize;
            if label >= CLASS_NAMES.len() {
                return Err(Error::Dataset(format!("Invalid CIFAR-10 label {label}")));
            }
            let pixels = record[1..].iter().map(|&b| b as f32 / 255.0).collect();
            Ok(ImageItem { pixels, label })
        })
        .collect()
}

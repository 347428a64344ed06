//! In-memory image datasets and labeled subset selection.

use burn::data::dataset::Dataset;
use freematch_core::{Error, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A decoded image with its class label
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageItem {
    /// CHW pixels in [0, 1]
    pub pixels: Vec<f32>,
    pub label: usize,
}

/// Images held in memory, indexable through Burn's `Dataset` trait
#[derive(Clone, Debug, Default)]
pub struct ImageDataset {
    items: Vec<ImageItem>,
}

impl ImageDataset {
    pub fn new(items: Vec<ImageItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[ImageItem] {
        &self.items
    }

    /// Number of samples per class
    pub fn class_counts(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0; num_classes];
        for item in &self.items {
            if item.label < num_classes {
                counts[item.label] += 1;
            }
        }
        counts
    }
}

impl Dataset<ImageItem> for ImageDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Pick `num_labels / num_classes` random samples of every class.
pub fn split_labeled<R: Rng>(
    items: &[ImageItem],
    num_labels: usize,
    num_classes: usize,
    rng: &mut R,
) -> Result<Vec<ImageItem>> {
    if num_classes == 0 || num_labels < num_classes {
        return Err(Error::InvalidArgument(format!(
            "Cannot split {num_labels} labels over {num_classes} classes"
        )));
    }
    let per_class = num_labels / num_classes;

    let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); num_classes];
    for (idx, item) in items.iter().enumerate() {
        if item.label < num_classes {
            by_class[item.label].push(idx);
        }
    }

    let mut labeled = Vec::with_capacity(per_class * num_classes);
    for (class, indices) in by_class.iter_mut().enumerate() {
        if indices.len() < per_class {
            return Err(Error::Dataset(format!(
                "Class {class} has {} samples, {per_class} labeled samples requested",
                indices.len()
            )));
        }
        indices.shuffle(rng);
        labeled.extend(indices[..per_class].iter().map(|&i| items[i].clone()));
    }

    Ok(labeled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn items(per_class: usize, num_classes: usize) -> Vec<ImageItem> {
        (0..per_class * num_classes)
            .map(|i| ImageItem {
                pixels: vec![i as f32; 3],
                label: i % num_classes,
            })
            .collect()
    }

    #[test]
    fn test_split_is_balanced() {
        let all = items(20, 4);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let labeled = split_labeled(&all, 8, 4, &mut rng).unwrap();

        let dataset = ImageDataset::new(labeled);
        assert_eq!(dataset.len(), 8);
        assert_eq!(dataset.class_counts(4), vec![2, 2, 2, 2]);
    }

    #[test]
    fn test_split_is_seeded() {
        let all = items(20, 2);
        let a = split_labeled(&all, 4, 2, &mut ChaCha8Rng::seed_from_u64(5)).unwrap();
        let b = split_labeled(&all, 4, 2, &mut ChaCha8Rng::seed_from_u64(5)).unwrap();
        let pa: Vec<f32> = a.iter().map(|i| i.pixels[0]).collect();
        let pb: Vec<f32> = b.iter().map(|i| i.pixels[0]).collect();
        assert_eq!(pa, pb);
    }

    #[test]
    fn test_split_fails_for_small_class() {
        let all = items(1, 3);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(split_labeled(&all, 6, 3, &mut rng).is_err());
    }

    #[test]
    fn test_dataset_get() {
        let dataset = ImageDataset::new(items(1, 2));
        assert_eq!(dataset.get(1).map(|i| i.label), Some(1));
        assert!(dataset.get(2).is_none());
    }
}

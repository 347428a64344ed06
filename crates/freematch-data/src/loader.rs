//! Batch sources used by the training loop.
//!
//! Training loaders draw full batches from a reshuffled index order and stop
//! after a fixed number of batches. Returning `None` is the end-of-phase signal.

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::augmentation::{StrongAugment, WeakAugment};
use crate::batcher::{ImageBatcher, LabeledBatch, LabeledItem, UnlabeledBatch, UnlabeledItem};
use crate::dataset::ImageDataset;

/// Endless shuffled index stream, cut into batches, bounded by `max_batches`.
///
/// A batch that crosses the end of a pass continues into a freshly shuffled
/// pass, so every batch is full even when the dataset is smaller than the
/// batch size.
#[derive(Debug, Clone)]
pub struct IndexSampler {
    len: usize,
    batch_size: usize,
    max_batches: usize,
    yielded: usize,
    order: Vec<usize>,
    cursor: usize,
    rng: ChaCha8Rng,
}

impl IndexSampler {
    pub fn new(len: usize, batch_size: usize, max_batches: usize, seed: u64) -> Self {
        Self {
            len,
            batch_size,
            max_batches,
            yielded: 0,
            order: Vec::new(),
            cursor: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn next_indices(&mut self) -> Option<Vec<usize>> {
        if self.yielded >= self.max_batches || self.len == 0 || self.batch_size == 0 {
            return None;
        }

        let mut indices = Vec::with_capacity(self.batch_size);
        while indices.len() < self.batch_size {
            if self.cursor >= self.order.len() {
                self.order = (0..self.len).collect();
                self.order.shuffle(&mut self.rng);
                self.cursor = 0;
            }
            indices.push(self.order[self.cursor]);
            self.cursor += 1;
        }

        self.yielded += 1;
        Some(indices)
    }

    pub fn batches_yielded(&self) -> usize {
        self.yielded
    }
}

/// Weakly augmented labeled batches
pub struct LabeledLoader<B: Backend> {
    dataset: ImageDataset,
    sampler: IndexSampler,
    augment: WeakAugment,
    batcher: ImageBatcher<B>,
    rng: ChaCha8Rng,
}

impl<B: Backend> LabeledLoader<B> {
    pub fn new(
        dataset: ImageDataset,
        batch_size: usize,
        max_batches: usize,
        image_size: usize,
        batcher: ImageBatcher<B>,
        seed: u64,
    ) -> Self {
        let sampler = IndexSampler::new(dataset.len(), batch_size, max_batches, seed);
        Self {
            dataset,
            sampler,
            augment: WeakAugment::new(image_size),
            batcher,
            rng: ChaCha8Rng::seed_from_u64(seed.wrapping_add(1)),
        }
    }
}

impl<B: Backend> Iterator for LabeledLoader<B> {
    type Item = LabeledBatch<B>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.sampler.next_indices()?;
        let items = indices
            .into_iter()
            .filter_map(|i| self.dataset.get(i))
            .map(|item| LabeledItem {
                image: self.augment.apply(&item.pixels, &mut self.rng),
                label: item.label,
            })
            .collect();
        Some(self.batcher.batch(items))
    }
}

/// Weak/strong view pairs of unlabeled images
pub struct UnlabeledLoader<B: Backend> {
    dataset: ImageDataset,
    sampler: IndexSampler,
    weak: WeakAugment,
    strong: StrongAugment,
    batcher: ImageBatcher<B>,
    rng: ChaCha8Rng,
}

impl<B: Backend> UnlabeledLoader<B> {
    pub fn new(
        dataset: ImageDataset,
        batch_size: usize,
        max_batches: usize,
        image_size: usize,
        batcher: ImageBatcher<B>,
        seed: u64,
    ) -> Self {
        let sampler = IndexSampler::new(dataset.len(), batch_size, max_batches, seed);
        Self {
            dataset,
            sampler,
            weak: WeakAugment::new(image_size),
            strong: StrongAugment::new(image_size),
            batcher,
            rng: ChaCha8Rng::seed_from_u64(seed.wrapping_add(1)),
        }
    }
}

impl<B: Backend> Iterator for UnlabeledLoader<B> {
    type Item = UnlabeledBatch<B>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.sampler.next_indices()?;
        let items = indices
            .into_iter()
            .filter_map(|i| self.dataset.get(i).map(|item| (i, item)))
            .map(|(index, item)| UnlabeledItem {
                image_weak: self.weak.apply(&item.pixels, &mut self.rng),
                image_strong: self.strong.apply(&item.pixels, &mut self.rng),
                index,
            })
            .collect();
        Some(self.batcher.batch(items))
    }
}

/// Ordered, unaugmented, single pass; the last batch may be short
pub struct EvalLoader<B: Backend> {
    dataset: ImageDataset,
    batch_size: usize,
    batcher: ImageBatcher<B>,
}

impl<B: Backend> EvalLoader<B> {
    pub fn new(dataset: ImageDataset, batch_size: usize, batcher: ImageBatcher<B>) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            batcher,
        }
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// A fresh pass over the whole set
    pub fn iter(&self) -> impl Iterator<Item = LabeledBatch<B>> + '_ {
        self.dataset.items().chunks(self.batch_size).map(move |chunk| {
            let items = chunk
                .iter()
                .map(|item| LabeledItem {
                    image: item.pixels.clone(),
                    label: item.label,
                })
                .collect();
            self.batcher.batch(items)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ImageItem;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn dataset(n: usize) -> ImageDataset {
        ImageDataset::new(
            (0..n)
                .map(|i| ImageItem {
                    pixels: vec![0.5; 3 * 4 * 4],
                    label: i % 2,
                })
                .collect(),
        )
    }

    fn batcher() -> ImageBatcher<TestBackend> {
        ImageBatcher::new(Default::default(), 4, [0.5; 3], [0.25; 3])
    }

    #[test]
    fn test_sampler_covers_every_index_per_pass() {
        let mut sampler = IndexSampler::new(6, 3, 10, 0);
        let mut seen: Vec<usize> = sampler.next_indices().unwrap();
        seen.extend(sampler.next_indices().unwrap());
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_sampler_fills_batches_larger_than_dataset() {
        let mut sampler = IndexSampler::new(2, 5, 1, 0);
        let batch = sampler.next_indices().unwrap();
        assert_eq!(batch.len(), 5);
        assert!(batch.iter().all(|&i| i < 2));
        assert!(sampler.next_indices().is_none());
    }

    #[test]
    fn test_sampler_stops_at_budget() {
        let mut sampler = IndexSampler::new(10, 2, 3, 1);
        let count = std::iter::from_fn(|| sampler.next_indices()).count();
        assert_eq!(count, 3);
        assert_eq!(sampler.batches_yielded(), 3);
    }

    #[test]
    fn test_unlabeled_loader_pairs_views() {
        let mut loader = UnlabeledLoader::new(dataset(5), 4, 2, 4, batcher(), 11);
        let batch = loader.next().unwrap();
        assert_eq!(batch.indices.len(), 4);
        assert_eq!(batch.images_weak.dims(), [4, 3, 4, 4]);
        assert_eq!(batch.images_strong.dims(), [4, 3, 4, 4]);
        assert!(loader.next().is_some());
        assert!(loader.next().is_none());
    }

    #[test]
    fn test_labeled_loader_yields_labels() {
        let mut loader = LabeledLoader::new(dataset(4), 4, 1, 4, batcher(), 0);
        let batch = loader.next().unwrap();
        let mut labels = batch.labels.into_data().to_vec::<i64>().unwrap();
        labels.sort();
        assert_eq!(labels, vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_eval_loader_keeps_remainder() {
        let loader = EvalLoader::new(dataset(5), 2, batcher());
        let sizes: Vec<usize> = loader.iter().map(|b| b.images.dims()[0]).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        // Reusable for another pass
        assert_eq!(loader.iter().count(), 3);
    }
}

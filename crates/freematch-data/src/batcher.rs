//! Burn batchers for labeled and unlabeled items

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;

use crate::CHANNELS;

/// A (weakly augmented) labeled image
#[derive(Clone, Debug)]
pub struct LabeledItem {
    /// CHW pixels in [0, 1]
    pub image: Vec<f32>,
    pub label: usize,
}

/// Two views of one unlabeled image plus its position in the unlabeled set
#[derive(Clone, Debug)]
pub struct UnlabeledItem {
    pub image_weak: Vec<f32>,
    pub image_strong: Vec<f32>,
    pub index: usize,
}

#[derive(Clone, Debug)]
pub struct LabeledBatch<B: Backend> {
    /// [batch_size, 3, H, W]
    pub images: Tensor<B, 4>,
    /// [batch_size]
    pub labels: Tensor<B, 1, Int>,
}

#[derive(Clone, Debug)]
pub struct UnlabeledBatch<B: Backend> {
    pub images_weak: Tensor<B, 4>,
    pub images_strong: Tensor<B, 4>,
    /// Unlabeled-set index of every row
    pub indices: Vec<usize>,
}

/// Stacks items into normalized image tensors
#[derive(Clone, Debug)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    mean: [f32; 3],
    std: [f32; 3],
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, image_size: usize, mean: [f32; 3], std: [f32; 3]) -> Self {
        Self {
            device,
            image_size,
            mean,
            std,
        }
    }

    /// `(x - mean) / std` per channel
    fn to_images(&self, data: Vec<f32>, batch_size: usize) -> Tensor<B, 4> {
        let size = self.image_size;
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(data, [batch_size, CHANNELS, size, size]),
            &self.device,
        );
        let mean = Tensor::<B, 4>::from_floats(
            TensorData::new(self.mean.to_vec(), [1, CHANNELS, 1, 1]),
            &self.device,
        );
        let std = Tensor::<B, 4>::from_floats(
            TensorData::new(self.std.to_vec(), [1, CHANNELS, 1, 1]),
            &self.device,
        );
        (images - mean) / std
    }
}

impl<B: Backend> Batcher<LabeledItem, LabeledBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<LabeledItem>) -> LabeledBatch<B> {
        let batch_size = items.len();
        let labels: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let data: Vec<f32> = items.into_iter().flat_map(|item| item.image).collect();

        let images = self.to_images(data, batch_size);
        let labels =
            Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [batch_size]), &self.device);

        LabeledBatch { images, labels }
    }
}

impl<B: Backend> Batcher<UnlabeledItem, UnlabeledBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<UnlabeledItem>) -> UnlabeledBatch<B> {
        let batch_size = items.len();
        let indices = items.iter().map(|item| item.index).collect();
        let mut weak = Vec::with_capacity(batch_size * items.first().map_or(0, |i| i.image_weak.len()));
        let mut strong = Vec::with_capacity(weak.capacity());
        for item in items {
            weak.extend(item.image_weak);
            strong.extend(item.image_strong);
        }

        UnlabeledBatch {
            images_weak: self.to_images(weak, batch_size),
            images_strong: self.to_images(strong, batch_size),
            indices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn batcher() -> ImageBatcher<TestBackend> {
        ImageBatcher::new(Default::default(), 2, [0.5, 0.5, 0.5], [0.25, 0.25, 0.25])
    }

    #[test]
    fn test_labeled_batch_shapes_and_normalization() {
        let items = vec![
            LabeledItem { image: vec![0.5; 12], label: 1 },
            LabeledItem { image: vec![1.0; 12], label: 4 },
        ];
        let batch: LabeledBatch<TestBackend> = batcher().batch(items);

        assert_eq!(batch.images.dims(), [2, 3, 2, 2]);
        let pixels = batch.images.into_data().to_vec::<f32>().unwrap();
        assert!((pixels[0] - 0.0).abs() < 1e-6);
        assert!((pixels[12] - 2.0).abs() < 1e-6);

        let labels = batch.labels.into_data().to_vec::<i64>().unwrap();
        assert_eq!(labels, vec![1, 4]);
    }

    #[test]
    fn test_unlabeled_batch_keeps_indices() {
        let items = vec![
            UnlabeledItem { image_weak: vec![0.5; 12], image_strong: vec![0.75; 12], index: 7 },
            UnlabeledItem { image_weak: vec![0.5; 12], image_strong: vec![0.75; 12], index: 2 },
        ];
        let batch: UnlabeledBatch<TestBackend> = batcher().batch(items);

        assert_eq!(batch.indices, vec![7, 2]);
        assert_eq!(batch.images_weak.dims(), batch.images_strong.dims());
        let strong = batch.images_strong.into_data().to_vec::<f32>().unwrap();
        assert!((strong[0] - 1.0).abs() < 1e-6);
    }
}

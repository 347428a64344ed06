//! Owns the labeled, unlabeled and evaluation sets of a run and hands out
//! loaders over them.

use burn::data::dataset::Dataset;
use burn::prelude::*;
use freematch_core::{DatasetConfig, Error, FreeMatchConfig, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::batcher::ImageBatcher;
use crate::cifar10::{load_cifar10, Cifar10Split};
use crate::dataset::{split_labeled, ImageDataset, ImageItem};
use crate::loader::{EvalLoader, LabeledLoader, UnlabeledLoader};

pub struct DataManager<B: Backend> {
    labeled: ImageDataset,
    unlabeled: ImageDataset,
    test: ImageDataset,
    config: DatasetConfig,
    num_train_iters: usize,
    seed: u64,
    device: B::Device,
}

impl<B: Backend> DataManager<B> {
    /// Load CIFAR-10 from `dataset.data_dir` and select the labeled subset
    pub fn from_config(config: &FreeMatchConfig, device: B::Device) -> Result<Self> {
        if config.dataset.name != "cifar10" {
            return Err(Error::Dataset(format!(
                "Unsupported dataset '{}', only cifar10 is available",
                config.dataset.name
            )));
        }
        let train = load_cifar10(&config.dataset.data_dir, Cifar10Split::Train)?;
        let test = load_cifar10(&config.dataset.data_dir, Cifar10Split::Test)?;

        Self::from_items(
            train,
            test,
            config.dataset.clone(),
            config.trainer.num_train_iters,
            config.seed,
            device,
        )
    }

    /// Build from already decoded images.
    ///
    /// The unlabeled set is the whole training set, labeled samples included.
    pub fn from_items(
        train: Vec<ImageItem>,
        test: Vec<ImageItem>,
        config: DatasetConfig,
        num_train_iters: usize,
        seed: u64,
        device: B::Device,
    ) -> Result<Self> {
        if config.mean.len() != 3 || config.std.len() != 3 {
            return Err(Error::Config("dataset mean and std need exactly 3 channels".into()));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let labeled = split_labeled(&train, config.num_labels, config.num_classes, &mut rng)?;

        let manager = Self {
            labeled: ImageDataset::new(labeled),
            unlabeled: ImageDataset::new(train),
            test: ImageDataset::new(test),
            config,
            num_train_iters,
            seed,
            device,
        };
        info!(
            "Data: {} labeled, {} unlabeled, {} eval samples",
            manager.labeled.len(),
            manager.unlabeled.len(),
            manager.test.len()
        );
        Ok(manager)
    }

    fn batcher(&self) -> ImageBatcher<B> {
        self.batcher_on(self.device.clone())
    }

    fn batcher_on<E: Backend>(&self, device: E::Device) -> ImageBatcher<E> {
        let m = &self.config.mean;
        let s = &self.config.std;
        ImageBatcher::new(
            device,
            self.config.image_size,
            [m[0], m[1], m[2]],
            [s[0], s[1], s[2]],
        )
    }

    /// `batch_size` labeled images per batch, at most `num_train_iters` batches
    pub fn labeled_loader(&self) -> LabeledLoader<B> {
        LabeledLoader::new(
            self.labeled.clone(),
            self.config.batch_size,
            self.num_train_iters,
            self.config.image_size,
            self.batcher(),
            self.seed,
        )
    }

    /// `batch_size * uratio` unlabeled pairs per batch
    pub fn unlabeled_loader(&self) -> UnlabeledLoader<B> {
        UnlabeledLoader::new(
            self.unlabeled.clone(),
            self.config.batch_size * self.config.uratio,
            self.num_train_iters,
            self.config.image_size,
            self.batcher(),
            self.seed.wrapping_add(1000),
        )
    }

    pub fn eval_loader(&self) -> EvalLoader<B> {
        self.eval_loader_on(self.device.clone())
    }

    /// Evaluation batches on another backend sharing the same device type,
    /// e.g. the inner backend of an autodiff backend
    pub fn eval_loader_on<E: Backend>(&self, device: E::Device) -> EvalLoader<E> {
        EvalLoader::new(self.test.clone(), self.config.eval_batch_size, self.batcher_on(device))
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn num_unlabeled(&self) -> usize {
        self.unlabeled.len()
    }

    pub fn num_labeled(&self) -> usize {
        self.labeled.len()
    }

    pub fn num_classes(&self) -> usize {
        self.config.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn items(n: usize, num_classes: usize, size: usize) -> Vec<ImageItem> {
        (0..n)
            .map(|i| ImageItem {
                pixels: vec![(i % 7) as f32 / 7.0; 3 * size * size],
                label: i % num_classes,
            })
            .collect()
    }

    fn config() -> DatasetConfig {
        DatasetConfig {
            num_classes: 2,
            num_labels: 4,
            batch_size: 2,
            uratio: 3,
            eval_batch_size: 4,
            image_size: 8,
            ..DatasetConfig::default()
        }
    }

    #[test]
    fn test_manager_sizes() {
        let manager = DataManager::<TestBackend>::from_items(
            items(20, 2, 8),
            items(6, 2, 8),
            config(),
            5,
            0,
            Default::default(),
        )
        .unwrap();

        assert_eq!(manager.num_labeled(), 4);
        assert_eq!(manager.num_unlabeled(), 20);
        assert_eq!(manager.num_classes(), 2);

        let lb = manager.labeled_loader().next().unwrap();
        assert_eq!(lb.images.dims(), [2, 3, 8, 8]);

        let ulb = manager.unlabeled_loader().next().unwrap();
        assert_eq!(ulb.indices.len(), 6);
        assert!(ulb.indices.iter().all(|&i| i < 20));

        assert_eq!(manager.labeled_loader().count(), 5);
        assert_eq!(manager.eval_loader().iter().count(), 2);
    }

    #[test]
    fn test_unknown_dataset_is_rejected() {
        let mut config = FreeMatchConfig::default();
        config.dataset.name = "svhn".into();
        let result = DataManager::<TestBackend>::from_config(&config, Default::default());
        assert!(matches!(result, Err(Error::Dataset(_))));
    }
}

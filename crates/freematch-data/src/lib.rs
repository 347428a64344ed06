//! Data sources for FreeMatch training.
//!
//! This crate provides:
//! - CIFAR-10 binary batch loading
//! - Per-class labeled subset selection
//! - Weak and strong augmentation on CHW float buffers
//! - Burn batchers for labeled and unlabeled batches
//! - Cycling (budget-bounded) and single-pass loaders
//! - A data manager owning the three batch sources of a run

pub mod augmentation;
pub mod batcher;
pub mod cifar10;
pub mod dataset;
pub mod loader;
pub mod manager;

pub use augmentation::{StrongAugment, WeakAugment};
pub use batcher::{ImageBatcher, LabeledBatch, LabeledItem, UnlabeledBatch, UnlabeledItem};
pub use cifar10::{load_cifar10, Cifar10Split, CLASS_NAMES};
pub use dataset::{split_labeled, ImageDataset, ImageItem};
pub use loader::{EvalLoader, IndexSampler, LabeledLoader, UnlabeledLoader};
pub use manager::DataManager;

/// Number of colour channels of every image
pub const CHANNELS: usize = 3;

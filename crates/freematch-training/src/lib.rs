//! FreeMatch semi-supervised training.
//!
//! This crate provides:
//! - Model architectures (Wide ResNet variants, a small CNN) behind a name registry
//! - Self-adaptive threshold statistics, the SAT and SAF losses and the
//!   pseudo-label consistency bank
//! - Plain and sharpness-aware optimization steps
//! - EMA model, learning rate scheduling and optimizer construction
//! - Evaluation, checkpointing and metric sinks
//! - The warmup / train / eval loop

pub mod checkpoint;
pub mod ema;
pub mod evaluator;
pub mod label_bank;
pub mod losses;
pub mod lr_schedule;
pub mod model;
pub mod optim;
pub mod params;
pub mod saf;
pub mod sat;
pub mod sharpness;
pub mod sink;
pub mod stats;
pub mod step;
pub mod trainer;

pub use checkpoint::{CheckpointManager, TrainerCheckpointState, BEST_CHECKPOINT, LAST_CHECKPOINT};
pub use ema::EmaModel;
pub use evaluator::Evaluator;
pub use label_bank::PseudoLabelBank;
pub use lr_schedule::{LearningRateScheduler, SchedulerState, SchedulerType};
pub use model::{build_model, FreeMatchModel, ImageClassifier, ModelKind};
pub use optim::{adamw, sgd, AdamWOptimizer, SgdOptimizer};
pub use saf::SelfAdaptiveFairnessLoss;
pub use sat::SelfAdaptiveThresholdLoss;
pub use sharpness::{perturbed, SharpnessPerturbation};
pub use sink::{JsonlSink, MemorySink, MetricsSink, MultiSink, TracingSink};
pub use stats::{StatTracker, ThresholdState};
pub use step::{PlainStep, SharpnessAwareStep, StepMetrics, StepStrategy, TrainStep};
pub use trainer::{FreeMatchTrainer, Phase, TrainerState, TrainingSummary};

/// Re-export commonly used types
pub mod prelude {
    pub use super::checkpoint::CheckpointManager;
    pub use super::model::{build_model, FreeMatchModel, ImageClassifier};
    pub use super::optim::{adamw, sgd};
    pub use super::sink::{JsonlSink, MetricsSink, MultiSink, TracingSink};
    pub use super::stats::ThresholdState;
    pub use super::step::StepStrategy;
    pub use super::trainer::{FreeMatchTrainer, TrainingSummary};
}

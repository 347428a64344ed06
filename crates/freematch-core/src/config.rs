//! Run configuration for FreeMatch training.
//!
//! Every section carries `#[serde(default)]` so a TOML file only needs to
//! list the values it changes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{Error, Result};

/// Architectures understood by the model registry
pub const AVAILABLE_MODELS: [&str; 4] = ["wrn_28_2", "wrn_28_8", "wrn_37_2", "cnn_lite"];

/// Top-level configuration of a training run
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FreeMatchConfig {
    pub trainer: TrainerParams,
    pub sharpness: SharpnessConfig,
    pub model: ModelConfig,
    pub dataset: DatasetConfig,
    pub optimizer: OptimizerConfig,
    pub scheduler: SchedulerConfig,
    pub output: OutputConfig,
    pub resume: ResumeConfig,
    pub device: DeviceConfig,
    /// Random seed for data sampling and augmentation
    pub seed: u64,
}

/// Iteration budgets and loss weighting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerParams {
    pub num_train_iters: usize,
    pub num_eval_iters: usize,
    pub num_warmup_iters: usize,
    pub num_log_iters: usize,
    /// Decay of the EMA (shadow) model
    pub ema_decay: f64,
    pub ulb_loss_ratio: f32,
    pub ent_loss_ratio: f32,
    /// Decay of the threshold statistics
    pub sat_ema: f32,
    pub amp_enabled: bool,
    /// Add the pseudo-label consistency term to the total loss
    pub po_loss_enabled: bool,
    pub po_loss_ratio: f32,
}

impl Default for TrainerParams {
    fn default() -> Self {
        Self {
            num_train_iters: 1 << 20,
            num_eval_iters: 5000,
            num_warmup_iters: 0,
            num_log_iters: 50,
            ema_decay: 0.999,
            ulb_loss_ratio: 1.0,
            ent_loss_ratio: 0.01,
            sat_ema: 0.999,
            amp_enabled: false,
            po_loss_enabled: false,
            po_loss_ratio: 1.0,
        }
    }
}

/// Sharpness-aware (two pass) update
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharpnessConfig {
    pub enabled: bool,
    /// Radius of the weight perturbation
    pub rho: f32,
}

impl Default for SharpnessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rho: 0.05,
        }
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Registry name, one of [`AVAILABLE_MODELS`]
    pub name: String,
    pub pretrained: bool,
    pub pretrained_path: Option<PathBuf>,
    pub dropout: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "wrn_28_2".to_string(),
            pretrained: false,
            pretrained_path: None,
            dropout: 0.0,
        }
    }
}

/// Dataset and batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub name: String,
    /// Directory holding the CIFAR-10 binary batches
    pub data_dir: PathBuf,
    pub num_classes: usize,
    /// Total number of labeled samples, split evenly across classes
    pub num_labels: usize,
    pub batch_size: usize,
    /// Ratio of unlabeled to labeled samples per batch
    pub uratio: usize,
    pub eval_batch_size: usize,
    pub image_size: usize,
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            name: "cifar10".to_string(),
            data_dir: PathBuf::from("data/cifar-10-batches-bin"),
            num_classes: 10,
            num_labels: 40,
            batch_size: 64,
            uratio: 7,
            eval_batch_size: 256,
            image_size: 32,
            mean: vec![0.4914, 0.4822, 0.4465],
            std: vec![0.2471, 0.2435, 0.2616],
        }
    }
}

/// Optimizer type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// SGD with (optionally Nesterov) momentum
    Sgd,
    /// AdamW optimizer
    AdamW,
}

impl std::fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizerKind::Sgd => write!(f, "sgd"),
            OptimizerKind::AdamW => write!(f, "adamw"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub lr: f64,
    pub momentum: f64,
    pub nesterov: bool,
    pub weight_decay: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Sgd,
            lr: 0.03,
            momentum: 0.9,
            nesterov: true,
            weight_decay: 5e-4,
        }
    }
}

/// Learning rate schedule type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// `lr * cos(7 pi k / 16 K)` decay over the training budget
    Cosine,
    Constant,
    /// Multiply by `gamma` every `step_size` iterations
    Step,
    /// Half-cosine from `lr` down to `eta_min` over the training budget
    CosineAnnealing,
    /// Linear warmup, then half-cosine down to `eta_min`
    WarmupCosine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub kind: SchedulerKind,
    /// Linear warmup iterations before the cosine decay starts
    pub num_warmup_iters: usize,
    pub step_size: usize,
    pub gamma: f64,
    pub eta_min: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::Cosine,
            num_warmup_iters: 0,
            step_size: 100_000,
            gamma: 0.1,
            eta_min: 0.0,
        }
    }
}

/// Where logs, metrics and checkpoints go
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub log_dir: PathBuf,
    pub run_name: String,
    /// Checkpoint sub-directory below `log_dir/run_name`
    pub output_dir: String,
    pub metrics_jsonl: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            run_name: "freematch_cifar10_40".to_string(),
            output_dir: "checkpoints".to_string(),
            metrics_jsonl: true,
        }
    }
}

impl OutputConfig {
    /// `log_dir/run_name`
    pub fn run_dir(&self) -> PathBuf {
        self.log_dir.join(&self.run_name)
    }

    /// `log_dir/run_name/output_dir`
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.run_dir().join(&self.output_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResumeConfig {
    pub enabled: bool,
    /// Checkpoint directory to resume from
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DeviceConfig {
    pub use_cuda: bool,
    pub gpu: usize,
}

impl FreeMatchConfig {
    /// Reject configurations that cannot produce a meaningful run
    pub fn validate(&self) -> Result<()> {
        let t = &self.trainer;
        if t.num_train_iters == 0 {
            return Err(Error::Config("num_train_iters must be greater than 0".into()));
        }
        if t.num_eval_iters == 0 || t.num_log_iters == 0 {
            return Err(Error::Config(
                "num_eval_iters and num_log_iters must be greater than 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&t.ema_decay) {
            return Err(Error::Config(format!("ema_decay must be in [0, 1), got {}", t.ema_decay)));
        }
        if !(0.0..1.0).contains(&t.sat_ema) {
            return Err(Error::Config(format!("sat_ema must be in [0, 1), got {}", t.sat_ema)));
        }
        if self.sharpness.enabled && self.sharpness.rho <= 0.0 {
            return Err(Error::Config("sharpness.rho must be positive".into()));
        }

        let d = &self.dataset;
        if d.num_classes == 0 {
            return Err(Error::Config("num_classes must be greater than 0".into()));
        }
        if d.batch_size == 0 || d.uratio == 0 || d.eval_batch_size == 0 {
            return Err(Error::Config("batch sizes and uratio must be greater than 0".into()));
        }
        if d.num_labels < d.num_classes {
            return Err(Error::Config(format!(
                "num_labels ({}) must provide at least one sample per class ({})",
                d.num_labels, d.num_classes
            )));
        }
        if d.mean.len() != 3 || d.std.len() != 3 {
            return Err(Error::Config("dataset mean and std need exactly 3 channels".into()));
        }
        if d.std.iter().any(|s| *s <= 0.0) {
            return Err(Error::Config("dataset std must be positive".into()));
        }

        if !AVAILABLE_MODELS.contains(&self.model.name.as_str()) {
            return Err(Error::Config(format!(
                "Unknown model '{}'. Valid options: {}",
                self.model.name,
                AVAILABLE_MODELS.join(", ")
            )));
        }
        if self.model.pretrained && self.model.pretrained_path.is_none() {
            return Err(Error::Config("model.pretrained requires model.pretrained_path".into()));
        }
        if self.optimizer.lr <= 0.0 {
            return Err(Error::Config("Learning rate must be positive".into()));
        }
        if self.scheduler.kind == SchedulerKind::Step && self.scheduler.step_size == 0 {
            return Err(Error::Config("scheduler.step_size must be greater than 0".into()));
        }
        if self.resume.enabled && self.resume.path.is_none() {
            return Err(Error::Config("resume.enabled requires resume.path".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FreeMatchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dataset.num_classes, 10);
        assert_eq!(config.model.name, "wrn_28_2");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: FreeMatchConfig = toml::from_str(
            r#"
            seed = 7

            [trainer]
            num_train_iters = 200
            po_loss_enabled = true

            [sharpness]
            enabled = true
            rho = 0.1

            [optimizer]
            kind = "adamw"
            "#,
        )
        .unwrap();

        assert_eq!(config.seed, 7);
        assert_eq!(config.trainer.num_train_iters, 200);
        assert_eq!(config.trainer.num_eval_iters, 5000);
        assert!(config.trainer.po_loss_enabled);
        assert!(config.sharpness.enabled);
        assert_eq!(config.optimizer.kind, OptimizerKind::AdamW);
        assert_eq!(config.scheduler.kind, SchedulerKind::Cosine);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = FreeMatchConfig::default();
        config.model.name = "resnet1000".into();
        assert!(config.validate().is_err());

        let mut config = FreeMatchConfig::default();
        config.trainer.sat_ema = 1.0;
        assert!(config.validate().is_err());

        let mut config = FreeMatchConfig::default();
        config.sharpness.enabled = true;
        config.sharpness.rho = 0.0;
        assert!(config.validate().is_err());

        let mut config = FreeMatchConfig::default();
        config.resume.enabled = true;
        assert!(config.validate().is_err());

        let mut config = FreeMatchConfig::default();
        config.dataset.num_labels = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scheduler_kind_names() {
        let config: FreeMatchConfig = toml::from_str(
            r#"
            [scheduler]
            kind = "warmup_cosine"
            num_warmup_iters = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.kind, SchedulerKind::WarmupCosine);
        assert_eq!(config.scheduler.eta_min, 0.0);

        let mut config = FreeMatchConfig::default();
        config.scheduler.kind = SchedulerKind::Step;
        config.scheduler.step_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shipped_configs_are_valid() {
        for content in [
            include_str!("../../../configs/cifar10.toml"),
            include_str!("../../../configs/cifar10_sharpness.toml"),
        ] {
            let config: FreeMatchConfig = toml::from_str(content).unwrap();
            assert!(config.validate().is_ok());
            assert_eq!(config.dataset.num_labels, 40);
        }
    }

    #[test]
    fn test_output_paths() {
        let output = OutputConfig::default();
        assert_eq!(
            output.checkpoint_dir(),
            PathBuf::from("logs/freematch_cifar10_40/checkpoints")
        );
    }
}

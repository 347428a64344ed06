//! Checkpoint persistence.
//!
//! A checkpoint is a directory holding:
//! - `model.mpk`: online model weights
//! - `ema.mpk`: EMA (shadow) model weights
//! - `optimizer.bin`: optimizer state
//! - `state.json`: iteration counters, best accuracy, threshold statistics
//!   and scheduler progress
//!
//! The pseudo-label bank is not part of a checkpoint; a resumed run starts
//! from a uniform bank.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::{AutodiffModule, Module};
use burn::optim::Optimizer;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use freematch_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::lr_schedule::SchedulerState;
use crate::optim::{load_optimizer, save_optimizer};
use crate::stats::ThresholdState;

pub const SCHEMA_VERSION: u32 = 1;
pub const BEST_CHECKPOINT: &str = "best_checkpoint";
pub const LAST_CHECKPOINT: &str = "last_checkpoint";

const MODEL_FILE: &str = "model";
const EMA_FILE: &str = "ema";
const OPTIMIZER_FILE: &str = "optimizer";
const STATE_FILE: &str = "state.json";

/// Training-loop state stored next to the weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainerCheckpointState {
    pub schema_version: u32,
    pub curr_iter: usize,
    /// -1 until the first evaluation
    pub best_test_iter: i64,
    pub best_test_acc: f64,
    pub tau_t: f32,
    pub p_t: Vec<f32>,
    pub label_hist: Vec<f32>,
    pub scheduler: SchedulerState,
    pub timestamp: String,
}

impl TrainerCheckpointState {
    pub fn new(
        curr_iter: usize,
        best_test_iter: i64,
        best_test_acc: f64,
        stats: &ThresholdState,
        scheduler: SchedulerState,
    ) -> Self {
        use chrono::Utc;

        Self {
            schema_version: SCHEMA_VERSION,
            curr_iter,
            best_test_iter,
            best_test_acc,
            tau_t: stats.tau,
            p_t: stats.p.clone(),
            label_hist: stats.hist.clone(),
            scheduler,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn threshold_state(&self) -> ThresholdState {
        ThresholdState {
            tau: self.tau_t,
            p: self.p_t.clone(),
            hist: self.label_hist.clone(),
        }
    }

    /// Schema version, vector lengths and finiteness
    pub fn validate(&self, num_classes: usize) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(Error::Checkpoint(format!(
                "Unsupported checkpoint schema version {} (expected {})",
                self.schema_version, SCHEMA_VERSION
            )));
        }
        for (name, values) in [("p_t", &self.p_t), ("label_hist", &self.label_hist)] {
            if values.len() != num_classes {
                return Err(Error::Checkpoint(format!(
                    "{name} has {} entries, expected {num_classes}",
                    values.len()
                )));
            }
            if values.iter().any(|v| !v.is_finite()) {
                return Err(Error::Checkpoint(format!("{name} contains non-finite values")));
            }
        }
        if !self.tau_t.is_finite() {
            return Err(Error::Checkpoint("tau_t is not finite".into()));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize checkpoint state: {e}")))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Read and validate `state.json`
    pub fn load(path: &Path, num_classes: usize) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| {
            Error::Checkpoint(format!("Failed to read {}: {e}", path.display()))
        })?;
        let state: Self = serde_json::from_str(&json).map_err(|e| {
            Error::Checkpoint(format!("Invalid checkpoint state {}: {e}", path.display()))
        })?;
        state.validate(num_classes)?;
        Ok(state)
    }
}

/// Everything restored from a checkpoint directory
pub struct LoadedCheckpoint<M, E, O> {
    pub model: M,
    pub ema: E,
    pub optimizer: O,
    pub state: TrainerCheckpointState,
}

/// Writes named checkpoint directories below one root
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

impl CheckpointManager {
    pub fn new(checkpoint_dir: PathBuf) -> Self {
        Self { checkpoint_dir }
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.checkpoint_dir.join(name)
    }

    /// Save under `<checkpoint_dir>/<name>/`, replacing older contents
    pub fn save<B, M, O>(
        &self,
        name: &str,
        model: &M,
        ema: &M::InnerModule,
        optimizer: &O,
        state: &TrainerCheckpointState,
    ) -> Result<PathBuf>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let dir = self.path(name);
        fs::create_dir_all(&dir)?;

        model
            .clone()
            .save_file(dir.join(MODEL_FILE), &recorder())
            .map_err(|e| Error::Checkpoint(format!("Failed to save model: {e}")))?;
        ema.clone()
            .save_file(dir.join(EMA_FILE), &recorder())
            .map_err(|e| Error::Checkpoint(format!("Failed to save EMA model: {e}")))?;
        save_optimizer::<B, M, O>(optimizer, &dir.join(OPTIMIZER_FILE))?;
        state.save(&dir.join(STATE_FILE))?;

        info!("Checkpoint saved to {}", dir.display());
        Ok(dir)
    }

    /// Restore every part of a checkpoint directory into the given
    /// freshly built modules
    pub fn load<B, M, O>(
        dir: &Path,
        model: M,
        ema: M::InnerModule,
        optimizer: O,
        num_classes: usize,
        device: &B::Device,
    ) -> Result<LoadedCheckpoint<M, M::InnerModule, O>>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        if !dir.is_dir() {
            return Err(Error::Checkpoint(format!(
                "Checkpoint directory {} does not exist",
                dir.display()
            )));
        }

        let state = TrainerCheckpointState::load(&dir.join(STATE_FILE), num_classes)?;
        let model = model
            .load_file(dir.join(MODEL_FILE), &recorder(), device)
            .map_err(|e| Error::Checkpoint(format!("Failed to load model: {e}")))?;
        let ema = load_module(dir, EMA_FILE, ema, device)?;
        let optimizer = load_optimizer::<B, M, O>(optimizer, &dir.join(OPTIMIZER_FILE), device)?;

        info!(
            "Checkpoint loaded from {} (iteration {}, best acc {:.4})",
            dir.display(),
            state.curr_iter,
            state.best_test_acc
        );
        Ok(LoadedCheckpoint {
            model,
            ema,
            optimizer,
            state,
        })
    }

    /// EMA weights alone, for evaluation-only runs
    pub fn load_ema<B: Backend, E: Module<B>>(dir: &Path, ema: E, device: &B::Device) -> Result<E> {
        load_module(dir, EMA_FILE, ema, device)
    }
}

fn load_module<B: Backend, E: Module<B>>(dir: &Path, file: &str, module: E, device: &B::Device) -> Result<E> {
    module
        .load_file(dir.join(file), &recorder(), device)
        .map_err(|e| Error::Checkpoint(format!("Failed to load {file} weights from {}: {e}", dir.display())))
}

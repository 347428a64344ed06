//! Learning rate scheduling strategies.
//!
//! Schedules are stepped once per training iteration, after the optimizer
//! step. Available schedules:
//! - Constant
//! - Step decay
//! - Cosine annealing
//! - Linear warmup followed by cosine annealing
//! - FixMatch cosine, `lr * cos(7 pi k / 16 K)` with optional linear warmup

use freematch_core::{SchedulerConfig, SchedulerKind};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Fraction of a half period covered by the FixMatch cosine
const FIXMATCH_CYCLES: f64 = 7.0 / 16.0;

/// Learning rate scheduler type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum SchedulerType {
    /// Constant learning rate (no scheduling)
    #[default]
    Constant,

    /// Step decay: multiply LR by gamma every step_size iterations
    StepLR { step_size: usize, gamma: f64 },

    /// Cosine annealing: cosine decay from initial to min LR
    CosineAnnealingLR { t_max: usize, eta_min: f64 },

    /// Linear warmup followed by cosine decay
    WarmupCosine {
        warmup_iters: usize,
        total_iters: usize,
        eta_min: f64,
    },

    /// Linear warmup followed by `cos(7 pi k / 16 K)` decay
    FixMatchCosine { warmup_iters: usize, total_iters: usize },
}

/// Serializable scheduler progress, stored in checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub current_step: usize,
    pub current_lr: f64,
}

/// Learning rate scheduler
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    scheduler_type: SchedulerType,
    base_lr: f64,
    current_lr: f64,
    current_step: usize,
}

impl LearningRateScheduler {
    /// Create a new learning rate scheduler
    pub fn new(scheduler_type: SchedulerType, base_lr: f64) -> Self {
        let mut scheduler = Self {
            scheduler_type,
            base_lr,
            current_lr: base_lr,
            current_step: 0,
        };
        scheduler.current_lr = scheduler.lr_at(0);
        scheduler
    }

    /// Build the configured schedule over a `total_iters` training budget
    pub fn from_config(config: &SchedulerConfig, base_lr: f64, total_iters: usize) -> Self {
        let scheduler_type = match config.kind {
            SchedulerKind::Constant => SchedulerType::Constant,
            SchedulerKind::Cosine => SchedulerType::FixMatchCosine {
                warmup_iters: config.num_warmup_iters,
                total_iters,
            },
            SchedulerKind::Step => SchedulerType::StepLR {
                step_size: config.step_size,
                gamma: config.gamma,
            },
            SchedulerKind::CosineAnnealing => SchedulerType::CosineAnnealingLR {
                t_max: total_iters,
                eta_min: config.eta_min,
            },
            SchedulerKind::WarmupCosine => SchedulerType::WarmupCosine {
                warmup_iters: config.num_warmup_iters,
                total_iters,
                eta_min: config.eta_min,
            },
        };
        Self::new(scheduler_type, base_lr)
    }

    /// Learning rate after `step` calls to [`Self::step`]
    pub fn lr_at(&self, step: usize) -> f64 {
        let cosine = |progress: f64, eta_min: f64| {
            let progress = progress.min(1.0);
            eta_min + (self.base_lr - eta_min) * (1.0 + (progress * PI).cos()) / 2.0
        };

        match &self.scheduler_type {
            SchedulerType::Constant => self.base_lr,

            SchedulerType::StepLR { step_size, gamma } => {
                let decays = step / (*step_size).max(1);
                self.base_lr * gamma.powi(decays as i32)
            }

            SchedulerType::CosineAnnealingLR { t_max, eta_min } => {
                cosine(step as f64 / (*t_max).max(1) as f64, *eta_min)
            }

            SchedulerType::WarmupCosine {
                warmup_iters,
                total_iters,
                eta_min,
            } => {
                if step < *warmup_iters {
                    self.base_lr * step as f64 / *warmup_iters as f64
                } else {
                    let decay_iters = total_iters.saturating_sub(*warmup_iters).max(1);
                    cosine((step - warmup_iters) as f64 / decay_iters as f64, *eta_min)
                }
            }

            SchedulerType::FixMatchCosine {
                warmup_iters,
                total_iters,
            } => {
                if step < *warmup_iters {
                    self.base_lr * step as f64 / *warmup_iters as f64
                } else {
                    let decay_iters = total_iters.saturating_sub(*warmup_iters).max(1);
                    let progress = (step - warmup_iters) as f64 / decay_iters as f64;
                    self.base_lr * (PI * FIXMATCH_CYCLES * progress).cos().max(0.0)
                }
            }
        }
    }

    /// Get the current learning rate
    pub fn get_lr(&self) -> f64 {
        self.current_lr
    }

    /// Advance by one training iteration
    pub fn step(&mut self) {
        self.current_step += 1;
        self.current_lr = self.lr_at(self.current_step);
    }

    /// Reset the scheduler
    pub fn reset(&mut self) {
        self.current_step = 0;
        self.current_lr = self.lr_at(0);
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn scheduler_type(&self) -> &SchedulerType {
        &self.scheduler_type
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            current_step: self.current_step,
            current_lr: self.current_lr,
        }
    }

    /// The learning rate is recomputed from the step, not read back
    pub fn load_state(&mut self, state: SchedulerState) {
        self.current_step = state.current_step;
        self.current_lr = self.lr_at(state.current_step);
    }
}

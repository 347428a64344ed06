//! Self-adaptive threshold statistics.
//!
//! The global confidence threshold `tau`, the per-class mean probability `p`
//! and the predicted-label histogram `hist` are tracked as exponential moving
//! averages over unlabeled weak-view predictions. They live in host memory;
//! every update is a pure function of the old state and one batch.

use serde::{Deserialize, Serialize};

/// `(tau, p, hist)` after some number of updates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdState {
    pub tau: f32,
    pub p: Vec<f32>,
    pub hist: Vec<f32>,
}

impl ThresholdState {
    /// `p = hist = 1/C`, `tau = mean(p)`
    pub fn uniform(num_classes: usize) -> Self {
        let value = 1.0 / num_classes.max(1) as f32;
        Self {
            tau: value,
            p: vec![value; num_classes],
            hist: vec![value; num_classes],
        }
    }

    /// Statistics of one batch taken as-is, without blending
    pub fn from_batch(batch: &BatchStats) -> Self {
        Self {
            tau: batch.max_prob_mean,
            p: batch.prob_mean.clone(),
            hist: batch.hist.clone(),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.p.len()
    }

    /// `tau_c = p_c / max(p) * tau`
    ///
    /// A non-positive `max(p)` leaves every class at `tau`.
    pub fn class_thresholds(&self) -> Vec<f32> {
        let max_p = self.p.iter().cloned().fold(f32::MIN, f32::max);
        if max_p <= 0.0 || !max_p.is_finite() {
            return vec![self.tau; self.p.len()];
        }
        self.p.iter().map(|p| p / max_p * self.tau).collect()
    }

    pub fn p_mean(&self) -> f32 {
        mean(&self.p)
    }

    pub fn hist_mean(&self) -> f32 {
        mean(&self.hist)
    }
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

/// Reductions of one batch of softmax probabilities
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStats {
    /// `mean_i max_c P[i, c]`
    pub max_prob_mean: f32,
    /// `mean_i P[i, :]`
    pub prob_mean: Vec<f32>,
    /// Normalized histogram of `argmax_c P[i, c]`
    pub hist: Vec<f32>,
}

impl BatchStats {
    /// `probs` is row-major `[n, num_classes]`. `None` for an empty batch.
    pub fn from_probs(probs: &[f32], num_classes: usize) -> Option<Self> {
        if num_classes == 0 || probs.is_empty() {
            return None;
        }
        let n = probs.len() / num_classes;
        if n == 0 {
            return None;
        }

        let mut max_sum = 0.0f32;
        let mut prob_sum = vec![0.0f32; num_classes];
        let mut counts = vec![0.0f32; num_classes];

        for row in probs.chunks_exact(num_classes) {
            let (argmax, max) = row_argmax(row);
            max_sum += max;
            counts[argmax] += 1.0;
            for (acc, p) in prob_sum.iter_mut().zip(row) {
                *acc += p;
            }
        }

        let n_f = n as f32;
        Some(Self {
            max_prob_mean: max_sum / n_f,
            prob_mean: prob_sum.into_iter().map(|s| s / n_f).collect(),
            hist: counts.into_iter().map(|c| c / n_f).collect(),
        })
    }
}

/// Index and value of the row maximum, first index on ties
pub fn row_argmax(row: &[f32]) -> (usize, f32) {
    row.iter()
        .enumerate()
        .fold((0, f32::MIN), |(best_i, best), (i, &v)| {
            if v > best {
                (i, v)
            } else {
                (best_i, best)
            }
        })
}

/// EMA update rule with a fixed decay
#[derive(Debug, Clone, Copy)]
pub struct StatTracker {
    decay: f32,
}

impl StatTracker {
    pub fn new(decay: f32) -> Self {
        Self { decay }
    }

    pub fn decay(&self) -> f32 {
        self.decay
    }

    /// `x' = decay * x + (1 - decay) * batch_x` for tau, p and hist
    pub fn update(&self, state: &ThresholdState, batch: &BatchStats) -> ThresholdState {
        let d = self.decay;
        let blend = |old: &[f32], new: &[f32]| -> Vec<f32> {
            old.iter().zip(new).map(|(o, n)| d * o + (1.0 - d) * n).collect()
        };

        ThresholdState {
            tau: d * state.tau + (1.0 - d) * batch.max_prob_mean,
            p: blend(&state.p, &batch.prob_mean),
            hist: blend(&state.hist, &batch.hist),
        }
    }

    /// An empty batch returns the state unchanged
    pub fn update_from_probs(&self, state: &ThresholdState, probs: &[f32]) -> ThresholdState {
        match BatchStats::from_probs(probs, state.num_classes()) {
            Some(batch) => self.update(state, &batch),
            None => state.clone(),
        }
    }
}

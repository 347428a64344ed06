//! Self-adaptive threshold (SAT) loss.
//!
//! Weak-view predictions become hard pseudo-labels for the strong view when
//! their confidence clears the class threshold `p_c / max(p) * tau`. The
//! statistics are updated with this batch before the mask is taken.

use burn::prelude::*;
use burn::tensor::activation::softmax;

use crate::losses::{host_floats, masked_cross_entropy};
use crate::stats::{row_argmax, StatTracker, ThresholdState};

pub struct SatOutput<B: Backend> {
    /// Masked cross-entropy, shape `[1]`
    pub loss: Tensor<B, 1>,
    /// One 0/1 decision per unlabeled sample
    pub mask: Vec<f32>,
    pub mask_ratio: f32,
    pub pseudo_labels: Vec<usize>,
    /// Statistics after this batch
    pub state: ThresholdState,
}

/// Hard pseudo-labels and their confidence gate
#[derive(Debug, Clone, PartialEq)]
pub struct PseudoLabels {
    pub labels: Vec<usize>,
    pub max_probs: Vec<f32>,
    pub mask: Vec<f32>,
}

impl PseudoLabels {
    pub fn num_accepted(&self) -> usize {
        self.mask.iter().filter(|m| **m > 0.0).count()
    }
}

/// `mask_i = max_c P[i, c] >= thresholds[argmax_c P[i, c]]`
pub fn confidence_mask(probs: &[f32], num_classes: usize, thresholds: &[f32]) -> PseudoLabels {
    let mut labels = Vec::new();
    let mut max_probs = Vec::new();
    let mut mask = Vec::new();

    for row in probs.chunks_exact(num_classes.max(1)) {
        let (label, max) = row_argmax(row);
        labels.push(label);
        max_probs.push(max);
        mask.push(if max >= thresholds[label] { 1.0 } else { 0.0 });
    }

    PseudoLabels {
        labels,
        max_probs,
        mask,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SelfAdaptiveThresholdLoss {
    tracker: StatTracker,
}

impl SelfAdaptiveThresholdLoss {
    pub fn new(sat_ema: f32) -> Self {
        Self {
            tracker: StatTracker::new(sat_ema),
        }
    }

    pub fn forward<B: Backend>(
        &self,
        logits_weak: Tensor<B, 2>,
        logits_strong: Tensor<B, 2>,
        state: &ThresholdState,
    ) -> SatOutput<B> {
        let device = logits_strong.device();
        let [n, num_classes] = logits_weak.dims();

        if n == 0 {
            return SatOutput {
                loss: Tensor::zeros([1], &device),
                mask: Vec::new(),
                mask_ratio: 0.0,
                pseudo_labels: Vec::new(),
                state: state.clone(),
            };
        }

        let probs = host_floats(softmax(logits_weak.detach(), 1));
        let state = self.tracker.update_from_probs(state, &probs);
        let pseudo = confidence_mask(&probs, num_classes, &state.class_thresholds());

        let targets: Vec<i64> = pseudo.labels.iter().map(|&l| l as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(targets, [n]), &device);
        let mask = Tensor::<B, 1>::from_data(TensorData::new(pseudo.mask.clone(), [n]), &device);

        let loss = masked_cross_entropy(logits_strong, targets, mask);
        let mask_ratio = pseudo.num_accepted() as f32 / n as f32;

        SatOutput {
            loss,
            mask: pseudo.mask,
            mask_ratio,
            pseudo_labels: pseudo.labels,
            state,
        }
    }
}

//! Self-adaptive fairness (SAF) loss.
//!
//! Both distributions are de-biased by the inverse of a label histogram and
//! renormalized:
//!
//! - target: `Norm(p / hist)` from the running statistics
//! - prediction: `Norm(mean_masked(softmax(strong)) / hist_s)` where `hist_s`
//!   is the argmax histogram of the accepted strong predictions
//!
//! The loss is the cross-entropy `-sum(target * ln(prediction))`, which is
//! smallest when the accepted strong predictions spread over classes like
//! the de-biased target instead of collapsing onto frequent ones.

use burn::prelude::*;
use burn::tensor::activation::softmax;

use crate::losses::host_floats;
use crate::stats::{row_argmax, ThresholdState};

const LOG_EPS: f32 = 1e-12;

pub struct SafOutput<B: Backend> {
    /// Shape `[1]`
    pub loss: Tensor<B, 1>,
    /// Normalized masked mean of the strong probabilities
    pub hist_p_ulb_s: Vec<f32>,
}

/// `1 / x`, with 0 wherever the reciprocal is not finite
fn inverse_or_zero(values: &[f32]) -> Vec<f32> {
    values
        .iter()
        .map(|v| {
            let inv = 1.0 / v;
            if inv.is_finite() {
                inv
            } else {
                0.0
            }
        })
        .collect()
}

/// Scale to sum 1; an all-zero vector becomes uniform
fn sum_normalize(values: &[f32]) -> Vec<f32> {
    let sum: f32 = values.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        values.iter().map(|v| v / sum).collect()
    } else {
        vec![1.0 / values.len().max(1) as f32; values.len()]
    }
}

/// Target distribution built from the running statistics
pub fn fairness_target(state: &ThresholdState) -> Vec<f32> {
    let inv_hist = inverse_or_zero(&state.hist);
    let weighted: Vec<f32> = state.p.iter().zip(&inv_hist).map(|(p, w)| p * w).collect();
    sum_normalize(&weighted)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SelfAdaptiveFairnessLoss;

impl SelfAdaptiveFairnessLoss {
    pub fn new() -> Self {
        Self
    }

    pub fn forward<B: Backend>(
        &self,
        mask: &[f32],
        logits_strong: Tensor<B, 2>,
        state: &ThresholdState,
    ) -> SafOutput<B> {
        let device = logits_strong.device();
        let [n, num_classes] = logits_strong.dims();
        let mask_sum: f32 = mask.iter().sum();

        if n == 0 || mask_sum <= 0.0 {
            return SafOutput {
                loss: Tensor::zeros([1], &device),
                hist_p_ulb_s: vec![0.0; num_classes],
            };
        }

        let probs = softmax(logits_strong, 1);
        let host_probs = host_floats(probs.clone().detach());

        let mut hist_s = vec![0.0f32; num_classes];
        for (row, m) in host_probs.chunks_exact(num_classes).zip(mask) {
            if *m > 0.0 {
                hist_s[row_argmax(row).0] += 1.0;
            }
        }
        let hist_s: Vec<f32> = hist_s.into_iter().map(|c| c / mask_sum).collect();

        let mask_t = Tensor::<B, 2>::from_data(TensorData::new(mask.to_vec(), [n, 1]), &device);
        let mean_probs = (probs * mask_t).sum_dim(0) / mask_sum;

        let inv_hist_s = Tensor::<B, 2>::from_data(
            TensorData::new(inverse_or_zero(&hist_s), [1, num_classes]),
            &device,
        );
        let weighted = mean_probs.clone() * inv_hist_s;
        let prediction = weighted.clone() / weighted.sum_dim(1);

        let target = Tensor::<B, 2>::from_data(
            TensorData::new(fairness_target(state), [1, num_classes]),
            &device,
        );
        let loss = (target * (prediction + LOG_EPS).log()).sum().neg();

        let hist_p_ulb_s = sum_normalize(&host_floats(mean_probs.detach()));

        SafOutput { loss, hist_p_ulb_s }
    }
}

//! Tensor helpers shared by the loss modules.

use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use burn::tensor::ElementConversion;

/// Copy a float tensor to host memory, row-major
pub fn host_floats<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

/// Copy an int tensor to host memory, row-major
pub fn host_ints<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> Vec<i64> {
    tensor.into_data().iter::<i64>().collect()
}

pub fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f32 {
    tensor.into_scalar().elem::<f32>()
}

/// `-log softmax(logits)[i, target_i]` for every row
pub fn per_sample_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let [n, _] = logits.dims();
    log_softmax(logits, 1)
        .gather(1, targets.reshape([n, 1]))
        .reshape([n])
        .neg()
}

/// `mean_i(ce_i * mask_i)`; rejected rows still count in the denominator
pub fn masked_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
    mask: Tensor<B, 1>,
) -> Tensor<B, 1> {
    (per_sample_cross_entropy(logits, targets) * mask).mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_per_sample_cross_entropy() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats([[0.0, 0.0], [2.0, 0.0]], &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_ints([0, 1], &device);

        let ce = host_floats(per_sample_cross_entropy(logits, targets));
        assert!((ce[0] - 2f32.ln()).abs() < 1e-5);
        let expected = -(1.0f32 / (1.0 + 2f32.exp())).ln();
        assert!((ce[1] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_host_ints_roundtrip() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 1, Int>::from_ints([3, 1, 2], &device);
        assert_eq!(host_ints(t), vec![3, 1, 2]);
    }
}

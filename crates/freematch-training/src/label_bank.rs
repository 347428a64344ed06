//! Per-sample memory of the last weak/strong probabilities.
//!
//! Every unlabeled sample index owns two probability rows. The consistency
//! term compares how far each view moved since the sample was last seen;
//! afterwards the rows are overwritten with this iteration's probabilities.
//! Indices that are not visited keep their old rows.

use burn::nn::loss::{MseLoss, Reduction};
use burn::prelude::*;

use crate::losses::host_floats;

#[derive(Debug, Clone)]
pub struct PseudoLabelBank {
    num_classes: usize,
    weak: Vec<f32>,
    strong: Vec<f32>,
}

impl PseudoLabelBank {
    /// Every row starts uniform at `1 / num_classes`
    pub fn new(num_samples: usize, num_classes: usize) -> Self {
        let value = 1.0 / num_classes.max(1) as f32;
        Self {
            num_classes,
            weak: vec![value; num_samples * num_classes],
            strong: vec![value; num_samples * num_classes],
        }
    }

    pub fn len(&self) -> usize {
        if self.num_classes == 0 {
            0
        } else {
            self.weak.len() / self.num_classes
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn row(&self, index: usize) -> std::ops::Range<usize> {
        assert!(
            index < self.len(),
            "pseudo-label bank index {} out of range ({} samples)",
            index,
            self.len()
        );
        index * self.num_classes..(index + 1) * self.num_classes
    }

    /// `(weak, strong)` rows stored for `index`
    pub fn read(&self, index: usize) -> (&[f32], &[f32]) {
        let range = self.row(index);
        (&self.weak[range.clone()], &self.strong[range])
    }

    pub fn write(&mut self, index: usize, weak: &[f32], strong: &[f32]) {
        let range = self.row(index);
        self.weak[range.clone()].copy_from_slice(weak);
        self.strong[range].copy_from_slice(strong);
    }

    /// Row-major `[indices.len(), C]` copies of the weak and strong rows
    pub fn gather(&self, indices: &[usize]) -> (Vec<f32>, Vec<f32>) {
        let mut weak = Vec::with_capacity(indices.len() * self.num_classes);
        let mut strong = Vec::with_capacity(indices.len() * self.num_classes);
        for &index in indices {
            let (w, s) = self.read(index);
            weak.extend_from_slice(w);
            strong.extend_from_slice(s);
        }
        (weak, strong)
    }

    /// `MSE(probs_w - bank_w[idx], probs_s - bank_s[idx])`, then stores the
    /// detached probabilities for `indices`.
    ///
    /// A repeated index inside one batch keeps the last row written.
    pub fn consistency_loss<B: Backend>(
        &mut self,
        indices: &[usize],
        probs_weak: Tensor<B, 2>,
        probs_strong: Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        let device = probs_weak.device();
        let [n, num_classes] = probs_weak.dims();
        assert_eq!(n, indices.len(), "one bank index per unlabeled sample");
        assert_eq!(num_classes, self.num_classes, "bank class count");

        if n == 0 {
            return Tensor::zeros([1], &device);
        }

        let (old_weak, old_strong) = self.gather(indices);
        let old_weak = Tensor::<B, 2>::from_data(TensorData::new(old_weak, [n, num_classes]), &device);
        let old_strong =
            Tensor::<B, 2>::from_data(TensorData::new(old_strong, [n, num_classes]), &device);

        let shift_weak = probs_weak.clone() - old_weak;
        let shift_strong = probs_strong.clone() - old_strong;
        let loss = MseLoss::new().forward(shift_weak, shift_strong, Reduction::Mean);

        let new_weak = host_floats(probs_weak.detach());
        let new_strong = host_floats(probs_strong.detach());
        for (row, &index) in indices.iter().enumerate() {
            let range = row * num_classes..(row + 1) * num_classes;
            self.write(index, &new_weak[range.clone()], &new_strong[range]);
        }

        loss
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::losses::scalar;
    use burn_ndarray::NdArray;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_uniform_initialization() {
        let bank = PseudoLabelBank::new(3, 4);
        assert_eq!(bank.len(), 3);
        let (w, s) = bank.read(2);
        assert_eq!(w, &[0.25; 4]);
        assert_eq!(s, &[0.25; 4]);
    }

    #[test]
    fn test_write_then_read_returns_written_rows() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut bank = PseudoLabelBank::new(10, 3);

        for _ in 0..20 {
            let index = rng.gen_range(0..10);
            let weak: Vec<f32> = (0..3).map(|_| rng.gen::<f32>()).collect();
            let strong: Vec<f32> = (0..3).map(|_| rng.gen::<f32>()).collect();
            bank.write(index, &weak, &strong);

            let (w, s) = bank.read(index);
            assert_eq!(w, weak.as_slice());
            assert_eq!(s, strong.as_slice());
        }
    }

    #[test]
    fn test_consistency_loss_and_write_back() {
        let device = Default::default();
        let mut bank = PseudoLabelBank::new(4, 2);

        let weak = Tensor::<TestBackend, 2>::from_floats([[0.9, 0.1], [0.2, 0.8]], &device);
        let strong = Tensor::<TestBackend, 2>::from_floats([[0.7, 0.3], [0.2, 0.8]], &device);
        let loss = scalar(bank.consistency_loss(&[1, 3], weak, strong));

        // shifts: weak - 0.5 and strong - 0.5 differ only in row 0 by 0.2
        let expected = (0.2f32 * 0.2 * 2.0) / 4.0;
        assert!((loss - expected).abs() < 1e-6);

        assert_eq!(bank.read(1).0, &[0.9, 0.1]);
        assert_eq!(bank.read(1).1, &[0.7, 0.3]);
        assert_eq!(bank.read(3).0, &[0.2, 0.8]);
        // untouched rows keep the initial value
        assert_eq!(bank.read(0).0, &[0.5, 0.5]);
    }

    #[test]
    fn test_identical_drift_has_zero_loss() {
        let device = Default::default();
        let mut bank = PseudoLabelBank::new(2, 2);
        let probs = Tensor::<TestBackend, 2>::from_floats([[0.6, 0.4]], &device);
        let loss = bank.consistency_loss(&[0], probs.clone(), probs);
        assert_eq!(scalar(loss), 0.0);
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_index_panics() {
        let bank = PseudoLabelBank::new(2, 2);
        let _ = bank.read(2);
    }
}

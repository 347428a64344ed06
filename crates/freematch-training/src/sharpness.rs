//! Sharpness-aware weight perturbation.
//!
//! The perturbation points along the labeled-loss gradient with length
//! `rho`: `eps = g * rho / ||g||`. [`perturbed`] applies it, runs a closure
//! against the perturbed model and puts the original tensors back,
//! normalization running statistics included.

use burn::module::AutodiffModule;
use burn::optim::GradientsParams;
use burn::tensor::backend::AutodiffBackend;
use tracing::debug;

use crate::params::{grad_norm, scale_grads, shift_params, ParamSnapshot};

pub struct Perturbation {
    deltas: GradientsParams,
    grad_norm: f32,
    scale: f32,
    empty: bool,
}

impl Perturbation {
    /// No-op perturbation
    pub fn none() -> Self {
        Self {
            deltas: GradientsParams::new(),
            grad_norm: 0.0,
            scale: 0.0,
            empty: true,
        }
    }

    pub fn deltas(&self) -> &GradientsParams {
        &self.deltas
    }

    pub fn grad_norm(&self) -> f32 {
        self.grad_norm
    }

    /// `rho / ||g||`, or 0 for an empty perturbation
    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SharpnessPerturbation {
    rho: f32,
}

impl SharpnessPerturbation {
    pub fn new(rho: f32) -> Self {
        Self { rho }
    }

    pub fn rho(&self) -> f32 {
        self.rho
    }

    /// A model without gradients, or with a zero or non-finite gradient
    /// norm, gets an empty perturbation.
    pub fn compute<B: AutodiffBackend, M: AutodiffModule<B>>(
        &self,
        model: &M,
        grads: &GradientsParams,
    ) -> Perturbation {
        let norm = match grad_norm(model, grads) {
            Some(norm) if norm > 0.0 && norm.is_finite() => norm,
            other => {
                debug!("Skipping sharpness perturbation, gradient norm {:?}", other);
                return Perturbation::none();
            }
        };

        let scale = self.rho / norm;
        Perturbation {
            deltas: scale_grads(model, grads, scale),
            grad_norm: norm,
            scale,
            empty: false,
        }
    }
}

/// Runs `f` on `model + eps` and returns the restored model with the
/// closure's result.
///
/// Every float tensor is restored from a snapshot taken before the shift,
/// so running statistics updated inside `f` are discarded as well.
pub fn perturbed<B, M, T, F>(model: M, perturbation: &Perturbation, f: F) -> (M, T)
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    F: FnOnce(&M) -> T,
{
    if perturbation.is_empty() {
        let out = f(&model);
        return (model, out);
    }

    let snapshot = ParamSnapshot::capture(&model);
    let shifted = shift_params(model, perturbation.deltas(), 1.0);
    let out = f(&shifted);
    (snapshot.restore(shifted), out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::losses::host_floats;
    use burn::backend::Autodiff;
    use burn::nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig};
    use burn::prelude::*;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    #[derive(Module, Debug)]
    struct Probe<B: Backend> {
        linear: Linear<B>,
        norm: BatchNorm<B, 1>,
    }

    impl<B: Backend> Probe<B> {
        fn new(device: &B::Device) -> Self {
            Self {
                linear: LinearConfig::new(4, 3).init(device),
                norm: BatchNormConfig::new(3).init(device),
            }
        }

        fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
            // [N, 3] -> [N, 3, 1] for the batch norm and back
            let [n, _] = x.dims();
            let y = self.linear.forward(x).reshape([n, 3, 1]);
            self.norm.forward(y).reshape([n, 3])
        }
    }

    fn all_floats(model: &Probe<TestBackend>) -> Vec<f32> {
        let mut values = host_floats(model.linear.weight.val().inner());
        values.extend(host_floats(model.norm.running_mean.value().inner()));
        values.extend(host_floats(model.norm.running_var.value().inner()));
        values
    }

    fn input() -> Tensor<TestBackend, 2> {
        Tensor::from_floats(
            [[1.0, 2.0, -1.0, 0.5], [0.0, -1.0, 3.0, 1.0], [2.0, 0.5, 0.5, -2.0]],
            &Default::default(),
        )
    }

    fn labeled_grads(model: &Probe<TestBackend>) -> GradientsParams {
        let loss = model.linear.forward(input()).powf_scalar(2.0).mean();
        GradientsParams::from_grads(loss.backward(), model)
    }

    #[test]
    fn test_perturb_then_restore_is_identity() {
        let model = Probe::<TestBackend>::new(&Default::default());
        let grads = labeled_grads(&model);
        let before = all_floats(&model);

        let pert = SharpnessPerturbation::new(0.05).compute(&model, &grads);
        assert!(!pert.is_empty());
        assert!((pert.scale() * pert.grad_norm() - 0.05).abs() < 1e-6);

        let (restored, inside) = perturbed(model, &pert, |m| {
            // this forward also moves the running statistics
            let _ = m.forward(input());
            host_floats(m.linear.weight.val().inner())
        });

        assert_ne!(&inside[..], &before[..12]);
        assert_eq!(all_floats(&restored), before);
    }

    #[test]
    fn test_perturbation_length_is_rho() {
        let model = Probe::<TestBackend>::new(&Default::default());
        let grads = labeled_grads(&model);
        let pert = SharpnessPerturbation::new(0.1).compute(&model, &grads);

        let eps_norm = grad_norm(&model, pert.deltas()).unwrap();
        assert!((eps_norm - 0.1).abs() < 1e-4);
    }

    #[test]
    fn test_no_grads_means_no_perturbation() {
        let model = Probe::<TestBackend>::new(&Default::default());
        let before = all_floats(&model);
        let pert = SharpnessPerturbation::new(0.05).compute(&model, &GradientsParams::new());
        assert!(pert.is_empty());

        let (model, called) = perturbed(model, &pert, |_| true);
        assert!(called);
        assert_eq!(all_floats(&model), before);
    }
}

//! Optimizer construction and optimizer-state persistence.

use std::path::Path;

use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamW, AdamWConfig, Optimizer, Sgd, SgdConfig};
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::AutodiffBackend;
use freematch_core::{Error, OptimizerConfig, Result};

pub type SgdOptimizer<M, B> = OptimizerAdaptor<Sgd<<B as AutodiffBackend>::InnerBackend>, M, B>;
pub type AdamWOptimizer<M, B> = OptimizerAdaptor<AdamW, M, B>;

/// SGD with (optionally Nesterov) momentum and L2 weight decay
pub fn sgd<B: AutodiffBackend, M: AutodiffModule<B>>(config: &OptimizerConfig) -> SgdOptimizer<M, B> {
    let momentum = (config.momentum > 0.0).then(|| {
        MomentumConfig::new()
            .with_momentum(config.momentum)
            .with_nesterov(config.nesterov)
    });
    let weight_decay = (config.weight_decay > 0.0).then(|| WeightDecayConfig::new(config.weight_decay));

    SgdConfig::new()
        .with_momentum(momentum)
        .with_weight_decay(weight_decay)
        .init()
}

/// AdamW with decoupled weight decay
pub fn adamw<B: AutodiffBackend, M: AutodiffModule<B>>(config: &OptimizerConfig) -> AdamWOptimizer<M, B> {
    AdamWConfig::new()
        .with_weight_decay(config.weight_decay)
        .init()
}

fn recorder() -> BinFileRecorder<FullPrecisionSettings> {
    BinFileRecorder::<FullPrecisionSettings>::new()
}

/// Write the optimizer state to `path` (`.bin` is appended)
pub fn save_optimizer<B, M, O>(optimizer: &O, path: &Path) -> Result<()>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    Recorder::<B>::record(&recorder(), optimizer.to_record(), path.to_path_buf())
        .map_err(|e| Error::Checkpoint(format!("Failed to save optimizer state to {}: {e}", path.display())))?;
    Ok(())
}

/// Restore the optimizer state saved by [`save_optimizer`]
pub fn load_optimizer<B, M, O>(optimizer: O, path: &Path, device: &B::Device) -> Result<O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let record = Recorder::<B>::load(&recorder(), path.to_path_buf(), device)
        .map_err(|e| Error::Checkpoint(format!("Failed to load optimizer state from {}: {e}", path.display())))?;
    Ok(optimizer.load_record(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::nn::{Linear, LinearConfig};
    use burn::optim::GradientsParams;
    use burn::prelude::*;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn train_once<O: Optimizer<Linear<TestBackend>, TestBackend>>(
        model: Linear<TestBackend>,
        optimizer: &mut O,
    ) -> Linear<TestBackend> {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::from_floats([[1.0, -1.0]], &device);
        let loss = model.forward(x).powf_scalar(2.0).sum();
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        optimizer.step(0.1, model, grads)
    }

    #[test]
    fn test_sgd_moves_parameters() {
        let model: Linear<TestBackend> = LinearConfig::new(2, 2).init(&Default::default());
        let before = model.weight.val().into_data();
        let mut optimizer = sgd::<TestBackend, Linear<TestBackend>>(&OptimizerConfig::default());
        let model = train_once(model, &mut optimizer);
        assert_ne!(model.weight.val().into_data(), before);
    }

    #[test]
    fn test_adamw_moves_parameters() {
        let model: Linear<TestBackend> = LinearConfig::new(2, 2).init(&Default::default());
        let before = model.weight.val().into_data();
        let mut optimizer: AdamWOptimizer<Linear<TestBackend>, TestBackend> =
            adamw(&OptimizerConfig::default());
        let model = train_once(model, &mut optimizer);
        assert_ne!(model.weight.val().into_data(), before);
    }

    #[test]
    fn test_optimizer_state_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("optimizer");
        let device = Default::default();

        let model: Linear<TestBackend> = LinearConfig::new(2, 2).init(&device);
        let mut optimizer = adamw::<TestBackend, Linear<TestBackend>>(&OptimizerConfig::default());
        let _model = train_once(model, &mut optimizer);

        save_optimizer::<TestBackend, Linear<TestBackend>, _>(&optimizer, &path).unwrap();
        assert!(temp_dir.path().join("optimizer.bin").exists());

        let fresh = adamw::<TestBackend, Linear<TestBackend>>(&OptimizerConfig::default());
        let loaded = load_optimizer::<TestBackend, Linear<TestBackend>, _>(fresh, &path, &device).unwrap();
        assert_eq!(loaded.to_record().len(), optimizer.to_record().len());
    }

    #[test]
    fn test_missing_optimizer_state_is_checkpoint_error() {
        let temp_dir = TempDir::new().unwrap();
        let optimizer = sgd::<TestBackend, Linear<TestBackend>>(&OptimizerConfig::default());
        let result = load_optimizer::<TestBackend, Linear<TestBackend>, _>(
            optimizer,
            &temp_dir.path().join("missing"),
            &Default::default(),
        );
        assert!(matches!(result, Err(Error::Checkpoint(_))));
    }
}

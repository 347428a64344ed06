//! FreeMatch training loop.
//!
//! The loop runs through three phases:
//! - Warmup: supervised steps on labeled batches; after each one the
//!   threshold statistics are recomputed from a full evaluation pass
//! - Train: one labeled and one unlabeled batch per iteration, stepped by
//!   the configured [`StepStrategy`], then scheduler and EMA updates
//! - Eval: every `num_eval_iters` iterations and once at the end, the EMA
//!   model is evaluated and `best_checkpoint` / `last_checkpoint` are written

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use freematch_core::{EvaluationMetrics, FreeMatchConfig, Result, TrainerParams};
use freematch_data::{DataManager, EvalLoader};
use tracing::{info, warn};

use crate::checkpoint::{
    CheckpointManager, TrainerCheckpointState, BEST_CHECKPOINT, LAST_CHECKPOINT,
};
use crate::ema::EmaModel;
use crate::evaluator::Evaluator;
use crate::label_bank::PseudoLabelBank;
use crate::losses::scalar;
use crate::lr_schedule::LearningRateScheduler;
use crate::model::ImageClassifier;
use crate::sink::{MetricsSink, TracingSink};
use crate::stats::{BatchStats, ThresholdState};
use crate::step::{StepContext, StepStrategy, TrainStep, UnsupervisedObjective};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Warmup,
    Train,
    Eval,
    Finished,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Warmup => "warmup",
            Self::Train => "train",
            Self::Eval => "eval",
            Self::Finished => "finished",
        };
        write!(f, "{name}")
    }
}

/// Loop state carried across iterations and checkpoints
#[derive(Debug, Clone, PartialEq)]
pub struct TrainerState {
    pub phase: Phase,
    pub curr_iter: usize,
    pub best_test_acc: f64,
    /// -1 until the first evaluation
    pub best_test_iter: i64,
    pub stats: ThresholdState,
}

impl TrainerState {
    pub fn new(num_classes: usize) -> Self {
        Self {
            phase: Phase::Train,
            curr_iter: 0,
            best_test_acc: -1.0,
            best_test_iter: -1,
            stats: ThresholdState::uniform(num_classes),
        }
    }
}

/// Outcome of [`FreeMatchTrainer::fit`]
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub warmup_iters: usize,
    pub train_iters: usize,
    pub best_test_acc: f64,
    pub best_test_iter: i64,
    pub final_metrics: EvaluationMetrics,
    pub elapsed: Duration,
}

pub struct FreeMatchTrainer<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    params: TrainerParams,
    model: M,
    optimizer: O,
    ema: EmaModel<B, M>,
    scheduler: LearningRateScheduler,
    state: TrainerState,
    bank: PseudoLabelBank,
    strategy: StepStrategy,
    objective: UnsupervisedObjective,
    evaluator: Evaluator,
    checkpoints: CheckpointManager,
    sink: Box<dyn MetricsSink>,
    device: B::Device,
    resumed: bool,
}

impl<B, M, O> FreeMatchTrainer<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ImageClassifier<B>,
    M::InnerModule: ImageClassifier<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    /// `num_unlabeled` sizes the pseudo-label bank
    pub fn new(
        config: &FreeMatchConfig,
        model: M,
        optimizer: O,
        num_unlabeled: usize,
        device: B::Device,
    ) -> Self {
        let params = config.trainer.clone();
        let num_classes = config.dataset.num_classes;

        if params.amp_enabled {
            warn!("Mixed precision is not supported, training runs in full precision");
        }

        let strategy = StepStrategy::from_config(&config.sharpness);
        info!(
            "Trainer: {} steps, {} classes, {} unlabeled samples",
            strategy.name(),
            num_classes,
            num_unlabeled
        );

        Self {
            ema: EmaModel::new(&model, params.ema_decay),
            scheduler: LearningRateScheduler::from_config(
                &config.scheduler,
                config.optimizer.lr,
                params.num_train_iters,
            ),
            state: TrainerState::new(num_classes),
            bank: PseudoLabelBank::new(num_unlabeled, num_classes),
            objective: UnsupervisedObjective::from_params(&params),
            evaluator: Evaluator::new(num_classes),
            checkpoints: CheckpointManager::new(config.output.checkpoint_dir()),
            sink: Box::new(TracingSink),
            strategy,
            params,
            model,
            optimizer,
            device,
            resumed: false,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Restore model, EMA, optimizer, schedule and loop state from a
    /// checkpoint directory. Warmup is skipped afterwards; the pseudo-label
    /// bank restarts from uniform rows.
    pub fn resume(mut self, dir: &Path) -> Result<Self> {
        let num_classes = self.evaluator_classes();
        let loaded = CheckpointManager::load::<B, M, O>(
            dir,
            self.model,
            self.ema.shadow().clone(),
            self.optimizer,
            num_classes,
            &self.device,
        )?;

        self.model = loaded.model;
        self.optimizer = loaded.optimizer;
        self.ema.set_shadow(loaded.ema);
        self.scheduler.load_state(loaded.state.scheduler);
        self.state.curr_iter = loaded.state.curr_iter;
        self.state.best_test_acc = loaded.state.best_test_acc;
        self.state.best_test_iter = loaded.state.best_test_iter;
        self.state.stats = loaded.state.threshold_state();
        self.resumed = true;

        info!(
            "Resumed at iteration {} (best acc {:.4} at iteration {})",
            self.state.curr_iter, self.state.best_test_acc, self.state.best_test_iter
        );
        Ok(self)
    }

    fn evaluator_classes(&self) -> usize {
        self.state.stats.num_classes()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn ema(&self) -> &EmaModel<B, M> {
        &self.ema
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn scheduler(&self) -> &LearningRateScheduler {
        &self.scheduler
    }

    pub fn bank(&self) -> &PseudoLabelBank {
        &self.bank
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Warmup (unless resumed), train, and a final evaluation
    pub fn fit(&mut self, data: &DataManager<B>) -> Result<TrainingSummary> {
        let start = Instant::now();
        let eval_loader = data.eval_loader_on::<B::InnerBackend>(data.device().clone());

        let warmup_iters = if self.resumed {
            if self.params.num_warmup_iters > 0 {
                info!("Resumed run, skipping warmup");
            }
            0
        } else {
            self.warmup(data, &eval_loader)?
        };

        let final_metrics = self.train(data, &eval_loader)?;
        self.state.phase = Phase::Finished;
        self.sink.flush();

        let summary = TrainingSummary {
            warmup_iters,
            train_iters: self.state.curr_iter,
            best_test_acc: self.state.best_test_acc,
            best_test_iter: self.state.best_test_iter,
            final_metrics,
            elapsed: start.elapsed(),
        };
        info!(
            "Training finished after {} iterations in {:.1}s, best acc {:.4} at iteration {}",
            summary.train_iters,
            summary.elapsed.as_secs_f64(),
            summary.best_test_acc,
            summary.best_test_iter
        );
        Ok(summary)
    }

    /// Supervised warmup. Returns the number of iterations run and leaves
    /// `curr_iter` at zero.
    pub fn warmup(&mut self, data: &DataManager<B>, eval_loader: &EvalLoader<B::InnerBackend>) -> Result<usize> {
        let budget = self.params.num_warmup_iters;
        if budget == 0 {
            return Ok(0);
        }

        info!("Starting warmup training on labeled data for {budget} iterations");
        self.state.phase = Phase::Warmup;
        let num_classes = self.evaluator_classes();
        let mut labeled = data.labeled_loader();
        let mut fetch_start = Instant::now();

        while self.state.curr_iter < budget {
            let Some(batch) = labeled.next() else {
                info!("Labeled loader exhausted after {} warmup iterations", self.state.curr_iter);
                break;
            };
            let fetch_time = fetch_start.elapsed().as_secs_f64();
            let run_start = Instant::now();
            let lr = self.scheduler.get_lr();

            let logits = self.model.forward(batch.images);
            let loss = CrossEntropyLossConfig::new()
                .init(&logits.device())
                .forward(logits, batch.labels);
            let grads = GradientsParams::from_grads(loss.backward(), &self.model);
            self.model = self.optimizer.step(lr, self.model.clone(), grads);

            // statistics come from a full pass, replacing the previous values
            let probs = self
                .evaluator
                .collect_probabilities(&self.model.valid(), eval_loader);
            if let Some(stats) = BatchStats::from_probs(&probs, num_classes) {
                self.state.stats = ThresholdState::from_batch(&stats);
            }

            B::sync(&self.device);
            let run_time = run_start.elapsed().as_secs_f64();

            if (self.state.curr_iter + 1) % self.params.num_log_iters == 0 {
                let mut log = BTreeMap::new();
                log.insert("warmup/loss".to_string(), scalar(loss) as f64);
                log.insert("warmup/lr".to_string(), lr);
                log.insert("warmup/fetch_time".to_string(), fetch_time);
                log.insert("warmup/run_time".to_string(), run_time);
                self.sink.update(&log, self.state.curr_iter);
            }

            self.state.curr_iter += 1;
            fetch_start = Instant::now();
        }

        let done = self.state.curr_iter;
        self.state.curr_iter = 0;
        // the shadow starts tracking from the warmed-up weights
        self.ema = EmaModel::new(&self.model, self.params.ema_decay);
        info!(
            "Warmup done after {done} iterations (tau {:.4}), evaluating",
            self.state.stats.tau
        );
        self.validate(eval_loader);
        Ok(done)
    }

    fn train(&mut self, data: &DataManager<B>, eval_loader: &EvalLoader<B::InnerBackend>) -> Result<EvaluationMetrics> {
        let total = self.params.num_train_iters;
        info!("Starting model training at iteration {} of {total}", self.state.curr_iter);
        self.state.phase = Phase::Train;

        let mut batches = data.labeled_loader().zip(data.unlabeled_loader());
        let mut last_metrics = None;
        let mut fetch_start = Instant::now();

        while self.state.curr_iter < total {
            let Some((labeled, unlabeled)) = batches.next() else {
                info!("Loaders exhausted at iteration {}", self.state.curr_iter);
                break;
            };
            let fetch_time = fetch_start.elapsed().as_secs_f64();
            let run_start = Instant::now();
            let lr = self.scheduler.get_lr();

            let ctx = StepContext {
                objective: &self.objective,
                bank: &mut self.bank,
                state: &self.state.stats,
                lr,
            };
            let output = TrainStep::<B>::step(
                &self.strategy,
                self.model.clone(),
                &mut self.optimizer,
                labeled,
                unlabeled,
                ctx,
            );
            self.model = output.model;
            self.state.stats = output.state;
            self.scheduler.step();
            self.ema.update(&self.model);

            B::sync(&self.device);
            let run_time = run_start.elapsed().as_secs_f64();

            self.state.curr_iter += 1;
            let it = self.state.curr_iter - 1;
            let is_eval = (it + 1) % self.params.num_eval_iters == 0;
            let is_log = (it + 1) % self.params.num_log_iters == 0;

            if is_eval || is_log {
                let mut log = output.metrics.to_log_map();
                log.insert("train/lr".to_string(), lr);
                log.insert("train/fetch_time".to_string(), fetch_time);
                log.insert("train/run_time".to_string(), run_time);

                if is_eval {
                    info!("Evaluating...");
                    let (metrics, eval_log) = self.evaluate_and_checkpoint(eval_loader)?;
                    log.extend(eval_log);
                    last_metrics = Some((it, metrics));
                }
                if is_log {
                    info!(
                        "Iteration {}/{} | loss {:.4} | mask {:.3} | tau {:.4} | lr {:.6} | fetch {:.3}s run {:.3}s",
                        it + 1,
                        total,
                        output.metrics.total_loss,
                        output.metrics.mask_ratio,
                        output.metrics.tau_t,
                        lr,
                        fetch_time,
                        run_time
                    );
                }
                self.sink.update(&log, it);
            }

            fetch_start = Instant::now();
        }

        // the final state is evaluated and saved unless the last iteration already did
        let final_iter = self.state.curr_iter.checked_sub(1);
        match last_metrics {
            Some((it, metrics)) if Some(it) == final_iter => Ok(metrics),
            _ => {
                info!("Final evaluation");
                let (metrics, eval_log) = self.evaluate_and_checkpoint(eval_loader)?;
                self.sink.update(&eval_log, self.state.curr_iter);
                Ok(metrics)
            }
        }
    }

    /// Evaluate the EMA model, update the best accuracy and write
    /// `best_checkpoint` (on improvement) and `last_checkpoint`.
    ///
    /// Checkpoints store `curr_iter`, the next iteration to run.
    pub fn evaluate_and_checkpoint(
        &mut self,
        eval_loader: &EvalLoader<B::InnerBackend>,
    ) -> Result<(EvaluationMetrics, BTreeMap<String, f64>)> {
        let previous = self.state.phase;
        self.state.phase = Phase::Eval;

        let metrics = self.evaluator.evaluate(self.ema.shadow(), eval_loader);
        // last completed iteration, -1 before any
        let it = self.state.curr_iter as i64 - 1;

        if metrics.accuracy > self.state.best_test_acc {
            self.state.best_test_acc = metrics.accuracy;
            self.state.best_test_iter = it;
            self.save(BEST_CHECKPOINT)?;
        }
        self.save(LAST_CHECKPOINT)?;

        info!(
            "Iteration {}: {} | best acc {:.4} at iteration {}",
            it,
            metrics.summary(),
            self.state.best_test_acc,
            self.state.best_test_iter
        );

        let mut log = metrics.to_log_map();
        log.insert("best_acc".to_string(), self.state.best_test_acc);
        log.insert("best_iter".to_string(), self.state.best_test_iter as f64);

        self.state.phase = previous;
        Ok((metrics, log))
    }

    fn save(&self, name: &str) -> Result<()> {
        let state = TrainerCheckpointState::new(
            self.state.curr_iter,
            self.state.best_test_iter,
            self.state.best_test_acc,
            &self.state.stats,
            self.scheduler.state(),
        );
        self.checkpoints
            .save::<B, M, O>(name, &self.model, self.ema.shadow(), &self.optimizer, &state)?;
        Ok(())
    }

    /// Evaluate the EMA model and log the per-class report
    pub fn validate(&self, eval_loader: &EvalLoader<B::InnerBackend>) -> EvaluationMetrics {
        let metrics = self.evaluator.evaluate(self.ema.shadow(), eval_loader);
        Evaluator::log_report(&metrics, None);
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CnnLiteConfig, FreeMatchModel};
    use crate::optim::{sgd, SgdOptimizer};
    use crate::sink::JsonlSink;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use freematch_core::DatasetConfig;
    use freematch_data::ImageItem;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::fs;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;
    type TestModel = FreeMatchModel<TestBackend>;
    type TestTrainer = FreeMatchTrainer<TestBackend, TestModel, SgdOptimizer<TestModel, TestBackend>>;

    const NUM_CLASSES: usize = 3;

    fn items(seed: u64, n: usize) -> Vec<ImageItem> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|i| ImageItem {
                pixels: (0..3 * 8 * 8).map(|_| rng.gen_range(0.0..1.0)).collect(),
                label: i % NUM_CLASSES,
            })
            .collect()
    }

    fn config(log_dir: &Path, iters: usize, warmup: usize) -> FreeMatchConfig {
        let mut config = FreeMatchConfig::default();
        config.trainer.num_train_iters = iters;
        config.trainer.num_eval_iters = 2;
        config.trainer.num_log_iters = 1;
        config.trainer.num_warmup_iters = warmup;
        config.dataset = DatasetConfig {
            num_classes: NUM_CLASSES,
            num_labels: 6,
            batch_size: 2,
            uratio: 1,
            eval_batch_size: 4,
            image_size: 8,
            ..DatasetConfig::default()
        };
        config.output.log_dir = log_dir.to_path_buf();
        config.output.run_name = "test".into();
        config
    }

    fn data(config: &FreeMatchConfig, loader_iters: usize) -> DataManager<TestBackend> {
        DataManager::from_items(
            items(1, 24),
            items(2, 6),
            config.dataset.clone(),
            loader_iters,
            config.seed,
            Default::default(),
        )
        .unwrap()
    }

    fn trainer(config: &FreeMatchConfig, data: &DataManager<TestBackend>) -> TestTrainer {
        let device = Default::default();
        let model = FreeMatchModel::CnnLite(CnnLiteConfig::new(NUM_CLASSES).with_base_filters(4).init(&device));
        let optimizer = sgd::<TestBackend, TestModel>(&config.optimizer);
        FreeMatchTrainer::new(config, model, optimizer, data.num_unlabeled(), device)
    }

    fn jsonl(config: &FreeMatchConfig) -> Vec<serde_json::Value> {
        fs::read_to_string(config.output.run_dir().join(JsonlSink::FILE_NAME))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_fit_without_warmup() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let config = config(temp_dir.path(), 4, 0);
        let data = data(&config, 4);
        let sink = JsonlSink::create(&config.output.run_dir())?;
        let mut trainer = trainer(&config, &data).with_sink(Box::new(sink));

        // no warmup: training starts from uniform statistics
        assert_eq!(trainer.state().stats, ThresholdState::uniform(NUM_CLASSES));
        assert!((trainer.state().stats.tau - 1.0 / 3.0).abs() < 1e-6);

        let summary = trainer.fit(&data)?;
        assert_eq!(summary.warmup_iters, 0);
        assert_eq!(summary.train_iters, 4);
        assert!(summary.best_test_iter == 1 || summary.best_test_iter == 3);
        assert_eq!(trainer.state().phase, Phase::Finished);
        assert_eq!(trainer.scheduler().current_step(), 4);
        assert_ne!(trainer.state().stats, ThresholdState::uniform(NUM_CLASSES));

        let checkpoint_dir = config.output.checkpoint_dir();
        assert!(checkpoint_dir.join(BEST_CHECKPOINT).join("model.mpk").exists());
        let last = TrainerCheckpointState::load(
            &checkpoint_dir.join(LAST_CHECKPOINT).join("state.json"),
            NUM_CLASSES,
        )?;
        assert_eq!(last.curr_iter, 4);
        assert_eq!(last.threshold_state(), trainer.state().stats);

        // one line per iteration, two of them carrying evaluation results
        let lines = jsonl(&config);
        assert_eq!(lines.len(), 4);
        let evals = lines.iter().filter(|l| !l["validation/accuracy"].is_null()).count();
        assert_eq!(evals, 2);
        assert!(lines.iter().all(|l| !l["train/mask_ratio"].is_null()));
        Ok(())
    }

    #[test]
    fn test_warmup_overwrites_statistics() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let config = config(temp_dir.path(), 4, 2);
        let data = data(&config, 4);
        let mut trainer = trainer(&config, &data);
        let eval_loader = data.eval_loader_on::<NdArray<f32>>(Default::default());

        let done = trainer.warmup(&data, &eval_loader)?;
        assert_eq!(done, 2);
        assert_eq!(trainer.state().curr_iter, 0);

        let probs = Evaluator::new(NUM_CLASSES).collect_probabilities(&trainer.model().valid(), &eval_loader);
        let expected = ThresholdState::from_batch(&BatchStats::from_probs(&probs, NUM_CLASSES).unwrap());
        let stats = &trainer.state().stats;
        assert!((stats.tau - expected.tau).abs() < 1e-5);
        for (a, b) in stats.p.iter().zip(&expected.p) {
            assert!((a - b).abs() < 1e-5);
        }
        assert!((stats.hist.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_resume_continues_from_checkpoint() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let first_config = config(temp_dir.path(), 4, 0);
        let first_data = data(&first_config, 4);
        let mut first = trainer(&first_config, &first_data);
        let first_summary = first.fit(&first_data)?;

        let config = config(temp_dir.path(), 6, 1);
        let data = data(&config, 6);
        let last = config.output.checkpoint_dir().join(LAST_CHECKPOINT);
        let mut resumed = trainer(&config, &data).resume(&last)?;

        assert_eq!(resumed.state().curr_iter, 4);
        assert_eq!(resumed.state().best_test_acc, first_summary.best_test_acc);
        assert_eq!(resumed.state().best_test_iter, first_summary.best_test_iter);
        assert_eq!(resumed.state().stats, first.state().stats);
        assert_eq!(resumed.scheduler().current_step(), 4);

        let summary = resumed.fit(&data)?;
        assert_eq!(summary.warmup_iters, 0);
        assert_eq!(summary.train_iters, 6);
        Ok(())
    }

    #[test]
    fn test_loader_exhaustion_ends_training() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let config = config(temp_dir.path(), 10, 0);
        let data = data(&config, 3);
        let mut trainer = trainer(&config, &data);

        let summary = trainer.fit(&data)?;
        assert_eq!(summary.train_iters, 3);

        // the final evaluation saved the state after the third iteration
        let last = TrainerCheckpointState::load(
            &config.output.checkpoint_dir().join(LAST_CHECKPOINT).join("state.json"),
            NUM_CLASSES,
        )?;
        assert_eq!(last.curr_iter, 3);
        Ok(())
    }

    #[test]
    fn test_sharpness_aware_training_runs() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config(temp_dir.path(), 2, 0);
        config.sharpness.enabled = true;
        config.sharpness.rho = 0.05;
        config.trainer.po_loss_enabled = true;
        let data = data(&config, 2);
        let sink = JsonlSink::create(&config.output.run_dir())?;
        let mut trainer = trainer(&config, &data).with_sink(Box::new(sink));

        let summary = trainer.fit(&data)?;
        assert_eq!(summary.train_iters, 2);
        assert!(summary.final_metrics.loss.is_finite());

        let lines = jsonl(&config);
        assert!(lines.iter().all(|l| !l["train/sharpness_grad_norm"].is_null()));
        Ok(())
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::Warmup.to_string(), "warmup");
        assert_eq!(Phase::Eval.to_string(), "eval");
    }
}

//! FreeMatch training CLI.
//!
//! Loads a TOML run configuration, applies command-line overrides and runs
//! warmup, training and evaluation, or evaluates a checkpoint with
//! `--validate-only`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::optim::Optimizer;
use clap::Parser;
use colored::Colorize;
use freematch_core::{
    backend_name, load_toml_config, save_toml_config, select_device, setup_cli_logging,
    DefaultBackend, DefaultDevice, EvaluationMetrics, FreeMatchConfig, OptimizerKind,
    TrainingBackend,
};
use freematch_data::{DataManager, CLASS_NAMES};
use freematch_training::{
    adamw, build_model, sgd, CheckpointManager, Evaluator, FreeMatchModel, FreeMatchTrainer,
    JsonlSink, MetricsSink, MultiSink, TrainingSummary,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

type Model = FreeMatchModel<TrainingBackend>;

/// FreeMatch semi-supervised training
#[derive(Parser, Debug)]
#[command(
    name = "freematch-train",
    about = "Train image classifiers with FreeMatch semi-supervised learning",
    long_about = "Train image classifiers with self-adaptive thresholds, fairness regularization \
                  and optional sharpness-aware updates."
)]
struct Args {
    /// Path to the run configuration (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override the log directory
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Override the number of training iterations
    #[arg(short, long, value_name = "N")]
    iters: Option<usize>,

    /// Override the learning rate
    #[arg(short, long, value_name = "LR")]
    lr: Option<f64>,

    /// Override the labeled batch size
    #[arg(short, long, value_name = "SIZE")]
    batch_size: Option<usize>,

    /// Override the random seed
    #[arg(short, long)]
    seed: Option<u64>,

    /// Enable sharpness-aware updates
    #[arg(long)]
    sharpness: bool,

    /// Perturbation radius of sharpness-aware updates
    #[arg(long, value_name = "RHO")]
    rho: Option<f32>,

    /// Add the pseudo-label consistency term to the loss
    #[arg(long)]
    po_loss: bool,

    /// Resume from a checkpoint directory
    #[arg(short, long, value_name = "DIR")]
    resume: Option<PathBuf>,

    /// Evaluate the EMA model of the resumed checkpoint only
    #[arg(long)]
    validate_only: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Validate the configuration without training
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_cli_logging(args.verbose)?;

    info!("FreeMatch - Training Tool");
    info!("=========================");

    let mut config: FreeMatchConfig =
        load_toml_config(&args.config).context("Failed to load configuration file")?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    print_config_summary(&config);

    if args.dry_run {
        info!("Configuration validated successfully (dry run)");
        return Ok(());
    }

    let device = select_device(&config.device);

    if args.validate_only {
        return run_validation(&config, device);
    }

    let config_path = config.output.run_dir().join("config.toml");
    save_toml_config(&config, &config_path).context("Failed to save configuration")?;
    info!("Configuration saved to: {}", config_path.display());

    let summary = match config.optimizer.kind {
        OptimizerKind::Sgd => {
            let optimizer = sgd::<TrainingBackend, Model>(&config.optimizer);
            run_training(&config, device, optimizer)?
        }
        OptimizerKind::AdamW => {
            let optimizer = adamw::<TrainingBackend, Model>(&config.optimizer);
            run_training(&config, device, optimizer)?
        }
    };

    print_training_summary(&config, &summary);
    Ok(())
}

fn apply_overrides(config: &mut FreeMatchConfig, args: &Args) {
    if let Some(ref output) = args.output {
        config.output.log_dir = output.clone();
    }
    if let Some(iters) = args.iters {
        config.trainer.num_train_iters = iters;
    }
    if let Some(lr) = args.lr {
        config.optimizer.lr = lr;
    }
    if let Some(batch_size) = args.batch_size {
        config.dataset.batch_size = batch_size;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if args.sharpness {
        config.sharpness.enabled = true;
    }
    if let Some(rho) = args.rho {
        config.sharpness.rho = rho;
    }
    if args.po_loss {
        config.trainer.po_loss_enabled = true;
    }
    if let Some(ref resume) = args.resume {
        config.resume.enabled = true;
        config.resume.path = Some(resume.clone());
    }
}

fn resume_path(config: &FreeMatchConfig) -> Option<PathBuf> {
    if config.resume.enabled {
        config.resume.path.clone()
    } else {
        None
    }
}

fn print_config_summary(config: &FreeMatchConfig) {
    info!("");
    info!("Configuration Summary:");
    info!("  Model: {}", config.model.name);
    info!("  Dataset: {} ({} classes, {} labels)", config.dataset.name, config.dataset.num_classes, config.dataset.num_labels);
    info!("  Batch size: {} labeled x {} unlabeled ratio", config.dataset.batch_size, config.dataset.uratio);
    info!("  Iterations: {} (warmup {})", config.trainer.num_train_iters, config.trainer.num_warmup_iters);
    info!("  Optimizer: {} lr={} wd={}", config.optimizer.kind, config.optimizer.lr, config.optimizer.weight_decay);
    info!("  Scheduler: {:?}", config.scheduler.kind);
    info!("  Sharpness-aware: {} (rho {})", config.sharpness.enabled, config.sharpness.rho);
    info!("  Consistency term: {} (ratio {})", config.trainer.po_loss_enabled, config.trainer.po_loss_ratio);
    info!("  Backend: {}", backend_name());
    info!("  Run dir: {}", config.output.run_dir().display());
    info!("");
}

/// Drives a progress bar from the training log updates
struct ProgressSink {
    bar: ProgressBar,
}

impl ProgressSink {
    fn new(total: usize) -> Result<Self> {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} iters ({eta}) {msg}")?
                .progress_chars("=>-"),
        );
        Ok(Self { bar })
    }
}

impl MetricsSink for ProgressSink {
    fn update(&mut self, metrics: &BTreeMap<String, f64>, iteration: usize) {
        let Some(loss) = metrics.get("train/total_loss") else {
            return;
        };
        self.bar.set_position(iteration as u64 + 1);
        let mask = metrics.get("train/mask_ratio").copied().unwrap_or_default();
        self.bar.set_message(format!("loss {loss:.4} mask {mask:.3}"));
    }

    fn flush(&mut self) {
        self.bar.finish_with_message("Training completed");
    }
}

fn run_training<O>(config: &FreeMatchConfig, device: DefaultDevice, optimizer: O) -> Result<TrainingSummary>
where
    O: Optimizer<Model, TrainingBackend>,
{
    info!("Loading dataset...");
    let data = DataManager::<TrainingBackend>::from_config(config, device.clone())?;
    let model = build_model::<TrainingBackend>(&config.model, config.dataset.num_classes, &device)?;

    let mut sink = MultiSink::new().with(ProgressSink::new(config.trainer.num_train_iters)?);
    if config.output.metrics_jsonl {
        let jsonl = JsonlSink::create(&config.output.run_dir())?;
        info!("Writing metrics to {}", jsonl.path().display());
        sink.push(Box::new(jsonl));
    }

    let mut trainer = FreeMatchTrainer::new(config, model, optimizer, data.num_unlabeled(), device)
        .with_sink(Box::new(sink));
    if let Some(dir) = resume_path(config) {
        info!("Resuming from checkpoint: {}", dir.display());
        trainer = trainer.resume(&dir)?;
    }

    Ok(trainer.fit(&data)?)
}

fn run_validation(config: &FreeMatchConfig, device: DefaultDevice) -> Result<()> {
    let dir = resume_path(config).context("--validate-only needs a checkpoint directory (--resume)")?;
    info!("Loading EMA weights from {}", dir.display());

    let data = DataManager::<DefaultBackend>::from_config(config, device.clone())?;
    let model = build_model::<DefaultBackend>(&config.model, config.dataset.num_classes, &device)?;
    let model = CheckpointManager::load_ema::<DefaultBackend, _>(&dir, model, &device)?;

    info!("Running validation...");
    let metrics = Evaluator::new(config.dataset.num_classes).evaluate(&model, &data.eval_loader());
    let class_names = (config.dataset.num_classes == CLASS_NAMES.len()).then_some(&CLASS_NAMES[..]);
    Evaluator::log_report(&metrics, class_names);
    print_validation_results(&metrics);
    Ok(())
}

fn print_validation_results(metrics: &EvaluationMetrics) {
    println!();
    println!("{}", "Validation Results:".cyan().bold());
    println!("  Accuracy:  {:.2}%", metrics.accuracy * 100.0);
    println!("  Precision: {:.4}", metrics.macro_precision);
    println!("  Recall:    {:.4}", metrics.macro_recall);
    println!("  F1:        {:.4}", metrics.macro_f1);
    println!("  Loss:      {:.4}", metrics.loss);
    println!("  Samples:   {}", metrics.total_samples);
}

fn print_training_summary(config: &FreeMatchConfig, summary: &TrainingSummary) {
    println!();
    println!("{}", "Training Complete!".green().bold());
    println!("  Iterations:    {} (warmup {})", summary.train_iters, summary.warmup_iters);
    println!(
        "  Best accuracy: {} at iteration {}",
        format!("{:.2}%", summary.best_test_acc * 100.0).green(),
        summary.best_test_iter
    );
    println!("  Final:         {}", summary.final_metrics.summary());
    println!("  Time:          {:.1}s", summary.elapsed.as_secs_f64());
    println!("  Checkpoints:   {}", config.output.checkpoint_dir().display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["freematch-train", "--config", "run.toml"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_overrides_are_applied() {
        let args = parse(&[
            "--iters", "100", "--lr", "0.01", "--batch-size", "16", "--seed", "7",
            "--sharpness", "--rho", "0.1", "--po-loss", "--resume", "ckpt/last_checkpoint",
            "--output", "out",
        ]);
        let mut config = FreeMatchConfig::default();
        apply_overrides(&mut config, &args);

        assert_eq!(config.trainer.num_train_iters, 100);
        assert_eq!(config.optimizer.lr, 0.01);
        assert_eq!(config.dataset.batch_size, 16);
        assert_eq!(config.seed, 7);
        assert!(config.sharpness.enabled);
        assert_eq!(config.sharpness.rho, 0.1);
        assert!(config.trainer.po_loss_enabled);
        assert_eq!(config.output.log_dir, PathBuf::from("out"));
        assert_eq!(resume_path(&config), Some(PathBuf::from("ckpt/last_checkpoint")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_no_overrides_keep_config() {
        let args = parse(&[]);
        let mut config = FreeMatchConfig::default();
        apply_overrides(&mut config, &args);

        let default = FreeMatchConfig::default();
        assert_eq!(config.trainer.num_train_iters, default.trainer.num_train_iters);
        assert!(!config.sharpness.enabled);
        assert_eq!(resume_path(&config), None);
    }

    #[test]
    fn test_config_file_is_loaded_and_saved() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("run.toml");
        std::fs::write(
            &path,
            "[trainer]\nnum_train_iters = 500\n\n[sharpness]\nenabled = true\nrho = 0.05\n",
        )
        .unwrap();

        let mut config: FreeMatchConfig = load_toml_config(&path).unwrap();
        assert_eq!(config.trainer.num_train_iters, 500);
        assert!(config.sharpness.enabled);

        config.output.log_dir = temp_dir.path().to_path_buf();
        let saved = config.output.run_dir().join("config.toml");
        save_toml_config(&config, &saved).unwrap();
        let reloaded: FreeMatchConfig = load_toml_config(&saved).unwrap();
        assert_eq!(reloaded.trainer.num_train_iters, 500);
    }

    #[test]
    fn test_progress_sink_ignores_eval_only_updates() {
        let mut sink = ProgressSink::new(10).unwrap();
        let mut metrics = BTreeMap::new();
        metrics.insert("validation/accuracy".to_string(), 0.5);
        sink.update(&metrics, 4);
        assert_eq!(sink.bar.position(), 0);

        metrics.insert("train/total_loss".to_string(), 1.0);
        sink.update(&metrics, 4);
        assert_eq!(sink.bar.position(), 5);
    }
}

//! One optimization step of FreeMatch.
//!
//! Two strategies share the unlabeled objective (SAT, then SAF, then the
//! pseudo-label consistency term):
//!
//! - [`PlainStep`]: one forward/backward over the concatenated batch
//! - [`SharpnessAwareStep`]: the labeled-loss gradient defines a weight
//!   perturbation, the full objective (labeled and unlabeled) is
//!   differentiated at the perturbed weights and the labeled gradient at the
//!   original weights is added before the step

use std::collections::BTreeMap;

use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::backend::AutodiffBackend;
use freematch_core::{SharpnessConfig, TrainerParams};
use freematch_data::{LabeledBatch, UnlabeledBatch};

use crate::label_bank::PseudoLabelBank;
use crate::losses::scalar;
use crate::model::ImageClassifier;
use crate::params::fuse_grads;
use crate::saf::{SafOutput, SelfAdaptiveFairnessLoss};
use crate::sat::{SatOutput, SelfAdaptiveThresholdLoss};
use crate::sharpness::{perturbed, SharpnessPerturbation};
use crate::stats::ThresholdState;

/// Loss weighting of the composite objective
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossWeights {
    pub ulb_loss_ratio: f32,
    pub ent_loss_ratio: f32,
    pub po_loss_enabled: bool,
    pub po_loss_ratio: f32,
}

impl LossWeights {
    pub fn from_params(params: &TrainerParams) -> Self {
        Self {
            ulb_loss_ratio: params.ulb_loss_ratio,
            ent_loss_ratio: params.ent_loss_ratio,
            po_loss_enabled: params.po_loss_enabled,
            po_loss_ratio: params.po_loss_ratio,
        }
    }
}

/// SAT, SAF and the consistency term with their weights
#[derive(Debug, Clone, Copy)]
pub struct UnsupervisedObjective {
    sat: SelfAdaptiveThresholdLoss,
    saf: SelfAdaptiveFairnessLoss,
    weights: LossWeights,
}

pub struct UnsupervisedLosses<B: Backend> {
    pub sat: SatOutput<B>,
    pub saf: SafOutput<B>,
    pub po_loss: Tensor<B, 1>,
    /// `ulb * sat + ent * saf (+ po * consistency)`
    pub weighted: Tensor<B, 1>,
}

impl UnsupervisedObjective {
    pub fn new(sat_ema: f32, weights: LossWeights) -> Self {
        Self {
            sat: SelfAdaptiveThresholdLoss::new(sat_ema),
            saf: SelfAdaptiveFairnessLoss::new(),
            weights,
        }
    }

    pub fn from_params(params: &TrainerParams) -> Self {
        Self::new(params.sat_ema, LossWeights::from_params(params))
    }

    pub fn weights(&self) -> &LossWeights {
        &self.weights
    }

    /// `logits_sat_weak` feeds the threshold statistics and pseudo-labels;
    /// `logits_weak` feeds the consistency term. They differ only in the
    /// sharpness-aware step.
    ///
    /// The bank is updated even when the consistency term is not part of
    /// the total, so enabling it later starts from fresh rows.
    pub fn compute<B: Backend>(
        &self,
        bank: &mut PseudoLabelBank,
        indices: &[usize],
        logits_sat_weak: Tensor<B, 2>,
        logits_weak: Tensor<B, 2>,
        logits_strong: Tensor<B, 2>,
        state: &ThresholdState,
    ) -> UnsupervisedLosses<B> {
        let sat = self.sat.forward(logits_sat_weak, logits_strong.clone(), state);
        let saf = self.saf.forward(&sat.mask, logits_strong.clone(), &sat.state);

        let po_loss = bank.consistency_loss(
            indices,
            softmax(logits_weak, 1),
            softmax(logits_strong, 1),
        );

        let w = &self.weights;
        let mut weighted = sat.loss.clone().mul_scalar(w.ulb_loss_ratio)
            + saf.loss.clone().mul_scalar(w.ent_loss_ratio);
        if w.po_loss_enabled {
            weighted = weighted + po_loss.clone().mul_scalar(w.po_loss_ratio);
        }

        UnsupervisedLosses {
            sat,
            saf,
            po_loss,
            weighted,
        }
    }
}

/// Scalars reported for one step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepMetrics {
    pub lb_loss: f32,
    pub sat_loss: f32,
    pub saf_loss: f32,
    pub po_loss: f32,
    pub total_loss: f32,
    /// Fraction of unlabeled samples above their class threshold
    pub mask_ratio: f32,
    pub tau_t: f32,
    pub p_t_mean: f32,
    pub label_hist_mean: f32,
    pub label_hist_s_mean: f32,
    /// Labeled-loss gradient norm of the sharpness-aware step
    pub sharpness_grad_norm: Option<f32>,
}

impl StepMetrics {
    fn collect<B: Backend>(lb_loss: Tensor<B, 1>, unsup: &UnsupervisedLosses<B>) -> Self {
        let lb_loss = scalar(lb_loss);
        let weighted = scalar(unsup.weighted.clone());
        let hist_s = &unsup.saf.hist_p_ulb_s;

        Self {
            lb_loss,
            sat_loss: scalar(unsup.sat.loss.clone()),
            saf_loss: scalar(unsup.saf.loss.clone()),
            po_loss: scalar(unsup.po_loss.clone()),
            total_loss: lb_loss + weighted,
            mask_ratio: unsup.sat.mask_ratio,
            tau_t: unsup.sat.state.tau,
            p_t_mean: unsup.sat.state.p_mean(),
            label_hist_mean: unsup.sat.state.hist_mean(),
            label_hist_s_mean: if hist_s.is_empty() {
                0.0
            } else {
                hist_s.iter().sum::<f32>() / hist_s.len() as f32
            },
            sharpness_grad_norm: None,
        }
    }

    /// Flat `train/*` keys for the metric sinks
    pub fn to_log_map(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        let mut put = |key: &str, value: f32| {
            map.insert(format!("train/{key}"), value as f64);
        };
        put("lb_loss", self.lb_loss);
        put("sat_loss", self.sat_loss);
        put("saf_loss", self.saf_loss);
        put("po_loss", self.po_loss);
        put("total_loss", self.total_loss);
        put("mask", 1.0 - self.mask_ratio);
        put("mask_ratio", self.mask_ratio);
        put("tau_t", self.tau_t);
        put("p_t", self.p_t_mean);
        put("label_hist", self.label_hist_mean);
        put("label_hist_s", self.label_hist_s_mean);
        if let Some(norm) = self.sharpness_grad_norm {
            put("sharpness_grad_norm", norm);
        }
        map
    }
}

pub struct StepOutput<M> {
    pub model: M,
    pub state: ThresholdState,
    pub metrics: StepMetrics,
}

/// Everything besides the model and optimizer that a step reads or mutates
pub struct StepContext<'a> {
    pub objective: &'a UnsupervisedObjective,
    pub bank: &'a mut PseudoLabelBank,
    pub state: &'a ThresholdState,
    pub lr: f64,
}

pub trait TrainStep<B: AutodiffBackend> {
    fn step<M, O>(
        &self,
        model: M,
        optimizer: &mut O,
        labeled: LabeledBatch<B>,
        unlabeled: UnlabeledBatch<B>,
        ctx: StepContext<'_>,
    ) -> StepOutput<M>
    where
        M: AutodiffModule<B> + ImageClassifier<B>,
        O: Optimizer<M, B>;
}

/// Logits of the concatenated `[labeled, weak, strong]` batch, split back
struct SplitLogits<B: Backend> {
    labeled: Tensor<B, 2>,
    weak: Tensor<B, 2>,
    strong: Tensor<B, 2>,
}

fn joint_batch<B: Backend>(
    labeled: &LabeledBatch<B>,
    unlabeled: &UnlabeledBatch<B>,
) -> (Tensor<B, 4>, usize, usize) {
    let num_lb = labeled.images.dims()[0];
    let num_ulb = unlabeled.images_weak.dims()[0];
    assert_eq!(
        num_ulb,
        unlabeled.images_strong.dims()[0],
        "weak and strong unlabeled views must have the same batch size"
    );
    assert_eq!(num_ulb, unlabeled.indices.len(), "one index per unlabeled sample");

    let images = Tensor::cat(
        vec![
            labeled.images.clone(),
            unlabeled.images_weak.clone(),
            unlabeled.images_strong.clone(),
        ],
        0,
    );
    (images, num_lb, num_ulb)
}

fn forward_split<B: Backend, M: ImageClassifier<B>>(
    model: &M,
    images: Tensor<B, 4>,
    num_lb: usize,
    num_ulb: usize,
) -> SplitLogits<B> {
    let logits = model.forward(images);
    SplitLogits {
        labeled: logits.clone().slice([0..num_lb]),
        weak: logits.clone().slice([num_lb..num_lb + num_ulb]),
        strong: logits.slice([num_lb + num_ulb..num_lb + 2 * num_ulb]),
    }
}

fn supervised_loss<B: Backend>(logits: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    CrossEntropyLossConfig::new()
        .init(&logits.device())
        .forward(logits, labels)
}

/// Single forward/backward over labeled, weak and strong images
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainStep;

impl<B: AutodiffBackend> TrainStep<B> for PlainStep {
    fn step<M, O>(
        &self,
        model: M,
        optimizer: &mut O,
        labeled: LabeledBatch<B>,
        unlabeled: UnlabeledBatch<B>,
        ctx: StepContext<'_>,
    ) -> StepOutput<M>
    where
        M: AutodiffModule<B> + ImageClassifier<B>,
        O: Optimizer<M, B>,
    {
        let (images, num_lb, num_ulb) = joint_batch(&labeled, &unlabeled);
        let logits = forward_split(&model, images, num_lb, num_ulb);

        let lb_loss = supervised_loss(logits.labeled, labeled.labels);
        let unsup = ctx.objective.compute(
            ctx.bank,
            &unlabeled.indices,
            logits.weak.clone(),
            logits.weak,
            logits.strong,
            ctx.state,
        );

        let total = lb_loss.clone() + unsup.weighted.clone();
        let grads = GradientsParams::from_grads(total.backward(), &model);
        let model = optimizer.step(ctx.lr, model, grads);

        let metrics = StepMetrics::collect(lb_loss, &unsup);
        StepOutput {
            model,
            state: unsup.sat.state,
            metrics,
        }
    }
}

/// Two-pass step around a labeled-loss weight perturbation
#[derive(Debug, Clone, Copy)]
pub struct SharpnessAwareStep {
    perturbation: SharpnessPerturbation,
}

impl SharpnessAwareStep {
    pub fn new(rho: f32) -> Self {
        Self {
            perturbation: SharpnessPerturbation::new(rho),
        }
    }
}

impl<B: AutodiffBackend> TrainStep<B> for SharpnessAwareStep {
    fn step<M, O>(
        &self,
        model: M,
        optimizer: &mut O,
        labeled: LabeledBatch<B>,
        unlabeled: UnlabeledBatch<B>,
        ctx: StepContext<'_>,
    ) -> StepOutput<M>
    where
        M: AutodiffModule<B> + ImageClassifier<B>,
        O: Optimizer<M, B>,
    {
        let (images, num_lb, num_ulb) = joint_batch(&labeled, &unlabeled);

        // first pass: labeled loss at the current weights
        let first = forward_split(&model, images.clone(), num_lb, num_ulb);
        let lb_loss = supervised_loss(first.labeled, labeled.labels.clone());
        let lb_grads = GradientsParams::from_grads(lb_loss.backward(), &model);
        let weak_first = first.weak.detach();

        let perturbation = self.perturbation.compute::<B, M>(&model, &lb_grads);
        let grad_norm = perturbation.grad_norm();

        // second pass: full objective at the perturbed weights
        let objective = ctx.objective;
        let bank = ctx.bank;
        let state = ctx.state;
        let indices = &unlabeled.indices;
        let labels = labeled.labels;
        let (model, (mut grads, lb_hat, unsup)) =
            perturbed::<B, M, _, _>(model, &perturbation, |m| {
                let second = forward_split(m, images, num_lb, num_ulb);
                let lb_hat = supervised_loss(second.labeled, labels);
                let unsup =
                    objective.compute(bank, indices, weak_first, second.weak, second.strong, state);
                let total = lb_hat.clone() + unsup.weighted.clone();
                let grads = GradientsParams::from_grads(total.backward(), m);
                (grads, lb_hat, unsup)
            });

        // grad = grad(total)(w + eps) + grad(lb)(w)
        fuse_grads::<B, M>(&model, &mut grads, &lb_grads);
        let model = optimizer.step(ctx.lr, model, grads);

        let mut metrics = StepMetrics::collect(lb_hat, &unsup);
        metrics.sharpness_grad_norm = Some(grad_norm);
        StepOutput {
            model,
            state: unsup.sat.state,
            metrics,
        }
    }
}

/// Step strategy chosen once from the configuration
#[derive(Debug, Clone, Copy)]
pub enum StepStrategy {
    Plain(PlainStep),
    SharpnessAware(SharpnessAwareStep),
}

impl StepStrategy {
    pub fn from_config(config: &SharpnessConfig) -> Self {
        if config.enabled {
            Self::SharpnessAware(SharpnessAwareStep::new(config.rho))
        } else {
            Self::Plain(PlainStep)
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain(_) => "plain",
            Self::SharpnessAware(_) => "sharpness-aware",
        }
    }
}

impl<B: AutodiffBackend> TrainStep<B> for StepStrategy {
    fn step<M, O>(
        &self,
        model: M,
        optimizer: &mut O,
        labeled: LabeledBatch<B>,
        unlabeled: UnlabeledBatch<B>,
        ctx: StepContext<'_>,
    ) -> StepOutput<M>
    where
        M: AutodiffModule<B> + ImageClassifier<B>,
        O: Optimizer<M, B>,
    {
        match self {
            Self::Plain(step) => step.step(model, optimizer, labeled, unlabeled, ctx),
            Self::SharpnessAware(step) => step.step(model, optimizer, labeled, unlabeled, ctx),
        }
    }
}

//! Model evaluation over the held-out loader.
//!
//! Provides:
//! - Sample-weighted cross-entropy, accuracy and macro precision/recall/F1
//! - Confusion matrix and a per-class report
//! - Softmax probabilities of a full pass, used to seed threshold statistics

use std::time::Instant;

use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::activation::softmax;
use freematch_core::EvaluationMetrics;
use freematch_data::EvalLoader;
use tracing::{debug, info};

use crate::losses::{host_floats, host_ints, scalar};
use crate::model::ImageClassifier;

/// Model evaluator
#[derive(Debug, Clone, Copy)]
pub struct Evaluator {
    num_classes: usize,
}

impl Evaluator {
    pub fn new(num_classes: usize) -> Self {
        Self { num_classes }
    }

    /// Evaluate `model` in inference mode over one pass of `loader`
    pub fn evaluate<B: Backend, M: ImageClassifier<B>>(
        &self,
        model: &M,
        loader: &EvalLoader<B>,
    ) -> EvaluationMetrics {
        let start = Instant::now();
        let mut predictions = Vec::with_capacity(loader.len());
        let mut labels = Vec::with_capacity(loader.len());
        let mut loss_sum = 0.0f64;

        for batch in loader.iter() {
            let [n, _, _, _] = batch.images.dims();
            let logits = model.forward(batch.images);
            let device = logits.device();

            let loss = CrossEntropyLossConfig::new()
                .init(&device)
                .forward(logits.clone(), batch.labels.clone());
            loss_sum += scalar(loss) as f64 * n as f64;

            let preds = logits.argmax(1).reshape([n]);
            predictions.extend(host_ints(preds).into_iter().map(|p| p as usize));
            labels.extend(host_ints(batch.labels).into_iter().map(|l| l as usize));
        }

        let total = labels.len();
        let loss = if total > 0 { loss_sum / total as f64 } else { 0.0 };
        let metrics = EvaluationMetrics::from_predictions(&predictions, &labels, self.num_classes, loss);

        debug!(
            "Evaluated {} samples in {:.1}ms",
            total,
            start.elapsed().as_secs_f64() * 1000.0
        );
        metrics
    }

    /// Row-major `[len, num_classes]` softmax probabilities of one pass
    pub fn collect_probabilities<B: Backend, M: ImageClassifier<B>>(
        &self,
        model: &M,
        loader: &EvalLoader<B>,
    ) -> Vec<f32> {
        let mut probs = Vec::with_capacity(loader.len() * self.num_classes);
        for batch in loader.iter() {
            let logits = model.forward(batch.images);
            probs.extend(host_floats(softmax(logits, 1)));
        }
        probs
    }

    /// Log the per-class report line by line
    pub fn log_report(metrics: &EvaluationMetrics, class_names: Option<&[&str]>) {
        info!("Evaluation: {}", metrics.summary());
        for line in metrics.classification_report(class_names).lines() {
            if !line.trim().is_empty() {
                info!("{}", line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use freematch_data::{ImageBatcher, ImageDataset, ImageItem};

    type TestBackend = NdArray<f32>;

    /// Predicts class `round(mean of channel 0 * 2)`, clamped to 0..=2
    struct MeanClassifier;

    impl ImageClassifier<TestBackend> for MeanClassifier {
        fn forward(&self, images: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 2> {
            let [n, _, _, _] = images.dims();
            let means = host_floats(images.slice([0..n, 0..1]).mean_dim(2).mean_dim(3).reshape([n]));
            let mut logits = Vec::with_capacity(n * 3);
            for m in means {
                let class = (m * 2.0).round().clamp(0.0, 2.0) as usize;
                for c in 0..3 {
                    logits.push(if c == class { 5.0 } else { 0.0 });
                }
            }
            Tensor::from_data(TensorData::new(logits, [n, 3]), &Default::default())
        }

        fn num_classes(&self) -> usize {
            3
        }
    }

    fn item(value: f32, label: usize) -> ImageItem {
        ImageItem {
            pixels: vec![value; 3 * 4 * 4],
            label,
        }
    }

    fn loader(items: Vec<ImageItem>) -> EvalLoader<TestBackend> {
        // identity normalization keeps pixel values as-is
        let batcher = ImageBatcher::new(Default::default(), 4, [0.0; 3], [1.0; 3]);
        EvalLoader::new(ImageDataset::new(items), 2, batcher)
    }

    #[test]
    fn test_evaluate_known_predictions() {
        // predictions: 0, 1, 2, 2, 1 against labels 0, 1, 2, 1, 0
        let items = vec![
            item(0.0, 0),
            item(0.5, 1),
            item(1.0, 2),
            item(1.0, 1),
            item(0.5, 0),
        ];
        let metrics = Evaluator::new(3).evaluate(&MeanClassifier, &loader(items));

        assert_eq!(metrics.total_samples, 5);
        assert_eq!(metrics.correct_predictions, 3);
        assert!((metrics.accuracy - 0.6).abs() < 1e-9);

        // precision: c0 1/1, c1 1/2, c2 1/2; recall: c0 1/2, c1 1/2, c2 1/1
        assert!((metrics.macro_precision - (1.0 + 0.5 + 0.5) / 3.0).abs() < 1e-9);
        assert!((metrics.macro_recall - (0.5 + 0.5 + 1.0) / 3.0).abs() < 1e-9);
        let f1 = |p: f64, r: f64| 2.0 * p * r / (p + r);
        let macro_f1 = (f1(1.0, 0.5) + f1(0.5, 0.5) + f1(0.5, 1.0)) / 3.0;
        assert!((metrics.macro_f1 - macro_f1).abs() < 1e-9);
        assert!(metrics.loss > 0.0);
    }

    #[test]
    fn test_collect_probabilities_shape() {
        let items = vec![item(0.0, 0), item(1.0, 2), item(0.5, 1)];
        let probs = Evaluator::new(3).collect_probabilities(&MeanClassifier, &loader(items));
        assert_eq!(probs.len(), 9);
        for row in probs.chunks(3) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }
}

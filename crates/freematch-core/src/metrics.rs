//! Evaluation metrics for held-out classification.
//!
//! Macro averages follow the scikit-learn convention: they are taken over the
//! classes that appear in either the ground truth or the predictions, and a
//! ratio with a zero denominator counts as 0.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Evaluation result for one pass over the held-out set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    /// Sample-weighted mean cross-entropy
    pub loss: f64,
    pub accuracy: f64,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    pub total_samples: usize,
    pub correct_predictions: usize,
    pub per_class: Vec<ClassMetrics>,
    pub confusion_matrix: ConfusionMatrix,
}

impl EvaluationMetrics {
    pub fn from_predictions(
        predictions: &[usize],
        ground_truth: &[usize],
        num_classes: usize,
        loss: f64,
    ) -> Self {
        let confusion_matrix =
            ConfusionMatrix::from_predictions(predictions, ground_truth, num_classes);

        let per_class: Vec<ClassMetrics> = (0..num_classes)
            .map(|c| ClassMetrics::from_confusion_matrix(&confusion_matrix, c))
            .collect();

        // Classes seen in truth or predictions
        let present: Vec<&ClassMetrics> = per_class
            .iter()
            .filter(|m| m.support > 0 || m.predicted > 0)
            .collect();

        let macro_avg = |f: fn(&ClassMetrics) -> f64| -> f64 {
            if present.is_empty() {
                0.0
            } else {
                present.iter().map(|m| f(*m)).sum::<f64>() / present.len() as f64
            }
        };

        let macro_precision = macro_avg(|m| m.precision);
        let macro_recall = macro_avg(|m| m.recall);
        let macro_f1 = macro_avg(|m| m.f1);

        Self {
            loss,
            accuracy: confusion_matrix.accuracy(),
            macro_precision,
            macro_recall,
            macro_f1,
            total_samples: confusion_matrix.total(),
            correct_predictions: confusion_matrix.correct(),
            per_class,
            confusion_matrix,
        }
    }

    /// Flat `validation/*` keys for a metrics sink
    pub fn to_log_map(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        map.insert("validation/loss".to_string(), self.loss);
        map.insert("validation/accuracy".to_string(), self.accuracy);
        map.insert("validation/precision".to_string(), self.macro_precision);
        map.insert("validation/recall".to_string(), self.macro_recall);
        map.insert("validation/f1".to_string(), self.macro_f1);
        map
    }

    /// Per-class precision/recall/F1 table
    pub fn classification_report(&self, class_names: Option<&[&str]>) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{:>14} {:>10} {:>10} {:>10} {:>10}\n\n",
            "", "precision", "recall", "f1-score", "support"
        ));

        for m in &self.per_class {
            if m.support == 0 && m.predicted == 0 {
                continue;
            }
            let name = class_names
                .and_then(|names| names.get(m.class_idx).map(|s| s.to_string()))
                .unwrap_or_else(|| m.class_idx.to_string());
            out.push_str(&format!(
                "{:>14} {:>10.4} {:>10.4} {:>10.4} {:>10}\n",
                name, m.precision, m.recall, m.f1, m.support
            ));
        }

        out.push('\n');
        out.push_str(&format!(
            "{:>14} {:>10} {:>10} {:>10.4} {:>10}\n",
            "accuracy", "", "", self.accuracy, self.total_samples
        ));
        out.push_str(&format!(
            "{:>14} {:>10.4} {:>10.4} {:>10.4} {:>10}\n",
            "macro avg", self.macro_precision, self.macro_recall, self.macro_f1, self.total_samples
        ));
        out
    }

    /// Summary box used in evaluation logs
    pub fn summary(&self) -> String {
        format!(
            "loss={:.4} acc={:.2}% precision={:.4} recall={:.4} f1={:.4} ({}/{})",
            self.loss,
            self.accuracy * 100.0,
            self.macro_precision,
            self.macro_recall,
            self.macro_f1,
            self.correct_predictions,
            self.total_samples
        )
    }
}

/// Per-class metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub class_idx: usize,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    /// Precision = TP / (TP + FP)
    pub precision: f64,
    /// Recall = TP / (TP + FN)
    pub recall: f64,
    pub f1: f64,
    /// Number of actual samples of this class
    pub support: usize,
    /// Number of samples predicted as this class
    pub predicted: usize,
}

impl ClassMetrics {
    /// Calculate metrics for a class from confusion matrix
    pub fn from_confusion_matrix(cm: &ConfusionMatrix, class_idx: usize) -> Self {
        let true_positives = cm.get(class_idx, class_idx);
        let support = cm.row_sum(class_idx);
        let predicted = cm.col_sum(class_idx);
        let false_positives = predicted - true_positives;
        let false_negatives = support - true_positives;

        let precision = ratio(true_positives, predicted);
        let recall = ratio(true_positives, support);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            class_idx,
            true_positives,
            false_positives,
            false_negatives,
            precision,
            recall,
            f1,
            support,
            predicted,
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den > 0 {
        num as f64 / den as f64
    } else {
        0.0
    }
}

/// Confusion matrix, row = actual, column = predicted, row-major
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub num_classes: usize,
    pub matrix: Vec<usize>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            matrix: vec![0; num_classes * num_classes],
        }
    }

    pub fn from_predictions(
        predictions: &[usize],
        ground_truth: &[usize],
        num_classes: usize,
    ) -> Self {
        let mut cm = Self::new(num_classes);
        for (&pred, &actual) in predictions.iter().zip(ground_truth.iter()) {
            cm.add(actual, pred);
        }
        cm
    }

    /// Out-of-range indices are ignored
    pub fn add(&mut self, actual: usize, predicted: usize) {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted] += 1;
        }
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted]
        } else {
            0
        }
    }

    pub fn total(&self) -> usize {
        self.matrix.iter().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.num_classes).map(|i| self.get(i, i)).sum()
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.correct(), self.total())
    }

    pub fn row_sum(&self, row: usize) -> usize {
        (0..self.num_classes).map(|col| self.get(row, col)).sum()
    }

    pub fn col_sum(&self, col: usize) -> usize {
        (0..self.num_classes).map(|row| self.get(row, col)).sum()
    }

    /// Pretty print the matrix, falling back to a summary for many classes
    pub fn display(&self) -> String {
        let mut output = String::from("Confusion Matrix (rows=actual, cols=predicted):\n");

        if self.num_classes > 20 {
            output.push_str(&format!(
                "({}x{} matrix, accuracy {:.2}%)\n",
                self.num_classes,
                self.num_classes,
                self.accuracy() * 100.0
            ));
            return output;
        }

        output.push_str("      ");
        for col in 0..self.num_classes {
            output.push_str(&format!("{:>6}", col));
        }
        output.push('\n');

        for row in 0..self.num_classes {
            output.push_str(&format!("{:>5} ", row));
            for col in 0..self.num_classes {
                output.push_str(&format!("{:>6}", self.get(row, col)));
            }
            output.push('\n');
        }
        output
    }
}

impl std::fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

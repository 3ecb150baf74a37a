// src/model/metrics.rs
//! Evaluation metrics and the operating-threshold search.
//!
//! The threshold search is recall-first with a precision floor: a missed
//! late delivery costs far more than a false alarm, so the scan returns the
//! lowest threshold that reaches the recall target while staying above the
//! precision floor.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::config::{DEFAULT_THRESHOLD, MIN_PRECISION, TARGET_RECALL_LATE};

/// Binarizes probabilities: positive iff P(late) >= threshold.
pub fn binarize(probs: &[f64], threshold: f64) -> Vec<i32> {
    probs.iter().map(|&p| i32::from(p >= threshold)).collect()
}

pub fn accuracy(y_true: &[i32], y_pred: &[i32]) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let correct = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    correct as f64 / y_true.len() as f64
}

/// Precision and recall for one class, with zero-division resolving to 0.
pub fn precision_recall(y_true: &[i32], y_pred: &[i32], class: i32) -> (f64, f64) {
    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut fn_ = 0usize;
    for (&t, &p) in y_true.iter().zip(y_pred) {
        match (t == class, p == class) {
            (true, true) => tp += 1,
            (false, true) => fp += 1,
            (true, false) => fn_ += 1,
            (false, false) => {}
        }
    }
    let precision = if tp + fp > 0 { tp as f64 / (tp + fp) as f64 } else { 0.0 };
    let recall = if tp + fn_ > 0 { tp as f64 / (tp + fn_) as f64 } else { 0.0 };
    (precision, recall)
}

/// F-beta for one class; beta = 1 gives F1, beta = 2 weights recall higher.
pub fn fbeta_score(y_true: &[i32], y_pred: &[i32], class: i32, beta: f64) -> f64 {
    let (precision, recall) = precision_recall(y_true, y_pred, class);
    let b2 = beta * beta;
    let denom = b2 * precision + recall;
    if denom > 0.0 {
        (1.0 + b2) * precision * recall / denom
    } else {
        0.0
    }
}

pub fn f1_score(y_true: &[i32], y_pred: &[i32], class: i32) -> f64 {
    fbeta_score(y_true, y_pred, class, 1.0)
}

/// 2x2 confusion matrix, rows = actual, columns = predicted:
/// [[tn, fp], [fn, tp]].
pub fn confusion_matrix(y_true: &[i32], y_pred: &[i32]) -> [[u64; 2]; 2] {
    let mut matrix = [[0u64; 2]; 2];
    for (&t, &p) in y_true.iter().zip(y_pred) {
        let i = usize::from(t == 1);
        let j = usize::from(p == 1);
        matrix[i][j] += 1;
    }
    matrix
}

/// ROC-AUC via the rank statistic, with average ranks on tied scores.
pub fn roc_auc_score(y_true: &[i32], probs: &[f64]) -> Result<f64> {
    let n_pos = y_true.iter().filter(|&&t| t == 1).count();
    let n_neg = y_true.len() - n_pos;
    ensure!(
        n_pos > 0 && n_neg > 0,
        "ROC-AUC requires both classes in the test partition"
    );

    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[a].total_cmp(&probs[b]));

    let mut ranks = vec![0.0; probs.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && probs[order[j + 1]] == probs[order[i]] {
            j += 1;
        }
        let average_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = average_rank;
        }
        i = j + 1;
    }

    let positive_rank_sum: f64 = y_true
        .iter()
        .zip(&ranks)
        .filter(|(&t, _)| t == 1)
        .map(|(_, &r)| r)
        .sum();
    let n_pos = n_pos as f64;
    let n_neg = n_neg as f64;
    Ok((positive_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}

/// Per-class precision/recall/F1/support plus accuracy and macro/weighted
/// averages, shaped like the report the training artifacts persist.
pub fn classification_report(y_true: &[i32], y_pred: &[i32]) -> JsonValue {
    let mut per_class = Vec::new();
    for class in [0, 1] {
        let (precision, recall) = precision_recall(y_true, y_pred, class);
        let f1 = f1_score(y_true, y_pred, class);
        let support = y_true.iter().filter(|&&t| t == class).count();
        per_class.push((class, precision, recall, f1, support));
    }
    let total: usize = per_class.iter().map(|c| c.4).sum();
    let macro_avg = |pick: fn(&(i32, f64, f64, f64, usize)) -> f64| {
        per_class.iter().map(pick).sum::<f64>() / per_class.len() as f64
    };
    let weighted_avg = |pick: fn(&(i32, f64, f64, f64, usize)) -> f64| {
        if total == 0 {
            0.0
        } else {
            per_class
                .iter()
                .map(|c| pick(c) * c.4 as f64)
                .sum::<f64>()
                / total as f64
        }
    };

    let mut report = serde_json::Map::new();
    for (class, precision, recall, f1, support) in &per_class {
        report.insert(
            class.to_string(),
            json!({
                "precision": precision,
                "recall": recall,
                "f1-score": f1,
                "support": support,
            }),
        );
    }
    report.insert("accuracy".to_string(), json!(accuracy(y_true, y_pred)));
    report.insert(
        "macro avg".to_string(),
        json!({
            "precision": macro_avg(|c| c.1),
            "recall": macro_avg(|c| c.2),
            "f1-score": macro_avg(|c| c.3),
            "support": total,
        }),
    );
    report.insert(
        "weighted avg".to_string(),
        json!({
            "precision": weighted_avg(|c| c.1),
            "recall": weighted_avg(|c| c.2),
            "f1-score": weighted_avg(|c| c.3),
            "support": total,
        }),
    );
    JsonValue::Object(report)
}

/// Scans candidate thresholds 0.10..=0.90 in 0.05 steps, ascending, using an
/// integer step count so the bounds are hit exactly.
///
/// Returns the first threshold reaching the recall target with precision at
/// or above the floor. If none qualifies, falls back to the threshold with
/// the highest recall among those meeting the precision floor alone; if the
/// floor is never met, returns the 0.5 default. The scan itself has no
/// randomness: the same inputs always select the same threshold.
pub fn choose_threshold(y_true: &[i32], probs: &[f64]) -> f64 {
    let mut best_threshold = DEFAULT_THRESHOLD;
    let mut best_recall = 0.0;

    for step in 2..=18 {
        let threshold = f64::from(step) * 0.05;
        let y_pred = binarize(probs, threshold);
        let (precision, recall) = precision_recall(y_true, &y_pred, 1);

        if recall >= TARGET_RECALL_LATE && precision >= MIN_PRECISION {
            return threshold;
        }
        if recall > best_recall && precision >= MIN_PRECISION {
            best_recall = recall;
            best_threshold = threshold;
        }
    }
    best_threshold
}

/// The metric bundle reported at the chosen operating threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdMetrics {
    pub accuracy_at_threshold: f64,
    pub precision_class_0: f64,
    pub precision_class_1: f64,
    pub recall_class_0: f64,
    pub recall_class_1: f64,
    pub f1_at_threshold: f64,
    pub f2_at_threshold: f64,
    pub confusion_matrix_at_threshold: [[u64; 2]; 2],
}

pub fn threshold_metrics(y_true: &[i32], probs: &[f64], threshold: f64) -> ThresholdMetrics {
    let y_pred = binarize(probs, threshold);
    let (precision_0, recall_0) = precision_recall(y_true, &y_pred, 0);
    let (precision_1, recall_1) = precision_recall(y_true, &y_pred, 1);
    ThresholdMetrics {
        accuracy_at_threshold: accuracy(y_true, &y_pred),
        precision_class_0: precision_0,
        precision_class_1: precision_1,
        recall_class_0: recall_0,
        recall_class_1: recall_1,
        f1_at_threshold: f1_score(y_true, &y_pred, 1),
        f2_at_threshold: fbeta_score(y_true, &y_pred, 1, 2.0),
        confusion_matrix_at_threshold: confusion_matrix(y_true, &y_pred),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precision_recall_hand_checked() {
        let y_true = vec![1, 1, 0, 0, 1];
        let y_pred = vec![1, 0, 1, 0, 1];
        let (precision, recall) = precision_recall(&y_true, &y_pred, 1);
        // tp=2, fp=1, fn=1
        assert!((precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((recall - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(confusion_matrix(&y_true, &y_pred), [[1, 1], [1, 2]]);
    }

    #[test]
    fn zero_division_resolves_to_zero() {
        let y_true = vec![0, 0, 0];
        let y_pred = vec![0, 0, 0];
        let (precision, recall) = precision_recall(&y_true, &y_pred, 1);
        assert_eq!((precision, recall), (0.0, 0.0));
        assert_eq!(f1_score(&y_true, &y_pred, 1), 0.0);
        assert_eq!(fbeta_score(&y_true, &y_pred, 1, 2.0), 0.0);
    }

    #[test]
    fn f2_weights_recall_over_precision() {
        // precision 0.5, recall 1.0 for class 1.
        let y_true = vec![1, 0];
        let y_pred = vec![1, 1];
        let f1 = f1_score(&y_true, &y_pred, 1);
        let f2 = fbeta_score(&y_true, &y_pred, 1, 2.0);
        assert!(f2 > f1);
        assert!((f2 - 5.0 * 0.5 / (4.0 * 0.5 + 1.0)).abs() < 1e-12);
    }

    #[test]
    fn roc_auc_perfect_and_tied() {
        let y_true = vec![0, 0, 1, 1];
        assert_eq!(roc_auc_score(&y_true, &[0.1, 0.2, 0.8, 0.9]).unwrap(), 1.0);
        // All scores tied: AUC is 0.5 by the average-rank convention.
        assert_eq!(roc_auc_score(&y_true, &[0.5, 0.5, 0.5, 0.5]).unwrap(), 0.5);
        // Single-class input is an error, not a silent 0.
        assert!(roc_auc_score(&[1, 1], &[0.2, 0.9]).is_err());
    }

    #[test]
    fn threshold_scan_returns_first_qualifying_threshold() {
        // Every positive scores above 0.10, so t = 0.10 already reaches
        // recall 1.0 with precision above the floor.
        let y_true = vec![1, 1, 1, 0, 0, 0];
        let probs = vec![0.95, 0.6, 0.2, 0.15, 0.05, 0.01];
        assert_eq!(choose_threshold(&y_true, &probs), 2.0 * 0.05);
    }

    #[test]
    fn threshold_scan_falls_back_to_best_recall() {
        // One positive is stuck below every candidate threshold, capping
        // recall at 0.5; the precision floor is met everywhere, so the scan
        // falls back to the lowest threshold achieving that recall.
        let y_true = vec![1, 1, 0];
        let probs = vec![0.95, 0.05, 0.01];
        assert_eq!(choose_threshold(&y_true, &probs), 2.0 * 0.05);
    }

    #[test]
    fn threshold_scan_defaults_when_precision_floor_never_met() {
        // No actual positives: precision for class 1 is 0 at every
        // threshold, so the scan returns the 0.5 default.
        let y_true = vec![0, 0, 0];
        let probs = vec![0.9, 0.8, 0.7];
        assert_eq!(choose_threshold(&y_true, &probs), DEFAULT_THRESHOLD);
    }

    #[test]
    fn threshold_scan_is_deterministic() {
        let y_true = vec![1, 0, 1, 0, 1, 1, 0, 0, 1, 0];
        let probs = vec![0.9, 0.8, 0.7, 0.6, 0.55, 0.4, 0.3, 0.25, 0.2, 0.1];
        let first = choose_threshold(&y_true, &probs);
        for _ in 0..10 {
            assert_eq!(choose_threshold(&y_true, &probs), first);
        }
    }

    #[test]
    fn threshold_scan_covers_the_upper_bound() {
        // A wall of negatives at 0.86 keeps precision below the floor at
        // every threshold under 0.90, so the scan can only qualify at the
        // upper bound itself. The bound must therefore be inclusive.
        let mut y_true = vec![1, 1];
        let mut probs = vec![0.90, 0.90];
        for _ in 0..32 {
            y_true.push(0);
            probs.push(0.86);
        }
        let chosen = choose_threshold(&y_true, &probs);
        assert!((chosen - 0.90).abs() < 1e-9);
    }

    #[test]
    fn classification_report_shape() {
        let y_true = vec![1, 0, 1, 0];
        let y_pred = vec![1, 0, 0, 0];
        let report = classification_report(&y_true, &y_pred);
        assert!(report.get("0").is_some());
        assert!(report.get("1").is_some());
        assert_eq!(report["accuracy"], json!(0.75));
        assert_eq!(report["macro avg"]["support"], json!(4));
    }
}

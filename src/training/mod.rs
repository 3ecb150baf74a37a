// src/training/mod.rs
//! Model training: loads the fact table, fits the scoring pipeline on a
//! stratified split, selects the recall-first operating threshold, and
//! persists pipeline + metadata + metrics as full overwrites.

use anyhow::{ensure, Context, Result};
use chrono::Utc;
use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rusqlite::Connection;
use serde_json::json;
use std::collections::BTreeMap;

use crate::config::{
    PipelineConfig, DEFAULT_THRESHOLD, FEATURE_COLS, LABEL_COL, MODEL_NAME, MODEL_VERSION,
    NUM_FEATURES, SPLIT_SEED, TEST_FRACTION, WAREHOUSE_TABLE,
};
use crate::features::feature_matrix;
use crate::model::artifacts::{save_json, ModelMetadata};
use crate::model::metrics::{
    accuracy, binarize, choose_threshold, classification_report, f1_score, roc_auc_score,
    threshold_metrics,
};
use crate::model::pipeline::ScoringPipeline;
use crate::utils::db::open_store;

/// Summary of one training run.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub threshold: f64,
    pub accuracy: f64,
    pub roc_auc: f64,
    pub num_training_rows: usize,
    pub num_test_rows: usize,
}

/// Opens the warehouse store and runs the training stage.
pub fn train_and_save(config: &PipelineConfig) -> Result<TrainingReport> {
    let warehouse =
        open_store(&config.warehouse_db_path()).context("Failed to open warehouse store")?;
    train_from(&warehouse, config)
}

/// Trains from an already open warehouse connection. All computation happens
/// before the first artifact write, so a failed stage leaves the previous
/// artifacts untouched.
pub fn train_from(warehouse: &Connection, config: &PipelineConfig) -> Result<TrainingReport> {
    let (rows, labels) = load_fact_table(warehouse)?;
    ensure!(!rows.is_empty(), "Fact table {} is empty", WAREHOUSE_TABLE);

    let (train_idx, test_idx) = stratified_split(&labels, TEST_FRACTION, SPLIT_SEED)?;
    let train_rows: Vec<_> = train_idx.iter().map(|&i| rows[i]).collect();
    let test_rows: Vec<_> = test_idx.iter().map(|&i| rows[i]).collect();
    let y_train: Vec<i32> = train_idx.iter().map(|&i| labels[i]).collect();
    let y_test: Vec<i32> = test_idx.iter().map(|&i| labels[i]).collect();

    let x_train = feature_matrix(&train_rows);
    let x_test = feature_matrix(&test_rows);

    let pipeline = ScoringPipeline::fit(&x_train, &y_train)?;
    let probabilities = pipeline.predict_proba(&x_test)?;

    // Reference metrics at the default 0.5 boundary.
    let y_pred_default = binarize(&probabilities, DEFAULT_THRESHOLD);
    let accuracy_default = accuracy(&y_test, &y_pred_default);
    let f1_default = f1_score(&y_test, &y_pred_default, 1);
    let roc_auc = roc_auc_score(&y_test, &probabilities)?;
    let report_default = classification_report(&y_test, &y_pred_default);

    // Operating point for deployment: recall-first, precision-floored.
    let threshold = choose_threshold(&y_test, &probabilities);
    let at_threshold = threshold_metrics(&y_test, &probabilities, threshold);

    let metadata = ModelMetadata {
        model_name: MODEL_NAME.to_string(),
        model_version: MODEL_VERSION.to_string(),
        trained_at: Utc::now().to_rfc3339(),
        warehouse_table: WAREHOUSE_TABLE.to_string(),
        num_training_rows: train_idx.len(),
        num_test_rows: test_idx.len(),
        features: FEATURE_COLS.iter().map(|c| c.to_string()).collect(),
        label: LABEL_COL.to_string(),
        classification_threshold: threshold,
    };
    let metrics_doc = json!({
        "accuracy": accuracy_default,
        "f1": f1_default,
        "roc_auc": roc_auc,
        "classification_report": report_default,
        "threshold_metrics": at_threshold,
        "classification_threshold": threshold,
    });

    save_json(&config.model_path(), &pipeline)?;
    save_json(&config.metadata_path(), &metadata)?;
    save_json(&config.metrics_path(), &metrics_doc)?;

    info!(
        "Training complete: {} train rows, {} test rows, threshold {:.2}, roc_auc {:.3}",
        train_idx.len(),
        test_idx.len(),
        threshold,
        roc_auc
    );

    Ok(TrainingReport {
        threshold,
        accuracy: accuracy_default,
        roc_auc,
        num_training_rows: train_idx.len(),
        num_test_rows: test_idx.len(),
    })
}

/// Loads the fact table into a feature-row vector and a label vector.
/// An unreadable fact table is fatal; it means the ETL stage never ran.
fn load_fact_table(warehouse: &Connection) -> Result<(Vec<[f64; NUM_FEATURES]>, Vec<i32>)> {
    let query = format!(
        "SELECT {}, {} FROM {}",
        FEATURE_COLS.join(", "),
        LABEL_COL,
        WAREHOUSE_TABLE
    );
    let mut stmt = warehouse
        .prepare(&query)
        .with_context(|| format!("Failed to read fact table {}", WAREHOUSE_TABLE))?;
    let mapped = stmt
        .query_map([], |row| {
            let mut values = [f64::NAN; NUM_FEATURES];
            for (j, value) in values.iter_mut().enumerate() {
                if let Some(v) = row.get::<_, Option<f64>>(j)? {
                    *value = v;
                }
            }
            let label: i64 = row.get(NUM_FEATURES)?;
            Ok((values, i32::from(label != 0)))
        })
        .context("Failed to query fact table")?;

    let mut rows = Vec::new();
    let mut labels = Vec::new();
    for item in mapped {
        let (values, label) = item.context("Failed to read fact row")?;
        rows.push(values);
        labels.push(label);
    }
    Ok((rows, labels))
}

/// Seeded 75/25 split that shuffles and splits each class separately, so
/// both partitions preserve the class balance. Fails before any artifact is
/// written if a class cannot appear in both partitions.
pub fn stratified_split(
    labels: &[i32],
    test_fraction: f64,
    seed: u64,
) -> Result<(Vec<usize>, Vec<usize>)> {
    let mut by_class: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    for (index, &class) in labels.iter().enumerate() {
        by_class.entry(class).or_default().push(index);
    }
    ensure!(
        by_class.len() >= 2,
        "Stratified split requires at least two label classes, found {}",
        by_class.len()
    );

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();
    for (class, mut indices) in by_class {
        indices.shuffle(&mut rng);
        let n = indices.len();
        let n_test = ((n as f64 * test_fraction).round() as usize).max(1);
        ensure!(
            n_test < n,
            "Class {} has too few rows ({}) to appear in both partitions",
            class,
            n
        );
        test.extend_from_slice(&indices[..n_test]);
        train.extend_from_slice(&indices[n_test..]);
    }
    train.sort_unstable();
    test.sort_unstable();
    Ok((train, test))
}

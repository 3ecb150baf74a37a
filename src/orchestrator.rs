// src/orchestrator.rs
//! Sequences the three stages with direct calls: ETL, then training, then
//! inference. The first failing stage aborts the run; later stages never see
//! a partially updated upstream.

use anyhow::{Context, Result};
use log::info;

use crate::config::PipelineConfig;
use crate::inference::run_inference;
use crate::training::train_and_save;
use crate::warehouse::build_warehouse;

/// Outcome of a full pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub fact_rows: usize,
    pub threshold: f64,
    pub predictions_written: usize,
}

/// Runs ETL -> train -> inference, fail-fast. Schema validation of the raw
/// tables is an upstream concern; by the time this runs the operational
/// store is assumed well-formed and non-empty.
pub fn run_pipeline(config: &PipelineConfig) -> Result<PipelineSummary> {
    info!("=== ETL ===");
    let etl = build_warehouse(config).context("ETL stage failed")?;
    info!("ETL done. Fact rows: {}", etl.rows_written);

    info!("=== Training ===");
    let training = train_and_save(config).context("Training stage failed")?;
    info!(
        "Training done. Threshold: {:.2}, ROC-AUC: {:.3}",
        training.threshold, training.roc_auc
    );

    info!("=== Inference ===");
    let predictions_written = run_inference(config).context("Inference stage failed")?;
    info!("Inference done. Predictions: {}", predictions_written);

    Ok(PipelineSummary {
        fact_rows: etl.rows_written,
        threshold: training.threshold,
        predictions_written,
    })
}

// src/model/artifacts.rs
//! Artifact persistence: the fitted pipeline, its metadata and the metrics
//! bundle, each written as a full overwrite of the prior run's file.

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fs;
use std::path::Path;

use crate::config::DEFAULT_THRESHOLD;
use crate::model::pipeline::ScoringPipeline;

/// Metadata describing one training run. Overwritten wholesale each run; no
/// version history is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_name: String,
    pub model_version: String,
    pub trained_at: String,
    pub warehouse_table: String,
    pub num_training_rows: usize,
    pub num_test_rows: usize,
    pub features: Vec<String>,
    pub label: String,
    pub classification_threshold: f64,
}

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create artifact directory {}", parent.display()))?;
    }
    let file = fs::File::create(path)
        .with_context(|| format!("Failed to create artifact file {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)
        .with_context(|| format!("Failed to write artifact {}", path.display()))?;
    Ok(())
}

/// Loads the fitted pipeline. A missing or unreadable pipeline is fatal:
/// there is nothing to score with.
pub fn load_pipeline(path: &Path) -> Result<ScoringPipeline> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read model artifact {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to deserialize model artifact {}", path.display()))
}

/// Recovers the classification threshold from the metadata document.
/// Missing or unreadable metadata degrades to the default threshold rather
/// than failing the run.
pub fn load_threshold(metadata_path: &Path) -> f64 {
    let parsed: Option<JsonValue> = fs::read_to_string(metadata_path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok());
    match parsed
        .as_ref()
        .and_then(|doc| doc.get("classification_threshold"))
        .and_then(JsonValue::as_f64)
    {
        Some(threshold) => threshold,
        None => {
            warn!(
                "Could not read classification threshold from {}; using default {}",
                metadata_path.display(),
                DEFAULT_THRESHOLD
            );
            DEFAULT_THRESHOLD
        }
    }
}

// src/config.rs
//! Shared configuration for all pipeline stages. ETL, training and inference
//! must agree on paths, the feature list and the threshold-search constants.

use std::env;
use std::path::PathBuf;

/// Feature columns, in locked order. This is the contract between the
/// warehouse ETL, training and inference; no side may add, drop or reorder
/// a column independently.
pub const FEATURE_COLS: [&str; 10] = [
    "num_items",
    "total_value",
    "avg_product_cost",
    "customer_age",
    "customer_order_count",
    "order_dow",
    "order_month",
    "order_hour",
    "shipping_fee",
    "num_distinct_products",
];

pub const NUM_FEATURES: usize = FEATURE_COLS.len();

pub const LABEL_COL: &str = "late_delivery";
pub const WAREHOUSE_TABLE: &str = "fact_orders_ml";

pub const MODEL_NAME: &str = "late_delivery_pipeline";
pub const MODEL_VERSION: &str = "1.0.0";

/// Target recall for the late class (class 1) during threshold selection.
pub const TARGET_RECALL_LATE: f64 = 0.90;
/// Minimum precision to accept when maximizing recall instead.
pub const MIN_PRECISION: f64 = 0.10;
/// Decision boundary used when no scanned threshold qualifies, and when the
/// saved threshold metadata is missing or unreadable at inference time.
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Fixed seed for the stratified train/test split.
pub const SPLIT_SEED: u64 = 42;
pub const TEST_FRACTION: f64 = 0.25;

/// Resolved on-disk layout for the operational store, the warehouse store and
/// the model artifacts.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub artifacts_dir: PathBuf,
}

impl PipelineConfig {
    pub fn new(data_dir: impl Into<PathBuf>, artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            artifacts_dir: artifacts_dir.into(),
        }
    }

    /// Read `DATA_DIR` / `ARTIFACTS_DIR` from the environment, falling back to
    /// `./data` and `./artifacts`.
    pub fn from_env() -> Self {
        let data_dir = env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string());
        let artifacts_dir = env::var("ARTIFACTS_DIR").unwrap_or_else(|_| "artifacts".to_string());
        Self::new(data_dir, artifacts_dir)
    }

    /// Operational store: orders, order_items, products, customers,
    /// shipments, order_predictions.
    pub fn shop_db_path(&self) -> PathBuf {
        self.data_dir.join("shop.db")
    }

    /// Warehouse store: the fact table written by the ETL stage.
    pub fn warehouse_db_path(&self) -> PathBuf {
        self.data_dir.join("warehouse.db")
    }

    pub fn model_path(&self) -> PathBuf {
        self.artifacts_dir.join("late_delivery_model.json")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.artifacts_dir.join("model_metadata.json")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.artifacts_dir.join("metrics.json")
    }
}

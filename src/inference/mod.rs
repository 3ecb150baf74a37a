// src/inference/mod.rs
//! Inference: scores orders that have not shipped yet and upserts one
//! prediction row per order.
//!
//! Feature derivation goes through the same `features` module the warehouse
//! ETL uses; the only differences are scope (unfulfilled orders, bounded
//! aggregate join) and missing-value policy (the pipeline imputer fills
//! gaps instead of dropping the row, except for the required aggregates).

use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};
use rusqlite::Connection;

use crate::config::PipelineConfig;
use crate::features::{
    customer_order_counts, feature_matrix, order_count_for, order_item_aggregates,
    parse_timestamp, FeatureVector,
};
use crate::model::artifacts::{load_pipeline, load_threshold};
use crate::model::metrics::binarize;
use crate::model::pipeline::ScoringPipeline;
use crate::utils::db::{ensure_predictions_table, lenient_f64, open_store};

struct UnfulfilledOrderRow {
    order_id: i64,
    customer_id: i64,
    order_datetime: Option<String>,
    shipping_fee: Option<f64>,
    birthdate: Option<String>,
}

/// Loads the persisted model, scores unfulfilled orders, writes predictions.
/// A missing pipeline is fatal; a missing threshold degrades to the default.
pub fn run_inference(config: &PipelineConfig) -> Result<usize> {
    let pipeline = load_pipeline(&config.model_path())?;
    let threshold = load_threshold(&config.metadata_path());
    let mut shop =
        open_store(&config.shop_db_path()).context("Failed to open operational store")?;
    score_unfulfilled(&mut shop, &pipeline, threshold)
}

/// Scores against an already open store connection. Returns the number of
/// predictions written; zero candidates is a valid terminal state, not an
/// error.
pub fn score_unfulfilled(
    conn: &mut Connection,
    pipeline: &ScoringPipeline,
    threshold: f64,
) -> Result<usize> {
    // Full-history order counts, same definition the warehouse ETL uses.
    let order_counts = customer_order_counts(conn)?;

    let mut stmt = conn
        .prepare(
            "SELECT o.order_id, o.customer_id, o.order_datetime, o.shipping_fee, c.birthdate
             FROM orders o
             JOIN customers c ON o.customer_id = c.customer_id
             LEFT JOIN shipments s ON o.order_id = s.order_id
             WHERE s.order_id IS NULL",
        )
        .context("Failed to prepare unfulfilled-order query")?;
    let mapped = stmt
        .query_map([], |row| {
            // A non-numeric fee coerces to null here and gets imputed
            // downstream instead of failing the read.
            Ok(UnfulfilledOrderRow {
                order_id: row.get(0)?,
                customer_id: row.get(1)?,
                order_datetime: row.get(2)?,
                shipping_fee: lenient_f64(row, 3)?,
                birthdate: row.get(4)?,
            })
        })
        .context("Failed to query unfulfilled orders")?;
    let mut candidates = Vec::new();
    for row in mapped {
        candidates.push(row.context("Failed to read unfulfilled-order row")?);
    }
    drop(stmt);

    if candidates.is_empty() {
        ensure_predictions_table(conn)?;
        info!("No unfulfilled orders. Predictions written: 0");
        return Ok(0);
    }

    // Bounded-scope aggregation: only the candidate orders are joined.
    let order_ids: Vec<i64> = candidates.iter().map(|c| c.order_id).collect();
    let aggregates = order_item_aggregates(conn, Some(&order_ids))?;

    let mut scored_ids = Vec::new();
    let mut feature_rows = Vec::new();
    let mut dropped_aggregates = 0usize;
    let mut dropped_dates = 0usize;

    for row in &candidates {
        // Required aggregates first; a zero-quantity order surfaces here as
        // a null average cost and is filtered, not imputed.
        let Some(aggregate) = aggregates.get(&row.order_id) else {
            dropped_aggregates += 1;
            continue;
        };
        if aggregate.num_items.is_none()
            || aggregate.total_value.is_none()
            || aggregate.avg_product_cost.is_none()
        {
            dropped_aggregates += 1;
            continue;
        }

        let order_ts = row.order_datetime.as_deref().and_then(parse_timestamp);
        let birthdate = row.birthdate.as_deref().and_then(parse_timestamp);
        let (Some(order_ts), Some(birthdate)) = (order_ts, birthdate) else {
            dropped_dates += 1;
            continue;
        };

        let feature_vector = FeatureVector::derive(
            order_ts,
            birthdate,
            row.shipping_fee,
            Some(aggregate),
            order_count_for(&order_counts, row.customer_id),
        );
        scored_ids.push(row.order_id);
        feature_rows.push(feature_vector.to_row());
    }

    if dropped_aggregates + dropped_dates > 0 {
        warn!(
            "Filtered {} candidates on aggregates and {} on dates",
            dropped_aggregates, dropped_dates
        );
    }
    if feature_rows.is_empty() {
        ensure_predictions_table(conn)?;
        info!("No unfulfilled orders with valid features. Predictions written: 0");
        return Ok(0);
    }

    let x = feature_matrix(&feature_rows);
    let probabilities = pipeline.predict_proba(&x)?;
    let predictions = binarize(&probabilities, threshold);
    let scored_at = Utc::now().to_rfc3339();

    let tx = conn
        .transaction()
        .context("Failed to start predictions transaction")?;
    ensure_predictions_table(&tx)?;
    {
        let mut upsert = tx
            .prepare(
                "INSERT OR REPLACE INTO order_predictions
                 (order_id, late_delivery_probability, predicted_late_delivery, prediction_timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .context("Failed to prepare prediction upsert")?;
        for ((order_id, probability), predicted) in
            scored_ids.iter().zip(&probabilities).zip(&predictions)
        {
            upsert
                .execute(rusqlite::params![order_id, probability, predicted, scored_at])
                .with_context(|| format!("Failed to upsert prediction for order {}", order_id))?;
        }
    }
    tx.commit().context("Failed to commit predictions")?;

    info!("Inference complete. Predictions written: {}", scored_ids.len());
    Ok(scored_ids.len())
}

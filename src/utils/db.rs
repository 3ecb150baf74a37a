// src/utils/db.rs
//! SQLite connection handling shared by ETL, training and inference.

use anyhow::{Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, Row};
use std::path::Path;

/// Opens a store connection with the pragmas every stage relies on:
/// WAL journaling and a bounded busy wait so cross-process access is handled
/// by the store itself, not by this code.
pub fn open_store(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open store at {}", path.display()))?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA busy_timeout=5000;
         PRAGMA foreign_keys=ON;",
    )
    .context("Failed to apply store pragmas")?;
    Ok(conn)
}

/// Lenient numeric read. REAL and INTEGER pass through, numeric text parses,
/// and anything else (stray text, blobs, NULL) coerces to `None` so the
/// row-level filter handles it instead of aborting the run.
pub fn lenient_f64(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<f64>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Real(v) => Some(v),
        ValueRef::Integer(v) => Some(v as f64),
        ValueRef::Text(t) => std::str::from_utf8(t)
            .ok()
            .and_then(|s| s.trim().parse().ok()),
        _ => None,
    })
}

/// Integer counterpart of [`lenient_f64`]; REAL values truncate.
pub fn lenient_i64(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<i64>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Integer(v) => Some(v),
        ValueRef::Real(v) => Some(v as i64),
        ValueRef::Text(t) => std::str::from_utf8(t)
            .ok()
            .and_then(|s| s.trim().parse().ok()),
        _ => None,
    })
}

/// Creates the order_predictions table if it does not exist.
/// `order_id` is the primary key: re-scoring an order replaces its row.
pub fn ensure_predictions_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS order_predictions (
            order_id INTEGER PRIMARY KEY,
            late_delivery_probability REAL,
            predicted_late_delivery INTEGER,
            prediction_timestamp TEXT
        )",
        [],
    )
    .context("Failed to create order_predictions table")?;
    Ok(())
}

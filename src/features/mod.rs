// src/features/mod.rs
//! Shared feature derivation for ETL and inference.
//!
//! Both the warehouse builder and the inference scorer derive features
//! exclusively through this module. Everything here is deterministic over
//! valid inputs; the only I/O is the order-item aggregation read.

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use ndarray::Array2;
use rusqlite::Connection;
use std::collections::HashMap;

use crate::config::NUM_FEATURES;

const ORDER_ITEM_AGGREGATES_SQL: &str = "
    SELECT
        oi.order_id,
        SUM(oi.quantity) AS num_items,
        SUM(oi.quantity * oi.unit_price) AS total_value,
        SUM(p.cost * oi.quantity) / NULLIF(SUM(oi.quantity), 0) AS avg_product_cost,
        COUNT(DISTINCT oi.product_id) AS num_distinct_products
    FROM order_items oi
    JOIN products p ON oi.product_id = p.product_id";

/// Per-order aggregates over the item/product join.
///
/// `avg_product_cost` is quantity-weighted: SUM(cost * qty) / SUM(qty),
/// and is `None` exactly when the summed quantity is zero.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderItemAggregate {
    pub order_id: i64,
    pub num_items: Option<f64>,
    pub total_value: Option<f64>,
    pub avg_product_cost: Option<f64>,
    pub num_distinct_products: i64,
}

/// Computes order-item aggregates, keyed by order id.
///
/// With `order_ids = Some(..)` the join is restricted to those orders, which
/// is how inference avoids scanning the full item table. With `None` every
/// order that has at least one item row is covered.
pub fn order_item_aggregates(
    conn: &Connection,
    order_ids: Option<&[i64]>,
) -> Result<HashMap<i64, OrderItemAggregate>> {
    let query = match order_ids {
        None => format!("{} GROUP BY oi.order_id", ORDER_ITEM_AGGREGATES_SQL),
        Some(ids) => {
            let placeholders = vec!["?"; ids.len()].join(", ");
            format!(
                "{} WHERE oi.order_id IN ({}) GROUP BY oi.order_id",
                ORDER_ITEM_AGGREGATES_SQL, placeholders
            )
        }
    };

    let mut stmt = conn
        .prepare(&query)
        .context("Failed to prepare order-item aggregate query")?;
    let map_row = |row: &rusqlite::Row<'_>| {
        Ok(OrderItemAggregate {
            order_id: row.get(0)?,
            num_items: row.get(1)?,
            total_value: row.get(2)?,
            avg_product_cost: row.get(3)?,
            num_distinct_products: row.get(4)?,
        })
    };
    let rows = match order_ids {
        None => stmt.query_map([], map_row),
        Some(ids) => stmt.query_map(rusqlite::params_from_iter(ids.iter()), map_row),
    }
    .context("Failed to query order-item aggregates")?;

    let mut aggregates = HashMap::new();
    for row in rows {
        let agg = row.context("Failed to read order-item aggregate row")?;
        aggregates.insert(agg.order_id, agg);
    }
    Ok(aggregates)
}

/// Counts ALL orders per customer, shipped or not. Training and inference
/// must both use this full-table definition for customer_order_count.
pub fn customer_order_counts(conn: &Connection) -> Result<HashMap<i64, i64>> {
    let mut stmt = conn
        .prepare("SELECT customer_id, COUNT(*) FROM orders GROUP BY customer_id")
        .context("Failed to prepare customer order count query")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))
        .context("Failed to query customer order counts")?;

    let mut counts = HashMap::new();
    for row in rows {
        let (customer_id, count) = row.context("Failed to read customer order count row")?;
        counts.insert(customer_id, count);
    }
    Ok(counts)
}

/// Looks up a customer's total order count; customers absent from the
/// mapping get 0, never null.
pub fn order_count_for(counts: &HashMap<i64, i64>, customer_id: i64) -> i64 {
    counts.get(&customer_id).copied().unwrap_or(0)
}

/// Calendar features from the order timestamp.
/// Day-of-week convention is Monday = 0, pinned end to end.
pub fn datetime_features(ts: NaiveDateTime) -> (u32, u32, u32) {
    (
        ts.weekday().num_days_from_monday(),
        ts.month(),
        ts.hour(),
    )
}

/// Whole-year age at order time: floor(days(order_ts - birthdate) / 365).
/// Ages outside [0, 120] are nulled, never clamped.
pub fn customer_age(order_ts: NaiveDateTime, birthdate: NaiveDateTime) -> Option<i64> {
    let days = (order_ts - birthdate).num_seconds().div_euclid(86_400);
    let age = days.div_euclid(365);
    (0..=120).contains(&age).then_some(age)
}

/// Lenient timestamp parsing for raw text columns. Accepted formats:
/// `YYYY-MM-DD HH:MM:SS[.frac]`, `YYYY-MM-DDTHH:MM:SS[.frac]`,
/// `YYYY-MM-DD HH:MM`, the `YYYY/MM/DD` variants of each, and bare dates
/// (taken as midnight). Anything else is the caller's signal to filter the
/// row, not an error.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    for format in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y/%m/%d %H:%M:%S%.f",
        "%Y/%m/%d %H:%M",
    ] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts);
        }
    }
    for format in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(raw, format) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// The fixed ten-field feature vector consumed by the model.
///
/// Field order matches [`crate::config::FEATURE_COLS`]; `to_row` is the only
/// place that ordering is materialized.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub num_items: Option<f64>,
    pub total_value: Option<f64>,
    pub avg_product_cost: Option<f64>,
    pub customer_age: Option<f64>,
    pub customer_order_count: f64,
    pub order_dow: f64,
    pub order_month: f64,
    pub order_hour: f64,
    pub shipping_fee: Option<f64>,
    pub num_distinct_products: Option<f64>,
}

impl FeatureVector {
    /// Composes the shared derivations into one feature row. This is the
    /// call both the warehouse ETL and inference make; identical raw inputs
    /// yield bit-identical features on either path.
    pub fn derive(
        order_ts: NaiveDateTime,
        birthdate: NaiveDateTime,
        shipping_fee: Option<f64>,
        aggregate: Option<&OrderItemAggregate>,
        customer_order_count: i64,
    ) -> Self {
        let (dow, month, hour) = datetime_features(order_ts);
        Self {
            num_items: aggregate.and_then(|a| a.num_items),
            total_value: aggregate.and_then(|a| a.total_value),
            avg_product_cost: aggregate.and_then(|a| a.avg_product_cost),
            customer_age: customer_age(order_ts, birthdate).map(|a| a as f64),
            customer_order_count: customer_order_count as f64,
            order_dow: f64::from(dow),
            order_month: f64::from(month),
            order_hour: f64::from(hour),
            shipping_fee,
            num_distinct_products: aggregate.map(|a| a.num_distinct_products as f64),
        }
    }

    /// Numeric row in the locked column order; missing values become NaN and
    /// are left for the pipeline imputer.
    pub fn to_row(&self) -> [f64; NUM_FEATURES] {
        [
            self.num_items.unwrap_or(f64::NAN),
            self.total_value.unwrap_or(f64::NAN),
            self.avg_product_cost.unwrap_or(f64::NAN),
            self.customer_age.unwrap_or(f64::NAN),
            self.customer_order_count,
            self.order_dow,
            self.order_month,
            self.order_hour,
            self.shipping_fee.unwrap_or(f64::NAN),
            self.num_distinct_products.unwrap_or(f64::NAN),
        ]
    }

    /// True when every feature is present. The warehouse ETL only keeps
    /// complete rows; inference tolerates a missing age or fee (the imputer
    /// fills them) but not missing aggregates.
    pub fn is_complete(&self) -> bool {
        self.num_items.is_some()
            && self.total_value.is_some()
            && self.avg_product_cost.is_some()
            && self.customer_age.is_some()
            && self.shipping_fee.is_some()
            && self.num_distinct_products.is_some()
    }

    pub fn has_aggregates(&self) -> bool {
        self.num_items.is_some()
            && self.total_value.is_some()
            && self.avg_product_cost.is_some()
            && self.num_distinct_products.is_some()
    }
}

/// Stacks feature rows into the matrix shape the scoring pipeline consumes.
pub fn feature_matrix(rows: &[[f64; NUM_FEATURES]]) -> Array2<f64> {
    Array2::from_shape_fn((rows.len(), NUM_FEATURES), |(i, j)| rows[i][j])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shop_fixture() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (order_id INTEGER PRIMARY KEY, customer_id INTEGER,
                                  order_datetime TEXT, shipping_fee REAL);
             CREATE TABLE order_items (order_id INTEGER, product_id INTEGER,
                                       quantity INTEGER, unit_price REAL);
             CREATE TABLE products (product_id INTEGER PRIMARY KEY, cost REAL);",
        )
        .unwrap();
        conn
    }

    fn ts(raw: &str) -> NaiveDateTime {
        parse_timestamp(raw).unwrap()
    }

    #[test]
    fn weighted_average_product_cost() {
        let conn = shop_fixture();
        conn.execute_batch(
            "INSERT INTO products VALUES (1, 10.0), (2, 20.0);
             INSERT INTO order_items VALUES (7, 1, 2, 5.0), (7, 2, 3, 8.0);",
        )
        .unwrap();

        let aggregates = order_item_aggregates(&conn, None).unwrap();
        let agg = &aggregates[&7];
        // (2*10 + 3*20) / (2 + 3) = 16
        assert_eq!(agg.avg_product_cost, Some(16.0));
        assert_eq!(agg.num_items, Some(5.0));
        assert_eq!(agg.total_value, Some(2.0 * 5.0 + 3.0 * 8.0));
        assert_eq!(agg.num_distinct_products, 2);
    }

    #[test]
    fn zero_quantity_yields_null_average() {
        let conn = shop_fixture();
        conn.execute_batch(
            "INSERT INTO products VALUES (1, 10.0);
             INSERT INTO order_items VALUES (8, 1, 0, 5.0);",
        )
        .unwrap();

        let aggregates = order_item_aggregates(&conn, None).unwrap();
        let agg = &aggregates[&8];
        assert_eq!(agg.avg_product_cost, None);
        assert_eq!(agg.num_items, Some(0.0));
    }

    #[test]
    fn aggregate_scope_can_be_restricted() {
        let conn = shop_fixture();
        conn.execute_batch(
            "INSERT INTO products VALUES (1, 10.0);
             INSERT INTO order_items VALUES (1, 1, 1, 5.0), (2, 1, 1, 5.0), (3, 1, 1, 5.0);",
        )
        .unwrap();

        let all = order_item_aggregates(&conn, None).unwrap();
        assert_eq!(all.len(), 3);

        let some = order_item_aggregates(&conn, Some(&[1, 3])).unwrap();
        assert_eq!(some.len(), 2);
        assert!(some.contains_key(&1) && some.contains_key(&3));
        // Values must match the unrestricted computation.
        assert_eq!(some[&1], all[&1]);
    }

    #[test]
    fn datetime_features_use_monday_zero() {
        // 2024-01-01 was a Monday.
        let (dow, month, hour) = datetime_features(ts("2024-01-01 13:45:00"));
        assert_eq!((dow, month, hour), (0, 1, 13));

        // 2024-03-10 was a Sunday.
        let (dow, month, hour) = datetime_features(ts("2024-03-10 00:05:00"));
        assert_eq!((dow, month, hour), (6, 3, 0));
    }

    #[test]
    fn age_boundaries() {
        let order = ts("2024-06-15 12:00:00");
        // Exactly 120 years before the order date floors to 120 and is kept.
        assert_eq!(customer_age(order, ts("1904-06-15")), Some(120));
        // 121 years is out of range, nulled rather than clamped.
        assert_eq!(customer_age(order, ts("1903-06-15")), None);
        // Birthdate after the order is a negative age, also nulled.
        assert_eq!(customer_age(order, ts("2025-01-01")), None);
        // Even a few hours in the future floors to -1, not 0.
        assert_eq!(customer_age(ts("2024-06-15 00:00:00"), ts("2024-06-15 10:00:00")), None);
    }

    #[test]
    fn order_count_defaults_to_zero() {
        let mut counts = HashMap::new();
        counts.insert(1_i64, 5_i64);
        assert_eq!(order_count_for(&counts, 1), 5);
        assert_eq!(order_count_for(&counts, 99), 0);
    }

    #[test]
    fn derive_is_deterministic_across_paths() {
        let agg = OrderItemAggregate {
            order_id: 1,
            num_items: Some(5.0),
            total_value: Some(34.0),
            avg_product_cost: Some(16.0),
            num_distinct_products: 2,
        };
        let order = ts("2024-01-01 13:45:00");
        let birth = ts("1990-05-20");

        let a = FeatureVector::derive(order, birth, Some(4.5), Some(&agg), 5);
        let b = FeatureVector::derive(order, birth, Some(4.5), Some(&agg), 5);
        assert_eq!(a, b);
        assert_eq!(a.to_row(), b.to_row());
        assert!(a.is_complete());
        assert_eq!(a.order_dow, 0.0);
        assert_eq!(a.customer_order_count, 5.0);
    }

    #[test]
    fn derive_without_items_is_incomplete() {
        let fv = FeatureVector::derive(ts("2024-01-01 13:45:00"), ts("1990-05-20"), Some(4.5), None, 2);
        assert!(!fv.is_complete());
        assert!(!fv.has_aggregates());
        assert!(fv.to_row()[0].is_nan());
        // Datetime and count features are still present.
        assert_eq!(fv.order_month, 1.0);
        assert_eq!(fv.customer_order_count, 2.0);
    }

    #[test]
    fn parse_timestamp_accepts_common_formats() {
        assert!(parse_timestamp("2024-01-02 03:04:05").is_some());
        assert!(parse_timestamp("2024-01-02T03:04:05").is_some());
        assert!(parse_timestamp("2024-01-02").is_some());
        assert_eq!(
            parse_timestamp("2024/01/02 03:04:05"),
            parse_timestamp("2024-01-02 03:04:05")
        );
        assert_eq!(parse_timestamp("2024/01/02"), parse_timestamp("2024-01-02"));
        assert!(parse_timestamp("not a date").is_none());
        assert!(parse_timestamp("").is_none());
    }
}

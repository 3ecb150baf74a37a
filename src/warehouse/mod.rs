// src/warehouse/mod.rs
//! Warehouse ETL: builds the flat, labeled fact table from shipped orders.
//!
//! Label presence requires a shipment row and a resolvable customer; rows
//! with unparsable dates or missing features are filtered out rather than
//! failing the run. The fact table is replaced wholesale on every run.

use anyhow::{Context, Result};
use log::info;
use rusqlite::Connection;
use std::fs;

use crate::config::PipelineConfig;
use crate::features::{
    self, order_count_for, parse_timestamp, FeatureVector,
};
use crate::utils::db::{lenient_f64, lenient_i64, open_store};

/// Row counts from one ETL run. Filtered counts are surfaced for auditing;
/// filtering itself is deliberate policy, not an error.
#[derive(Debug, Clone, Copy)]
pub struct EtlReport {
    pub rows_written: usize,
    pub rows_filtered_dates: usize,
    pub rows_filtered_features: usize,
}

struct ShippedOrderRow {
    order_id: i64,
    customer_id: i64,
    order_datetime: Option<String>,
    shipping_fee: Option<f64>,
    ship_datetime: Option<String>,
    late_delivery: Option<i64>,
    birthdate: Option<String>,
}

struct FactRow {
    order_id: i64,
    customer_id: i64,
    features: FeatureVector,
    label: i64,
}

/// Opens both stores and rebuilds the fact table. Returns the run's report.
pub fn build_warehouse(config: &PipelineConfig) -> Result<EtlReport> {
    fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("Failed to create data directory {}", config.data_dir.display())
    })?;
    let shop = open_store(&config.shop_db_path()).context("Failed to open operational store")?;
    let mut warehouse =
        open_store(&config.warehouse_db_path()).context("Failed to open warehouse store")?;
    build_fact_table(&shop, &mut warehouse)
}

/// The ETL itself, separated from path handling so tests can run it against
/// in-memory stores.
pub fn build_fact_table(shop: &Connection, warehouse: &mut Connection) -> Result<EtlReport> {
    // Order-level aggregates over the full item table, and the full-history
    // order count per customer (shipped or not; same definition inference
    // uses).
    let aggregates = features::order_item_aggregates(shop, None)?;
    let order_counts = features::customer_order_counts(shop)?;

    let mut stmt = shop
        .prepare(
            "SELECT
                o.order_id,
                o.customer_id,
                o.order_datetime,
                o.shipping_fee,
                s.ship_datetime,
                s.late_delivery,
                c.birthdate
            FROM orders o
            INNER JOIN shipments s ON o.order_id = s.order_id
            JOIN customers c ON o.customer_id = c.customer_id",
        )
        .context("Failed to prepare shipped-order query")?;
    let rows = stmt
        .query_map([], |row| {
            // Numeric columns read leniently: a stray non-numeric value
            // coerces to null and the row is filtered, never the run.
            Ok(ShippedOrderRow {
                order_id: row.get(0)?,
                customer_id: row.get(1)?,
                order_datetime: row.get(2)?,
                shipping_fee: lenient_f64(row, 3)?,
                ship_datetime: row.get(4)?,
                late_delivery: lenient_i64(row, 5)?,
                birthdate: row.get(6)?,
            })
        })
        .context("Failed to query shipped orders")?;

    let mut fact_rows = Vec::new();
    let mut rows_filtered_dates = 0usize;
    let mut rows_filtered_features = 0usize;

    for row in rows {
        let row = row.context("Failed to read shipped-order row")?;

        // All three dates must parse; the ship timestamp is only checked for
        // validity, it contributes no feature.
        let order_ts = row.order_datetime.as_deref().and_then(parse_timestamp);
        let ship_ts = row.ship_datetime.as_deref().and_then(parse_timestamp);
        let birthdate = row.birthdate.as_deref().and_then(parse_timestamp);
        let (Some(order_ts), Some(_), Some(birthdate)) = (order_ts, ship_ts, birthdate) else {
            rows_filtered_dates += 1;
            continue;
        };

        let feature_vector = FeatureVector::derive(
            order_ts,
            birthdate,
            row.shipping_fee,
            aggregates.get(&row.order_id),
            order_count_for(&order_counts, row.customer_id),
        );

        // The training snapshot only keeps rows with every feature and the
        // label present.
        let Some(label) = row.late_delivery else {
            rows_filtered_features += 1;
            continue;
        };
        if !feature_vector.is_complete() {
            rows_filtered_features += 1;
            continue;
        }

        fact_rows.push(FactRow {
            order_id: row.order_id,
            customer_id: row.customer_id,
            features: feature_vector,
            label: i64::from(label != 0),
        });
    }
    drop(stmt);

    write_fact_table(warehouse, &fact_rows)?;

    let report = EtlReport {
        rows_written: fact_rows.len(),
        rows_filtered_dates,
        rows_filtered_features,
    };
    info!(
        "Fact table rebuilt: {} rows written, {} filtered on dates, {} filtered on features",
        report.rows_written, report.rows_filtered_dates, report.rows_filtered_features
    );
    Ok(report)
}

/// Full replace: the previous snapshot is dropped and rewritten in one
/// transaction, so a failure leaves either the old table or the new one,
/// never a mix.
fn write_fact_table(warehouse: &mut Connection, fact_rows: &[FactRow]) -> Result<()> {
    let tx = warehouse
        .transaction()
        .context("Failed to start warehouse transaction")?;
    tx.execute_batch(
        "DROP TABLE IF EXISTS fact_orders_ml;
         CREATE TABLE fact_orders_ml (
            order_id INTEGER,
            customer_id INTEGER,
            num_items REAL,
            total_value REAL,
            avg_product_cost REAL,
            customer_age REAL,
            customer_order_count REAL,
            order_dow REAL,
            order_month REAL,
            order_hour REAL,
            shipping_fee REAL,
            num_distinct_products REAL,
            late_delivery INTEGER
         );",
    )
    .context("Failed to recreate fact_orders_ml")?;

    {
        let mut insert = tx
            .prepare(
                "INSERT INTO fact_orders_ml VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )
            .context("Failed to prepare fact-row insert")?;
        for fact in fact_rows {
            let f = fact.features.to_row();
            insert
                .execute(rusqlite::params![
                    fact.order_id,
                    fact.customer_id,
                    f[0],
                    f[1],
                    f[2],
                    f[3],
                    f[4],
                    f[5],
                    f[6],
                    f[7],
                    f[8],
                    f[9],
                    fact.label,
                ])
                .with_context(|| format!("Failed to insert fact row for order {}", fact.order_id))?;
        }
    }
    tx.commit().context("Failed to commit fact table")
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
             CREATE TABLE products (product_id INTEGER PRIMARY KEY, cost REAL);
             CREATE TABLE customers (customer_id INTEGER PRIMARY KEY, birthdate TEXT);
             CREATE TABLE shipments (shipment_id INTEGER PRIMARY KEY, order_id INTEGER,
                                     ship_datetime TEXT, late_delivery INTEGER);",
        )
        .unwrap();
        conn
    }

    fn seed_valid_order(conn: &Connection, order_id: i64, late: i64) {
        conn.execute(
            "INSERT INTO orders VALUES (?1, 1, '2024-03-04 10:30:00', 4.5)",
            [order_id],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO order_items VALUES (?1, 1, 2, 3.0)",
            [order_id],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO shipments VALUES (NULL, ?1, '2024-03-05 08:00:00', ?2)",
            [order_id, late],
        )
        .unwrap();
    }

    #[test]
    fn builds_labeled_rows_for_shipped_orders() {
        let shop = shop_fixture();
        shop.execute_batch(
            "INSERT INTO products VALUES (1, 10.0);
             INSERT INTO customers VALUES (1, '1990-05-20');",
        )
        .unwrap();
        seed_valid_order(&shop, 1, 1);
        seed_valid_order(&shop, 2, 0);
        // Unshipped order: contributes to customer_order_count but not to
        // the fact table.
        shop.execute(
            "INSERT INTO orders VALUES (3, 1, '2024-03-06 09:00:00', 2.0)",
            [],
        )
        .unwrap();

        let mut warehouse = Connection::open_in_memory().unwrap();
        let report = build_fact_table(&shop, &mut warehouse).unwrap();
        assert_eq!(report.rows_written, 2);
        assert_eq!(report.rows_filtered_dates, 0);
        assert_eq!(report.rows_filtered_features, 0);

        // Order count reflects the full history, including the unshipped
        // order.
        let count: f64 = warehouse
            .query_row(
                "SELECT customer_order_count FROM fact_orders_ml WHERE order_id = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 3.0);

        let label: i64 = warehouse
            .query_row(
                "SELECT late_delivery FROM fact_orders_ml WHERE order_id = 2",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(label, 0);
    }

    #[test]
    fn unparsable_dates_filter_the_row() {
        let shop = shop_fixture();
        shop.execute_batch(
            "INSERT INTO products VALUES (1, 10.0);
             INSERT INTO customers VALUES (1, 'not-a-date');",
        )
        .unwrap();
        seed_valid_order(&shop, 1, 1);

        let mut warehouse = Connection::open_in_memory().unwrap();
        let report = build_fact_table(&shop, &mut warehouse).unwrap();
        assert_eq!(report.rows_written, 0);
        assert_eq!(report.rows_filtered_dates, 1);
    }

    #[test]
    fn orders_without_items_are_filtered_on_features() {
        let shop = shop_fixture();
        shop.execute_batch(
            "INSERT INTO products VALUES (1, 10.0);
             INSERT INTO customers VALUES (1, '1990-05-20');
             INSERT INTO orders VALUES (1, 1, '2024-03-04 10:30:00', 4.5);
             INSERT INTO shipments VALUES (NULL, 1, '2024-03-05 08:00:00', 1);",
        )
        .unwrap();

        let mut warehouse = Connection::open_in_memory().unwrap();
        let report = build_fact_table(&shop, &mut warehouse).unwrap();
        assert_eq!(report.rows_written, 0);
        assert_eq!(report.rows_filtered_features, 1);
    }

    #[test]
    fn non_numeric_values_filter_the_row_not_the_run() {
        let shop = shop_fixture();
        shop.execute_batch(
            "INSERT INTO products VALUES (1, 10.0);
             INSERT INTO customers VALUES (1, '1990-05-20');",
        )
        .unwrap();
        seed_valid_order(&shop, 1, 1);
        // Stray text where numbers belong: an unparsable shipping fee on one
        // order, an unparsable label on another.
        shop.execute_batch(
            "INSERT INTO orders VALUES (2, 1, '2024-03-04 10:30:00', 'oops');
             INSERT INTO order_items VALUES (2, 1, 2, 3.0);
             INSERT INTO shipments VALUES (NULL, 2, '2024-03-05 08:00:00', 1);
             INSERT INTO orders VALUES (3, 1, '2024-03-04 10:30:00', 4.5);
             INSERT INTO order_items VALUES (3, 1, 2, 3.0);
             INSERT INTO shipments VALUES (NULL, 3, '2024-03-05 08:00:00', 'late');",
        )
        .unwrap();

        let mut warehouse = Connection::open_in_memory().unwrap();
        let report = build_fact_table(&shop, &mut warehouse).unwrap();
        assert_eq!(report.rows_written, 1);
        assert_eq!(report.rows_filtered_features, 2);
    }

    #[test]
    fn rebuild_replaces_the_previous_snapshot() {
        let shop = shop_fixture();
        shop.execute_batch(
            "INSERT INTO products VALUES (1, 10.0);
             INSERT INTO customers VALUES (1, '1990-05-20');",
        )
        .unwrap();
        seed_valid_order(&shop, 1, 1);

        let mut warehouse = Connection::open_in_memory().unwrap();
        build_fact_table(&shop, &mut warehouse).unwrap();
        build_fact_table(&shop, &mut warehouse).unwrap();

        let rows: i64 = warehouse
            .query_row("SELECT COUNT(*) FROM fact_orders_ml", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn missing_raw_table_is_fatal() {
        let shop = Connection::open_in_memory().unwrap();
        let mut warehouse = Connection::open_in_memory().unwrap();
        assert!(build_fact_table(&shop, &mut warehouse).is_err());
    }
}

//! Persistence layer: schema, idempotent upserts keyed by external id, the
//! sync run log and the read API consumed by the web/export layer.
//!
//! All SQL is built through the [`SqlDialect`] capability interface so the
//! same logical operations run against both backends. Timestamps are stored
//! as RFC 3339 UTC text and booleans as 0/1 integers; both representations
//! behave identically across the two dialects.

mod dialect;

use std::sync::{Arc, Once};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::{AnyArguments, AnyPoolOptions};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row};
use thiserror::Error;
use tracing::debug;

use rtd_core::{
    Client, Order, OrderItem, OrderRef, Product, Return, ReturnIntegration, ReturnItem, RunStatus,
    RunTally, StoreChannel, SyncLog, Warehouse,
};

pub use dialect::{placeholders, set_list, PostgresDialect, SqlDialect, SqliteDialect};

pub const CRATE_NAME: &str = "rtd-store";

static INSTALL_DRIVERS: Once = Once::new();

type AnyQuery<'q> = Query<'q, Any, AnyArguments<'q>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("a sync run is already in progress")]
    RunInProgress,
    #[error("unsupported database url (expected sqlite: or postgres:): {0}")]
    UnsupportedUrl(String),
    #[error("encoding tag list: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of an upsert: whether the row was inserted or refreshed in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Filter shared by the search, export and id-set read paths.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReturnFilter {
    pub client_id: Option<i64>,
    /// `Some(false)` selects pending returns, `Some(true)` processed ones.
    pub processed: Option<bool>,
    /// Matches tracking number, return id and client name.
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReturnSummary {
    pub id: i64,
    pub status: Option<String>,
    pub processed: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub tracking_number: Option<String>,
    pub client_name: Option<String>,
    pub warehouse_name: Option<String>,
    pub order_id: Option<i64>,
    pub order_number: Option<String>,
    pub customer_name: Option<String>,
    pub order_created_at: Option<DateTime<Utc>>,
    pub items_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReturnPage {
    pub rows: Vec<ReturnSummary>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReturnItemDetail {
    #[serde(flatten)]
    pub item: ReturnItem,
    pub product_sku: Option<String>,
    pub product_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReturnDetail {
    #[serde(flatten)]
    pub summary: ReturnSummary,
    pub items: Vec<ReturnItemDetail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
    pub total_returns: i64,
    pub processed_returns: i64,
    pub pending_returns: i64,
    pub total_clients: i64,
    pub total_items: i64,
    pub last_completed_sync: Option<DateTime<Utc>>,
}

/// One flattened export row: a return crossed with one of its line items.
#[derive(Debug, Clone, Serialize)]
pub struct ExportRow {
    pub client_name: Option<String>,
    pub customer_name: Option<String>,
    pub order_date: Option<DateTime<Utc>>,
    pub return_date: Option<DateTime<Utc>>,
    pub order_number: Option<String>,
    pub item_name: String,
    pub order_qty: i64,
    pub return_qty: i64,
    pub reasons: String,
    pub proxy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReasonCount {
    pub reason: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopProduct {
    pub sku: String,
    pub name: String,
    pub total_quantity: i64,
    pub return_count: i64,
}

enum Arg {
    Int(i64),
    Text(String),
}

fn bind_args<'q>(mut query: AnyQuery<'q>, args: &'q [Arg]) -> AnyQuery<'q> {
    for arg in args {
        query = match arg {
            Arg::Int(v) => query.bind(*v),
            Arg::Text(s) => query.bind(s.as_str()),
        };
    }
    query
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn read_ts(row: &sqlx::any::AnyRow, column: &str) -> Option<DateTime<Utc>> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .as_deref()
        .and_then(parse_ts)
}

fn decode_tags(raw: Option<String>) -> Vec<String> {
    raw.as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

const RETURN_FIELD_COLS: &[&str] = &[
    "api_id",
    "status",
    "paid_by",
    "processed",
    "processed_at",
    "warehouse_note",
    "customer_note",
    "tracking_number",
    "tracking_url",
    "carrier",
    "service",
    "label_cost",
    "label_pdf_url",
    "rma_slip_url",
    "label_voided",
    "created_at",
    "updated_at",
    "client_id",
    "warehouse_id",
    "order_id",
    "integration_id",
];

fn bind_return_fields<'q>(query: AnyQuery<'q>, r: &'q Return) -> AnyQuery<'q> {
    query
        .bind(r.api_id.as_deref())
        .bind(r.status.as_deref())
        .bind(r.paid_by.as_deref())
        .bind(r.processed as i64)
        .bind(r.processed_at.map(ts))
        .bind(r.warehouse_note.as_deref())
        .bind(r.customer_note.as_deref())
        .bind(r.tracking_number.as_deref())
        .bind(r.tracking_url.as_deref())
        .bind(r.carrier.as_deref())
        .bind(r.service.as_deref())
        .bind(r.label_cost)
        .bind(r.label_pdf_url.as_deref())
        .bind(r.rma_slip_url.as_deref())
        .bind(r.label_voided as i64)
        .bind(r.created_at.map(ts))
        .bind(r.updated_at.map(ts))
        .bind(r.client_id)
        .bind(r.warehouse_id)
        .bind(r.order_id)
        .bind(r.integration_id)
}

const RETURN_SUMMARY_SELECT: &str = "SELECT r.id, r.status, r.processed, r.created_at, \
     r.tracking_number, r.order_id, c.name AS client_name, w.name AS warehouse_name, \
     o.order_number, o.customer_name, o.created_at AS order_created_at, \
     (SELECT COUNT(*) FROM return_items ri WHERE ri.return_id = r.id) AS items_count \
     FROM returns r \
     LEFT JOIN clients c ON r.client_id = c.id \
     LEFT JOIN warehouses w ON r.warehouse_id = w.id \
     LEFT JOIN orders o ON r.order_id = o.id";

fn map_return_summary(row: &sqlx::any::AnyRow) -> Result<ReturnSummary, StoreError> {
    Ok(ReturnSummary {
        id: row.try_get("id")?,
        status: row.try_get("status")?,
        processed: row.try_get::<i64, _>("processed")? != 0,
        created_at: read_ts(row, "created_at"),
        tracking_number: row.try_get("tracking_number")?,
        client_name: row.try_get("client_name")?,
        warehouse_name: row.try_get("warehouse_name")?,
        order_id: row.try_get("order_id")?,
        order_number: row.try_get("order_number")?,
        customer_name: row.try_get("customer_name")?,
        order_created_at: read_ts(row, "order_created_at"),
        items_count: row.try_get("items_count")?,
    })
}

fn map_sync_log(row: &sqlx::any::AnyRow) -> Result<SyncLog, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(SyncLog {
        id: row.try_get("id")?,
        started_at: read_ts(row, "started_at").unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        completed_at: read_ts(row, "completed_at"),
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        total_pages: row.try_get("total_pages")?,
        total_fetched: row.try_get("total_fetched")?,
        created: row.try_get("created")?,
        updated: row.try_get("updated")?,
        skipped: row.try_get("skipped")?,
        error_message: row.try_get("error_message")?,
        current_phase: row.try_get("current_phase")?,
        processed_count: row.try_get("processed_count")?,
        total_to_process: row.try_get("total_to_process")?,
    })
}

const SYNC_LOG_SELECT: &str = "SELECT id, started_at, completed_at, status, total_pages, \
     total_fetched, created, updated, skipped, error_message, current_phase, \
     processed_count, total_to_process FROM sync_logs";

fn schema_statements(dialect: &dyn SqlDialect) -> Vec<String> {
    vec![
        "CREATE TABLE IF NOT EXISTS clients (\
             id BIGINT PRIMARY KEY, \
             name TEXT NOT NULL, \
             created_at TEXT NOT NULL, \
             updated_at TEXT NOT NULL)"
            .to_string(),
        "CREATE TABLE IF NOT EXISTS warehouses (\
             id BIGINT PRIMARY KEY, \
             name TEXT NOT NULL, \
             created_at TEXT NOT NULL, \
             updated_at TEXT NOT NULL)"
            .to_string(),
        "CREATE TABLE IF NOT EXISTS stores (\
             id BIGINT PRIMARY KEY, \
             name TEXT NOT NULL, \
             created_at TEXT NOT NULL, \
             updated_at TEXT NOT NULL)"
            .to_string(),
        "CREATE TABLE IF NOT EXISTS return_integrations (\
             id BIGINT PRIMARY KEY, \
             name TEXT NOT NULL, \
             integration_type TEXT, \
             store_id BIGINT REFERENCES stores(id), \
             created_at TEXT NOT NULL, \
             updated_at TEXT NOT NULL)"
            .to_string(),
        "CREATE TABLE IF NOT EXISTS orders (\
             id BIGINT PRIMARY KEY, \
             order_number TEXT NOT NULL, \
             customer_name TEXT, \
             created_at TEXT, \
             updated_at TEXT, \
             first_synced_at TEXT NOT NULL, \
             last_synced_at TEXT NOT NULL)"
            .to_string(),
        "CREATE TABLE IF NOT EXISTS order_items (\
             id BIGINT NOT NULL, \
             order_id BIGINT NOT NULL REFERENCES orders(id) ON DELETE CASCADE, \
             product_id BIGINT, \
             sku TEXT, \
             name TEXT, \
             quantity BIGINT NOT NULL DEFAULT 0, \
             quantity_shipped BIGINT NOT NULL DEFAULT 0, \
             unit_price DOUBLE PRECISION, \
             bundle_order_item_id BIGINT, \
             PRIMARY KEY (order_id, id))"
            .to_string(),
        "CREATE TABLE IF NOT EXISTS products (\
             id BIGINT PRIMARY KEY, \
             sku TEXT NOT NULL UNIQUE, \
             name TEXT NOT NULL, \
             created_at TEXT NOT NULL, \
             updated_at TEXT NOT NULL)"
            .to_string(),
        "CREATE TABLE IF NOT EXISTS returns (\
             id BIGINT PRIMARY KEY, \
             api_id TEXT, \
             status TEXT, \
             paid_by TEXT, \
             processed INTEGER NOT NULL DEFAULT 0, \
             processed_at TEXT, \
             warehouse_note TEXT, \
             customer_note TEXT, \
             tracking_number TEXT, \
             tracking_url TEXT, \
             carrier TEXT, \
             service TEXT, \
             label_cost DOUBLE PRECISION, \
             label_pdf_url TEXT, \
             rma_slip_url TEXT, \
             label_voided INTEGER NOT NULL DEFAULT 0, \
             created_at TEXT, \
             updated_at TEXT, \
             client_id BIGINT REFERENCES clients(id), \
             warehouse_id BIGINT REFERENCES warehouses(id), \
             order_id BIGINT REFERENCES orders(id), \
             integration_id BIGINT REFERENCES return_integrations(id), \
             first_synced_at TEXT NOT NULL, \
             last_synced_at TEXT NOT NULL)"
            .to_string(),
        "CREATE TABLE IF NOT EXISTS return_items (\
             id BIGINT NOT NULL, \
             return_id BIGINT NOT NULL REFERENCES returns(id) ON DELETE CASCADE, \
             product_id BIGINT, \
             raw_quantity BIGINT NOT NULL DEFAULT 0, \
             quantity BIGINT NOT NULL DEFAULT 0, \
             quantity_received BIGINT NOT NULL DEFAULT 0, \
             quantity_rejected BIGINT NOT NULL DEFAULT 0, \
             return_reasons TEXT, \
             condition_on_arrival TEXT, \
             proxy INTEGER NOT NULL DEFAULT 0, \
             PRIMARY KEY (return_id, id))"
            .to_string(),
        format!(
            "CREATE TABLE IF NOT EXISTS sync_logs (\
             id {}, \
             started_at TEXT NOT NULL, \
             completed_at TEXT, \
             status TEXT NOT NULL, \
             total_pages BIGINT NOT NULL DEFAULT 0, \
             total_fetched BIGINT NOT NULL DEFAULT 0, \
             created BIGINT NOT NULL DEFAULT 0, \
             updated BIGINT NOT NULL DEFAULT 0, \
             skipped BIGINT NOT NULL DEFAULT 0, \
             error_message TEXT, \
             current_phase TEXT NOT NULL DEFAULT 'initializing', \
             processed_count BIGINT NOT NULL DEFAULT 0, \
             total_to_process BIGINT NOT NULL DEFAULT 0)",
            dialect.auto_increment_pk()
        ),
        "CREATE INDEX IF NOT EXISTS idx_returns_client_id ON returns(client_id)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_returns_status ON returns(status)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_returns_created_at ON returns(created_at)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_returns_processed ON returns(processed)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_returns_warehouse_id ON returns(warehouse_id)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_return_items_product_id ON return_items(product_id)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_sync_logs_status ON sync_logs(status)".to_string(),
        "CREATE INDEX IF NOT EXISTS idx_sync_logs_started_at ON sync_logs(started_at)".to_string(),
    ]
}

/// Handle over the relational store. Cheap to clone; all methods are
/// individually atomic (one transaction per upserted record).
#[derive(Clone)]
pub struct Store {
    pool: AnyPool,
    dialect: Arc<dyn SqlDialect>,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);
        let dialect: Arc<dyn SqlDialect> = if database_url.starts_with("sqlite:") {
            Arc::new(SqliteDialect)
        } else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
            Arc::new(PostgresDialect)
        } else {
            return Err(StoreError::UnsupportedUrl(database_url.to_string()));
        };
        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool, dialect })
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in schema_statements(self.dialect.as_ref()) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        debug!(dialect = self.dialect.name(), "schema applied");
        Ok(())
    }

    // ---- upserts -----------------------------------------------------------

    pub async fn upsert_client(&self, client: &Client) -> Result<UpsertOutcome, StoreError> {
        self.upsert_named("clients", client.id, &client.name).await
    }

    pub async fn upsert_warehouse(&self, warehouse: &Warehouse) -> Result<UpsertOutcome, StoreError> {
        self.upsert_named("warehouses", warehouse.id, &warehouse.name)
            .await
    }

    pub async fn upsert_store_channel(
        &self,
        store: &StoreChannel,
    ) -> Result<UpsertOutcome, StoreError> {
        self.upsert_named("stores", store.id, &store.name).await
    }

    async fn upsert_named(
        &self,
        table: &str,
        id: i64,
        name: &str,
    ) -> Result<UpsertOutcome, StoreError> {
        let d = self.dialect.as_ref();
        let now = ts(Utc::now());
        let mut tx = self.pool.begin().await?;

        let select = format!("SELECT id FROM {table} WHERE id = {}", d.placeholder(1));
        let existing = sqlx::query(&select).bind(id).fetch_optional(&mut *tx).await?;

        let outcome = if existing.is_some() {
            let sql = format!(
                "UPDATE {table} SET name = {}, updated_at = {} WHERE id = {}",
                d.placeholder(1),
                d.placeholder(2),
                d.placeholder(3)
            );
            sqlx::query(&sql)
                .bind(name)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            UpsertOutcome::Updated
        } else {
            let sql = format!(
                "INSERT INTO {table} (id, name, created_at, updated_at) VALUES ({})",
                placeholders(d, 1, 4)
            );
            sqlx::query(&sql)
                .bind(id)
                .bind(name)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            UpsertOutcome::Created
        };
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn upsert_integration(
        &self,
        integration: &ReturnIntegration,
    ) -> Result<UpsertOutcome, StoreError> {
        let d = self.dialect.as_ref();
        let now = ts(Utc::now());
        let mut tx = self.pool.begin().await?;

        let select = format!(
            "SELECT id FROM return_integrations WHERE id = {}",
            d.placeholder(1)
        );
        let existing = sqlx::query(&select)
            .bind(integration.id)
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = if existing.is_some() {
            let sql = format!(
                "UPDATE return_integrations SET {} WHERE id = {}",
                set_list(d, 1, &["name", "integration_type", "store_id", "updated_at"]),
                d.placeholder(5)
            );
            sqlx::query(&sql)
                .bind(&integration.name)
                .bind(integration.integration_type.as_deref())
                .bind(integration.store_id)
                .bind(&now)
                .bind(integration.id)
                .execute(&mut *tx)
                .await?;
            UpsertOutcome::Updated
        } else {
            let sql = format!(
                "INSERT INTO return_integrations \
                 (id, name, integration_type, store_id, created_at, updated_at) \
                 VALUES ({})",
                placeholders(d, 1, 6)
            );
            sqlx::query(&sql)
                .bind(integration.id)
                .bind(&integration.name)
                .bind(integration.integration_type.as_deref())
                .bind(integration.store_id)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            UpsertOutcome::Created
        };
        tx.commit().await?;
        Ok(outcome)
    }

    /// Upsert a product keyed by external id, collapsing SKU collisions into
    /// the already-stored row so the SKU uniqueness invariant holds.
    pub async fn upsert_product(&self, product: &Product) -> Result<UpsertOutcome, StoreError> {
        let d = self.dialect.as_ref();
        let now = ts(Utc::now());
        let mut tx = self.pool.begin().await?;

        let by_sku = format!("SELECT id FROM products WHERE sku = {}", d.placeholder(1));
        let mut target: Option<i64> = sqlx::query(&by_sku)
            .bind(&product.sku)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.try_get("id"))
            .transpose()?;
        if target.is_none() {
            let by_id = format!("SELECT id FROM products WHERE id = {}", d.placeholder(1));
            target = sqlx::query(&by_id)
                .bind(product.id)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.try_get("id"))
                .transpose()?;
        }

        let outcome = match target {
            Some(existing_id) => {
                let sql = format!(
                    "UPDATE products SET {} WHERE id = {}",
                    set_list(d, 1, &["sku", "name", "updated_at"]),
                    d.placeholder(4)
                );
                sqlx::query(&sql)
                    .bind(&product.sku)
                    .bind(&product.name)
                    .bind(&now)
                    .bind(existing_id)
                    .execute(&mut *tx)
                    .await?;
                UpsertOutcome::Updated
            }
            None => {
                let sql = format!(
                    "INSERT INTO products (id, sku, name, created_at, updated_at) VALUES ({})",
                    placeholders(d, 1, 5)
                );
                sqlx::query(&sql)
                    .bind(product.id)
                    .bind(&product.sku)
                    .bind(&product.name)
                    .bind(&now)
                    .bind(&now)
                    .execute(&mut *tx)
                    .await?;
                UpsertOutcome::Created
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    /// Upsert a full order together with its line items (replaced wholesale).
    pub async fn upsert_order(
        &self,
        order: &Order,
        items: &[OrderItem],
    ) -> Result<UpsertOutcome, StoreError> {
        let d = self.dialect.as_ref();
        let now = ts(Utc::now());
        let mut tx = self.pool.begin().await?;

        let select = format!("SELECT id FROM orders WHERE id = {}", d.placeholder(1));
        let existing = sqlx::query(&select)
            .bind(order.id)
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = if existing.is_some() {
            let sql = format!(
                "UPDATE orders SET {} WHERE id = {}",
                set_list(
                    d,
                    1,
                    &[
                        "order_number",
                        "customer_name",
                        "created_at",
                        "updated_at",
                        "last_synced_at",
                    ],
                ),
                d.placeholder(6)
            );
            sqlx::query(&sql)
                .bind(&order.order_number)
                .bind(order.customer_name.as_deref())
                .bind(order.created_at.map(ts))
                .bind(order.updated_at.map(ts))
                .bind(&now)
                .bind(order.id)
                .execute(&mut *tx)
                .await?;
            UpsertOutcome::Updated
        } else {
            let sql = format!(
                "INSERT INTO orders \
                 (id, order_number, customer_name, created_at, updated_at, \
                  first_synced_at, last_synced_at) \
                 VALUES ({})",
                placeholders(d, 1, 7)
            );
            sqlx::query(&sql)
                .bind(order.id)
                .bind(&order.order_number)
                .bind(order.customer_name.as_deref())
                .bind(order.created_at.map(ts))
                .bind(order.updated_at.map(ts))
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            UpsertOutcome::Created
        };

        let delete = format!("DELETE FROM order_items WHERE order_id = {}", d.placeholder(1));
        sqlx::query(&delete).bind(order.id).execute(&mut *tx).await?;

        let insert = format!(
            "INSERT INTO order_items \
             (id, order_id, product_id, sku, name, quantity, quantity_shipped, \
              unit_price, bundle_order_item_id) \
             VALUES ({})",
            placeholders(d, 1, 9)
        );
        for item in items {
            sqlx::query(&insert)
                .bind(item.id)
                .bind(order.id)
                .bind(item.product_id)
                .bind(item.sku.as_deref())
                .bind(item.name.as_deref())
                .bind(item.quantity)
                .bind(item.quantity_shipped)
                .bind(item.unit_price)
                .bind(item.bundle_order_item_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    /// Make sure the order row referenced by a return exists. A stub embedded
    /// in a return payload carries no address or items, so an existing row is
    /// never overwritten beyond its order number.
    pub async fn ensure_order_ref(&self, order_ref: &OrderRef) -> Result<(), StoreError> {
        let d = self.dialect.as_ref();
        let now = ts(Utc::now());
        let mut tx = self.pool.begin().await?;

        let select = format!("SELECT id FROM orders WHERE id = {}", d.placeholder(1));
        let existing = sqlx::query(&select)
            .bind(order_ref.id)
            .fetch_optional(&mut *tx)
            .await?;

        if existing.is_some() {
            if let Some(order_number) = order_ref.order_number.as_deref() {
                let sql = format!(
                    "UPDATE orders SET order_number = {}, last_synced_at = {} WHERE id = {}",
                    d.placeholder(1),
                    d.placeholder(2),
                    d.placeholder(3)
                );
                sqlx::query(&sql)
                    .bind(order_number)
                    .bind(&now)
                    .bind(order_ref.id)
                    .execute(&mut *tx)
                    .await?;
            }
        } else {
            let sql = format!(
                "INSERT INTO orders \
                 (id, order_number, customer_name, created_at, updated_at, \
                  first_synced_at, last_synced_at) \
                 VALUES ({})",
                placeholders(d, 1, 7)
            );
            sqlx::query(&sql)
                .bind(order_ref.id)
                .bind(order_ref.order_number.as_deref().unwrap_or_default())
                .bind(Option::<String>::None)
                .bind(Option::<String>::None)
                .bind(Option::<String>::None)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_return(&self, ret: &Return) -> Result<UpsertOutcome, StoreError> {
        let d = self.dialect.as_ref();
        let now = ts(Utc::now());
        let mut tx = self.pool.begin().await?;

        let select = format!("SELECT id FROM returns WHERE id = {}", d.placeholder(1));
        let existing = sqlx::query(&select)
            .bind(ret.id)
            .fetch_optional(&mut *tx)
            .await?;

        let field_count = RETURN_FIELD_COLS.len();
        let outcome = if existing.is_some() {
            let sql = format!(
                "UPDATE returns SET {}, last_synced_at = {} WHERE id = {}",
                set_list(d, 1, RETURN_FIELD_COLS),
                d.placeholder(field_count + 1),
                d.placeholder(field_count + 2)
            );
            let query = bind_return_fields(sqlx::query(&sql), ret);
            query.bind(&now).bind(ret.id).execute(&mut *tx).await?;
            UpsertOutcome::Updated
        } else {
            let sql = format!(
                "INSERT INTO returns (id, {}, first_synced_at, last_synced_at) VALUES ({})",
                RETURN_FIELD_COLS.join(", "),
                placeholders(d, 1, field_count + 3)
            );
            let query = sqlx::query(&sql).bind(ret.id);
            let query = bind_return_fields(query, ret);
            query.bind(&now).bind(&now).execute(&mut *tx).await?;
            UpsertOutcome::Created
        };
        tx.commit().await?;
        Ok(outcome)
    }

    /// Replace the full item list of a return (delete then reinsert, one
    /// transaction).
    pub async fn replace_return_items(
        &self,
        return_id: i64,
        items: &[ReturnItem],
    ) -> Result<(), StoreError> {
        let d = self.dialect.as_ref();
        let mut tx = self.pool.begin().await?;

        let delete = format!(
            "DELETE FROM return_items WHERE return_id = {}",
            d.placeholder(1)
        );
        sqlx::query(&delete).bind(return_id).execute(&mut *tx).await?;

        let insert = format!(
            "INSERT INTO return_items \
             (id, return_id, product_id, raw_quantity, quantity, quantity_received, \
              quantity_rejected, return_reasons, condition_on_arrival, proxy) \
             VALUES ({})",
            placeholders(d, 1, 10)
        );
        for item in items {
            let reasons = serde_json::to_string(&item.return_reasons)?;
            let condition = serde_json::to_string(&item.condition_on_arrival)?;
            sqlx::query(&insert)
                .bind(item.id)
                .bind(return_id)
                .bind(item.product_id)
                .bind(item.raw_quantity)
                .bind(item.quantity)
                .bind(item.quantity_received)
                .bind(item.quantity_rejected)
                .bind(reasons)
                .bind(condition)
                .bind(item.proxy as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ---- sync log ----------------------------------------------------------

    /// Open a new run. Fails with [`StoreError::RunInProgress`] while the
    /// latest log row is still `running`; the signal lives in the table so it
    /// survives process restarts.
    pub async fn begin_run(&self) -> Result<i64, StoreError> {
        let d = self.dialect.as_ref();
        let now = ts(Utc::now());
        let mut tx = self.pool.begin().await?;

        let running = format!(
            "SELECT id FROM sync_logs WHERE status = {} {}",
            d.placeholder(1),
            d.limit_clause(1, 0)
        );
        if sqlx::query(&running)
            .bind(RunStatus::Running.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .is_some()
        {
            return Err(StoreError::RunInProgress);
        }

        let insert = format!(
            "INSERT INTO sync_logs (started_at, status, current_phase) VALUES ({})",
            placeholders(d, 1, 3)
        );
        let run_id = if d.supports_returning() {
            let sql = format!("{insert} RETURNING id");
            let row = sqlx::query(&sql)
                .bind(&now)
                .bind(RunStatus::Running.as_str())
                .bind("initializing")
                .fetch_one(&mut *tx)
                .await?;
            row.try_get::<i64, _>("id")?
        } else {
            sqlx::query(&insert)
                .bind(&now)
                .bind(RunStatus::Running.as_str())
                .bind("initializing")
                .execute(&mut *tx)
                .await?;
            let row = sqlx::query("SELECT last_insert_rowid() AS id")
                .fetch_one(&mut *tx)
                .await?;
            row.try_get::<i64, _>("id")?
        };
        tx.commit().await?;
        Ok(run_id)
    }

    pub async fn update_progress(
        &self,
        run_id: i64,
        phase: &str,
        tally: &RunTally,
        processed: i64,
        total: i64,
    ) -> Result<(), StoreError> {
        let d = self.dialect.as_ref();
        let sql = format!(
            "UPDATE sync_logs SET {} WHERE id = {}",
            set_list(
                d,
                1,
                &[
                    "current_phase",
                    "total_pages",
                    "total_fetched",
                    "created",
                    "updated",
                    "skipped",
                    "processed_count",
                    "total_to_process",
                ],
            ),
            d.placeholder(9)
        );
        sqlx::query(&sql)
            .bind(phase)
            .bind(tally.pages)
            .bind(tally.fetched)
            .bind(tally.created)
            .bind(tally.updated)
            .bind(tally.skipped)
            .bind(processed)
            .bind(total)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn complete_run(&self, run_id: i64, tally: &RunTally) -> Result<(), StoreError> {
        let d = self.dialect.as_ref();
        let now = ts(Utc::now());
        let sql = format!(
            "UPDATE sync_logs SET {} WHERE id = {}",
            set_list(
                d,
                1,
                &[
                    "status",
                    "completed_at",
                    "current_phase",
                    "total_pages",
                    "total_fetched",
                    "created",
                    "updated",
                    "skipped",
                ],
            ),
            d.placeholder(9)
        );
        sqlx::query(&sql)
            .bind(RunStatus::Completed.as_str())
            .bind(&now)
            .bind("completed")
            .bind(tally.pages)
            .bind(tally.fetched)
            .bind(tally.created)
            .bind(tally.updated)
            .bind(tally.skipped)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn fail_run(&self, run_id: i64, message: &str) -> Result<(), StoreError> {
        let d = self.dialect.as_ref();
        let now = ts(Utc::now());
        let sql = format!(
            "UPDATE sync_logs SET {} WHERE id = {}",
            set_list(
                d,
                1,
                &["status", "completed_at", "current_phase", "error_message"],
            ),
            d.placeholder(5)
        );
        sqlx::query(&sql)
            .bind(RunStatus::Failed.as_str())
            .bind(&now)
            .bind("failed")
            .bind(message)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn latest_sync_log(&self) -> Result<Option<SyncLog>, StoreError> {
        let sql = format!(
            "{SYNC_LOG_SELECT} ORDER BY id DESC {}",
            self.dialect.limit_clause(1, 0)
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(map_sync_log).transpose()
    }

    pub async fn sync_log(&self, run_id: i64) -> Result<Option<SyncLog>, StoreError> {
        let sql = format!(
            "{SYNC_LOG_SELECT} WHERE id = {}",
            self.dialect.placeholder(1)
        );
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_sync_log).transpose()
    }

    // ---- read api ----------------------------------------------------------

    fn filter_where(&self, filter: &ReturnFilter, n: &mut usize) -> (String, Vec<Arg>) {
        let d = self.dialect.as_ref();
        let mut sql = String::from(" WHERE 1 = 1");
        let mut args = Vec::new();

        if let Some(client_id) = filter.client_id {
            *n += 1;
            sql.push_str(&format!(" AND r.client_id = {}", d.placeholder(*n)));
            args.push(Arg::Int(client_id));
        }
        if let Some(processed) = filter.processed {
            *n += 1;
            sql.push_str(&format!(" AND r.processed = {}", d.placeholder(*n)));
            args.push(Arg::Int(processed as i64));
        }
        if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let like = format!("%{search}%");
            let p1 = d.placeholder(*n + 1);
            let p2 = d.placeholder(*n + 2);
            let p3 = d.placeholder(*n + 3);
            *n += 3;
            sql.push_str(&format!(
                " AND (r.tracking_number LIKE {p1} \
                 OR CAST(r.id AS TEXT) LIKE {p2} \
                 OR c.name LIKE {p3})"
            ));
            args.push(Arg::Text(like.clone()));
            args.push(Arg::Text(like.clone()));
            args.push(Arg::Text(like));
        }
        (sql, args)
    }

    pub async fn search_returns(
        &self,
        filter: &ReturnFilter,
        page: i64,
        per_page: i64,
    ) -> Result<ReturnPage, StoreError> {
        let per_page = per_page.clamp(1, 500);
        let mut n = 0usize;
        let (where_sql, args) = self.filter_where(filter, &mut n);

        let count_sql = format!(
            "SELECT COUNT(*) AS total FROM returns r \
             LEFT JOIN clients c ON r.client_id = c.id{where_sql}"
        );
        let total: i64 = bind_args(sqlx::query(&count_sql), &args)
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let total_pages = (total + per_page - 1) / per_page;
        let page = page.clamp(1, total_pages.max(1));
        let offset = (page - 1) * per_page;

        let rows_sql = format!(
            "{RETURN_SUMMARY_SELECT}{where_sql} ORDER BY r.created_at DESC {}",
            self.dialect.limit_clause(per_page, offset)
        );
        let rows = bind_args(sqlx::query(&rows_sql), &args)
            .fetch_all(&self.pool)
            .await?;
        let rows = rows
            .iter()
            .map(map_return_summary)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ReturnPage {
            rows,
            total,
            page,
            per_page,
            total_pages,
        })
    }

    /// Fetch summaries for an explicit id set. An empty set yields an empty
    /// result through the dialect's match-nothing IN clause, never malformed
    /// SQL.
    pub async fn returns_by_ids(&self, ids: &[i64]) -> Result<Vec<ReturnSummary>, StoreError> {
        let clause = self.dialect.in_clause("r.id", 1, ids.len());
        let sql = format!("{RETURN_SUMMARY_SELECT} WHERE {clause} ORDER BY r.created_at DESC");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(map_return_summary).collect()
    }

    pub async fn return_detail(&self, return_id: i64) -> Result<Option<ReturnDetail>, StoreError> {
        let d = self.dialect.as_ref();
        let sql = format!("{RETURN_SUMMARY_SELECT} WHERE r.id = {}", d.placeholder(1));
        let Some(row) = sqlx::query(&sql)
            .bind(return_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let summary = map_return_summary(&row)?;

        let items_sql = format!(
            "SELECT ri.id, ri.return_id, ri.product_id, ri.raw_quantity, ri.quantity, \
             ri.quantity_received, ri.quantity_rejected, ri.return_reasons, \
             ri.condition_on_arrival, ri.proxy, p.sku AS product_sku, p.name AS product_name \
             FROM return_items ri \
             LEFT JOIN products p ON ri.product_id = p.id \
             WHERE ri.return_id = {} ORDER BY ri.id",
            d.placeholder(1)
        );
        let rows = sqlx::query(&items_sql)
            .bind(return_id)
            .fetch_all(&self.pool)
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(ReturnItemDetail {
                item: ReturnItem {
                    id: row.try_get("id")?,
                    return_id: row.try_get("return_id")?,
                    product_id: row.try_get("product_id")?,
                    raw_quantity: row.try_get("raw_quantity")?,
                    quantity: row.try_get("quantity")?,
                    quantity_received: row.try_get("quantity_received")?,
                    quantity_rejected: row.try_get("quantity_rejected")?,
                    return_reasons: decode_tags(row.try_get("return_reasons")?),
                    condition_on_arrival: decode_tags(row.try_get("condition_on_arrival")?),
                    proxy: row.try_get::<i64, _>("proxy")? != 0,
                },
                product_sku: row.try_get("product_sku")?,
                product_name: row.try_get("product_name")?,
            });
        }

        Ok(Some(ReturnDetail { summary, items }))
    }

    pub async fn order_items_for(&self, order_id: i64) -> Result<Vec<OrderItem>, StoreError> {
        let sql = format!(
            "SELECT id, order_id, product_id, sku, name, quantity, quantity_shipped, \
             unit_price, bundle_order_item_id \
             FROM order_items WHERE order_id = {} ORDER BY id",
            self.dialect.placeholder(1)
        );
        let rows = sqlx::query(&sql)
            .bind(order_id)
            .fetch_all(&self.pool)
            .await?;
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(OrderItem {
                id: row.try_get("id")?,
                order_id: row.try_get("order_id")?,
                product_id: row.try_get("product_id")?,
                sku: row.try_get("sku")?,
                name: row.try_get("name")?,
                quantity: row.try_get("quantity")?,
                quantity_shipped: row.try_get("quantity_shipped")?,
                unit_price: row.try_get("unit_price")?,
                bundle_order_item_id: row.try_get("bundle_order_item_id")?,
            });
        }
        Ok(items)
    }

    pub async fn list_clients(&self) -> Result<Vec<Client>, StoreError> {
        let rows = sqlx::query("SELECT id, name FROM clients ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(Client {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }

    pub async fn list_warehouses(&self) -> Result<Vec<Warehouse>, StoreError> {
        let rows = sqlx::query("SELECT id, name FROM warehouses ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(Warehouse {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }

    pub async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query("SELECT id, sku, name FROM products ORDER BY sku")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(Product {
                    id: row.try_get("id")?,
                    sku: row.try_get("sku")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }

    pub async fn dashboard_stats(&self) -> Result<DashboardStats, StoreError> {
        let total_returns = self.count("SELECT COUNT(*) AS n FROM returns").await?;
        let processed_returns = self
            .count("SELECT COUNT(*) AS n FROM returns WHERE processed = 1")
            .await?;
        let pending_returns = self
            .count("SELECT COUNT(*) AS n FROM returns WHERE processed = 0")
            .await?;
        let total_clients = self.count("SELECT COUNT(*) AS n FROM clients").await?;
        let total_items = self.count("SELECT COUNT(*) AS n FROM return_items").await?;

        let sql = format!(
            "SELECT completed_at FROM sync_logs WHERE status = {} ORDER BY id DESC {}",
            self.dialect.placeholder(1),
            self.dialect.limit_clause(1, 0)
        );
        let last_completed_sync = sqlx::query(&sql)
            .bind(RunStatus::Completed.as_str())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .and_then(|row| read_ts(row, "completed_at"));

        Ok(DashboardStats {
            total_returns,
            processed_returns,
            pending_returns,
            total_clients,
            total_items,
            last_completed_sync,
        })
    }

    async fn count(&self, sql: &str) -> Result<i64, StoreError> {
        Ok(sqlx::query(sql)
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?)
    }

    /// Flatten returns into one row per line item for tabular export. Built
    /// entirely from stored data; no network access.
    pub async fn export_rows(&self, filter: &ReturnFilter) -> Result<Vec<ExportRow>, StoreError> {
        let d = self.dialect.as_ref();
        let mut n = 0usize;
        let (where_sql, args) = self.filter_where(filter, &mut n);
        let sql = format!("{RETURN_SUMMARY_SELECT}{where_sql} ORDER BY r.created_at DESC");
        let returns = bind_args(sqlx::query(&sql), &args)
            .fetch_all(&self.pool)
            .await?;

        let items_sql = format!(
            "SELECT ri.raw_quantity, ri.quantity, ri.quantity_received, ri.return_reasons, \
             ri.proxy, p.name AS product_name \
             FROM return_items ri \
             LEFT JOIN products p ON ri.product_id = p.id \
             WHERE ri.return_id = {} ORDER BY ri.id",
            d.placeholder(1)
        );

        let mut out = Vec::new();
        for row in &returns {
            let summary = map_return_summary(row)?;
            let item_rows = sqlx::query(&items_sql)
                .bind(summary.id)
                .fetch_all(&self.pool)
                .await?;

            if item_rows.is_empty() {
                out.push(ExportRow {
                    client_name: summary.client_name.clone(),
                    customer_name: summary.customer_name.clone(),
                    order_date: summary.order_created_at,
                    return_date: summary.created_at,
                    order_number: summary.order_number.clone(),
                    item_name: "No items found".to_string(),
                    order_qty: 0,
                    return_qty: 0,
                    reasons: "No return items in database".to_string(),
                    proxy: false,
                });
                continue;
            }

            for item_row in &item_rows {
                let proxy = item_row.try_get::<i64, _>("proxy")? != 0;
                let reasons = decode_tags(item_row.try_get("return_reasons")?);
                let reasons = if !reasons.is_empty() {
                    reasons.join(", ")
                } else if proxy {
                    "Order items shown (detailed return items unavailable)".to_string()
                } else {
                    String::new()
                };
                let item_name: Option<String> = item_row.try_get("product_name")?;
                out.push(ExportRow {
                    client_name: summary.client_name.clone(),
                    customer_name: summary.customer_name.clone(),
                    order_date: summary.order_created_at,
                    return_date: summary.created_at,
                    order_number: summary.order_number.clone(),
                    item_name: item_name.unwrap_or_else(|| "Unknown Product".to_string()),
                    order_qty: item_row.try_get("raw_quantity")?,
                    return_qty: item_row.try_get("quantity")?,
                    reasons,
                    proxy,
                });
            }
        }
        Ok(out)
    }

    /// Aggregate the JSON-encoded reason tags across all stored items.
    pub async fn return_reason_counts(&self) -> Result<Vec<ReasonCount>, StoreError> {
        let rows = sqlx::query(
            "SELECT return_reasons, COUNT(*) AS cnt FROM return_items \
             WHERE return_reasons IS NOT NULL AND return_reasons != '' \
             AND return_reasons != '[]' \
             GROUP BY return_reasons",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = std::collections::HashMap::<String, i64>::new();
        for row in &rows {
            let tags = decode_tags(row.try_get("return_reasons")?);
            let cnt: i64 = row.try_get("cnt")?;
            for tag in tags {
                *counts.entry(tag).or_default() += cnt;
            }
        }
        let mut out: Vec<ReasonCount> = counts
            .into_iter()
            .map(|(reason, count)| ReasonCount { reason, count })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.reason.cmp(&b.reason)));
        Ok(out)
    }

    pub async fn top_returned_products(&self, limit: i64) -> Result<Vec<TopProduct>, StoreError> {
        let sql = format!(
            "SELECT p.sku, p.name, \
             CAST(COALESCE(SUM(ri.quantity), 0) AS BIGINT) AS total_quantity, \
             COUNT(ri.id) AS return_count \
             FROM return_items ri \
             JOIN products p ON ri.product_id = p.id \
             GROUP BY p.id, p.sku, p.name \
             ORDER BY total_quantity DESC {}",
            self.dialect.limit_clause(limit, 0)
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(TopProduct {
                    sku: row.try_get("sku")?,
                    name: row.try_get("name")?,
                    total_quantity: row.try_get("total_quantity")?,
                    return_count: row.try_get("return_count")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (Store, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let url = format!("sqlite://{}/store.db?mode=rwc", dir.path().display());
        let store = Store::connect(&url).await.expect("connect");
        store.migrate().await.expect("migrate");
        (store, dir)
    }

    fn client(id: i64, name: &str) -> Client {
        Client {
            id,
            name: name.to_string(),
        }
    }

    fn a_return(id: i64) -> Return {
        Return {
            id,
            api_id: Some(format!("R-{id}")),
            status: Some("pending".to_string()),
            paid_by: None,
            processed: false,
            processed_at: None,
            warehouse_note: None,
            customer_note: None,
            tracking_number: Some(format!("TRK{id}")),
            tracking_url: None,
            carrier: Some("UPS".to_string()),
            service: None,
            label_cost: Some(4.5),
            label_pdf_url: None,
            rma_slip_url: None,
            label_voided: false,
            created_at: parse_ts("2026-06-01T10:00:00Z"),
            updated_at: parse_ts("2026-06-02T10:00:00Z"),
            client_id: None,
            warehouse_id: None,
            order_id: None,
            integration_id: None,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let (store, _dir) = test_store().await;
        let c = client(7, "Acme");
        assert_eq!(
            store.upsert_client(&c).await.unwrap(),
            UpsertOutcome::Created
        );
        assert_eq!(
            store.upsert_client(&c).await.unwrap(),
            UpsertOutcome::Updated
        );
        let clients = store.list_clients().await.unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].name, "Acme");
    }

    #[tokio::test]
    async fn product_sku_collision_collapses_to_one_row() {
        let (store, _dir) = test_store().await;
        let first = Product {
            id: 100,
            sku: "SKU-1".to_string(),
            name: "Old name".to_string(),
        };
        let second = Product {
            id: 200,
            sku: "SKU-1".to_string(),
            name: "New name".to_string(),
        };
        assert_eq!(
            store.upsert_product(&first).await.unwrap(),
            UpsertOutcome::Created
        );
        assert_eq!(
            store.upsert_product(&second).await.unwrap(),
            UpsertOutcome::Updated
        );
        let products = store.list_products().await.unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].id, 100);
        assert_eq!(products[0].name, "New name");
    }

    #[tokio::test]
    async fn empty_id_set_returns_no_rows() {
        let (store, _dir) = test_store().await;
        store.upsert_return(&a_return(1)).await.unwrap();
        let rows = store.returns_by_ids(&[]).await.unwrap();
        assert!(rows.is_empty());
        let rows = store.returns_by_ids(&[1, 99]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 1);
    }

    #[tokio::test]
    async fn return_items_are_fully_replaced() {
        let (store, _dir) = test_store().await;
        store.upsert_return(&a_return(5)).await.unwrap();

        let item = |id: i64, reasons: Vec<&str>| ReturnItem {
            id,
            return_id: 5,
            product_id: None,
            raw_quantity: 1,
            quantity: 1,
            quantity_received: 1,
            quantity_rejected: 0,
            return_reasons: reasons.into_iter().map(String::from).collect(),
            condition_on_arrival: vec![],
            proxy: false,
        };

        store
            .replace_return_items(5, &[item(1, vec!["damaged"]), item(2, vec!["too small"])])
            .await
            .unwrap();
        store
            .replace_return_items(5, &[item(3, vec!["changed mind", "changed mind"])])
            .await
            .unwrap();

        let detail = store.return_detail(5).await.unwrap().unwrap();
        assert_eq!(detail.items.len(), 1);
        assert_eq!(detail.items[0].item.id, 3);
        // duplicates survive, order preserved
        assert_eq!(
            detail.items[0].item.return_reasons,
            vec!["changed mind", "changed mind"]
        );
    }

    #[tokio::test]
    async fn second_run_is_rejected_while_first_is_running() {
        let (store, _dir) = test_store().await;
        let run_id = store.begin_run().await.unwrap();
        assert!(matches!(
            store.begin_run().await,
            Err(StoreError::RunInProgress)
        ));
        store.fail_run(run_id, "source unreachable").await.unwrap();
        let next = store.begin_run().await.unwrap();
        assert!(next > run_id);
    }

    #[tokio::test]
    async fn latest_sync_log_reflects_completion() {
        let (store, _dir) = test_store().await;
        assert!(store.latest_sync_log().await.unwrap().is_none());

        let run_id = store.begin_run().await.unwrap();
        let tally = RunTally {
            pages: 3,
            fetched: 237,
            created: 200,
            updated: 37,
            skipped: 0,
        };
        store.complete_run(run_id, &tally).await.unwrap();

        let log = store.latest_sync_log().await.unwrap().unwrap();
        assert_eq!(log.status, RunStatus::Completed);
        assert_eq!(log.total_fetched, 237);
        assert_eq!(log.created, 200);
        assert!(log.completed_at.is_some());
    }

    #[tokio::test]
    async fn search_filters_by_processed_state() {
        let (store, _dir) = test_store().await;
        let mut processed = a_return(1);
        processed.processed = true;
        store.upsert_return(&processed).await.unwrap();
        store.upsert_return(&a_return(2)).await.unwrap();

        let filter = ReturnFilter {
            processed: Some(false),
            ..Default::default()
        };
        let page = store.search_returns(&filter, 1, 50).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.rows[0].id, 2);

        let filter = ReturnFilter {
            search: Some("TRK1".to_string()),
            ..Default::default()
        };
        let page = store.search_returns(&filter, 1, 50).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.rows[0].id, 1);
    }
}

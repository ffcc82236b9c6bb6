//! Warehouse API source client: raw payload types, paginated fetch and the
//! error taxonomy the sync orchestrator retries against.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "rtd-client";

/// Raw client reference embedded in a return payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawNamedRef {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
}

/// Raw return-integration payload, optionally carrying its store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawIntegration {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub return_integration_type: Option<String>,
    #[serde(default)]
    pub store: Option<RawNamedRef>,
}

/// Raw order reference embedded in a return payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOrderRef {
    pub id: i64,
    #[serde(default)]
    pub order_number: Option<String>,
}

/// Raw product payload, embedded in return items or fetched from the paged
/// products collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProduct {
    pub id: i64,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Raw return line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReturnItem {
    pub id: i64,
    #[serde(default)]
    pub product: Option<RawProduct>,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub quantity_received: Option<i64>,
    #[serde(default)]
    pub quantity_rejected: Option<i64>,
    #[serde(default)]
    pub return_reasons: Option<Vec<String>>,
    #[serde(default)]
    pub condition_on_arrival: Option<Vec<String>>,
    #[serde(default)]
    pub bundle_order_item_id: Option<i64>,
}

/// Raw return payload. `items` is `None` (not empty) on records that predate
/// the source-side schema change which introduced item-level data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReturn {
    pub id: i64,
    #[serde(default)]
    pub api_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub paid_by: Option<String>,
    #[serde(default)]
    pub processed: Option<bool>,
    #[serde(default)]
    pub processed_at: Option<String>,
    #[serde(default)]
    pub warehouse_note: Option<String>,
    #[serde(default)]
    pub customer_note: Option<String>,
    #[serde(default)]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub tracking_url: Option<String>,
    #[serde(default)]
    pub carrier: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub label_cost: Option<f64>,
    #[serde(default)]
    pub label_pdf_url: Option<String>,
    #[serde(default)]
    pub rma_slip_url: Option<String>,
    #[serde(default)]
    pub label_voided: Option<bool>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub client: Option<RawNamedRef>,
    #[serde(default)]
    pub warehouse: Option<RawNamedRef>,
    #[serde(default)]
    pub order: Option<RawOrderRef>,
    #[serde(default)]
    pub return_integration: Option<RawIntegration>,
    #[serde(default)]
    pub items: Option<Vec<RawReturnItem>>,
}

/// Nested shipping address on an order payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawShipToAddress {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

/// Raw order line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOrderItem {
    pub id: i64,
    #[serde(default)]
    pub product_id: Option<i64>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub quantity_shipped: Option<i64>,
    #[serde(default)]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub bundle_order_item_id: Option<i64>,
}

/// Raw order payload from the paged orders collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOrder {
    pub id: i64,
    #[serde(default)]
    pub order_number: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub ship_to_address: Option<RawShipToAddress>,
    #[serde(default)]
    pub items: Option<Vec<RawOrderItem>>,
}

/// One page of a paged collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub total_count: i64,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            total_count: 0,
            has_more: false,
        }
    }
}

/// Failure modes of a page fetch, split by how the orchestrator reacts.
#[derive(Debug, Error)]
pub enum FetchError {
    /// 401/403. Fatal; the run aborts without retrying.
    #[error("authentication rejected by source api (http {status})")]
    Auth { status: u16 },
    /// Network-level failures, timeouts, 429 and 5xx. Retried with backoff.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// Any other unexpected status. Not retried.
    #[error("unexpected http status {status} for {url}")]
    Status { status: u16, url: String },
    /// The body did not match the expected envelope.
    #[error("decoding source response: {0}")]
    Decode(#[from] serde_json::Error),
}

pub fn classify_status(status: StatusCode) -> Option<FetchError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Some(FetchError::Auth {
            status: status.as_u16(),
        });
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Some(FetchError::Transient(format!("http {status}")));
    }
    None
}

fn classify_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        FetchError::Transient(err.to_string())
    } else {
        FetchError::Status {
            status: err.status().map(|s| s.as_u16()).unwrap_or(0),
            url: err.url().map(|u| u.to_string()).unwrap_or_default(),
        }
    }
}

/// Exponential backoff with a hard cap, consumed by the orchestrator's page
/// retry loop.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Paged read access to the upstream collections. The HTTP implementation is
/// [`WarehouseApi`]; tests substitute scripted sources.
#[async_trait]
pub trait ReturnsSource: Send + Sync {
    async fn fetch_returns(&self, limit: i64, offset: i64) -> Result<Page<RawReturn>, FetchError>;
    async fn fetch_orders(&self, limit: i64, offset: i64) -> Result<Page<RawOrder>, FetchError>;
    async fn fetch_products(&self, limit: i64, offset: i64) -> Result<Page<RawProduct>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct WarehouseApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

/// HTTP client for the warehouse API. Read-only; authentication travels in
/// the `X-API-KEY` header.
#[derive(Debug)]
pub struct WarehouseApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    status: Option<String>,
    data: T,
}

#[derive(Debug, Deserialize)]
struct ReturnsData {
    #[serde(default)]
    returns: Vec<RawReturn>,
    #[serde(default)]
    total_count: i64,
}

#[derive(Debug, Deserialize)]
struct OrdersData {
    #[serde(default)]
    orders: Vec<RawOrder>,
    #[serde(default)]
    total_count: i64,
}

#[derive(Debug, Deserialize)]
struct ProductsData {
    #[serde(default)]
    products: Vec<RawProduct>,
    #[serde(default)]
    total_count: i64,
}

impl WarehouseApi {
    pub fn new(config: WarehouseApiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        path: &str,
        limit: i64,
        offset: i64,
    ) -> Result<T, FetchError> {
        let url = format!("{}/{}?limit={}&offset={}", self.base_url, path, limit, offset);
        debug!(%url, "fetching source page");

        let response = self
            .client
            .get(&url)
            .header("X-API-KEY", &self.api_key)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if let Some(err) = classify_status(status) {
            return Err(err);
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let body = response.bytes().await.map_err(classify_reqwest_error)?;
        let envelope: Envelope<T> = serde_json::from_slice(&body)?;
        if let Some(s) = &envelope.status {
            if s != "success" {
                return Err(FetchError::Status {
                    status: status.as_u16(),
                    url,
                });
            }
        }
        Ok(envelope.data)
    }
}

fn page_of<T>(records: Vec<T>, total_count: i64, offset: i64) -> Page<T> {
    let has_more = !records.is_empty() && offset + (records.len() as i64) < total_count;
    Page {
        records,
        total_count,
        has_more,
    }
}

#[async_trait]
impl ReturnsSource for WarehouseApi {
    async fn fetch_returns(&self, limit: i64, offset: i64) -> Result<Page<RawReturn>, FetchError> {
        let data: ReturnsData = self.fetch_json("returns", limit, offset).await?;
        Ok(page_of(data.returns, data.total_count, offset))
    }

    async fn fetch_orders(&self, limit: i64, offset: i64) -> Result<Page<RawOrder>, FetchError> {
        let data: OrdersData = self.fetch_json("orders", limit, offset).await?;
        Ok(page_of(data.orders, data.total_count, offset))
    }

    async fn fetch_products(&self, limit: i64, offset: i64) -> Result<Page<RawProduct>, FetchError> {
        let data: ProductsData = self.fetch_json("products", limit, offset).await?;
        Ok(page_of(data.products, data.total_count, offset))
    }
}

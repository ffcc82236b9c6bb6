//! Core domain model for the returns tracking dashboard.
//!
//! Every sync-fed entity is keyed by the numeric id issued by the upstream
//! warehouse API; the local store mints no surrogate keys for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "rtd-core";

/// A client (brand/merchant) owning returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub name: String,
}

/// A physical warehouse processing returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warehouse {
    pub id: i64,
    pub name: String,
}

/// The sales channel (shop) behind a return integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreChannel {
    pub id: i64,
    pub name: String,
}

/// Return-channel metadata attached to a return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnIntegration {
    pub id: i64,
    pub name: String,
    pub integration_type: Option<String>,
    pub store_id: Option<i64>,
}

/// A customer order, as far as the returns dashboard cares about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub order_number: String,
    /// Extracted from the nested shipping address; absent when the source
    /// omits the address.
    pub customer_name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A lightweight order reference embedded in a return payload. Only used to
/// make sure the referenced order row exists before the return is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRef {
    pub id: i64,
    pub order_number: Option<String>,
}

/// One line item of an order. Kept locally so the null-items fallback and
/// the CSV export never need a network call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub product_id: Option<i64>,
    pub sku: Option<String>,
    pub name: Option<String>,
    pub quantity: i64,
    pub quantity_shipped: i64,
    pub unit_price: Option<f64>,
    /// Set when this line is a sub-item of a bundle; such lines are reported
    /// with quantity 0 by the source.
    pub bundle_order_item_id: Option<i64>,
}

/// A product. SKU is unique across the whole table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub sku: String,
    pub name: String,
}

/// A return as persisted locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Return {
    pub id: i64,
    pub api_id: Option<String>,
    pub status: Option<String>,
    pub paid_by: Option<String>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub warehouse_note: Option<String>,
    pub customer_note: Option<String>,
    pub tracking_number: Option<String>,
    pub tracking_url: Option<String>,
    pub carrier: Option<String>,
    pub service: Option<String>,
    pub label_cost: Option<f64>,
    pub label_pdf_url: Option<String>,
    pub rma_slip_url: Option<String>,
    pub label_voided: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub client_id: Option<i64>,
    pub warehouse_id: Option<i64>,
    pub order_id: Option<i64>,
    pub integration_id: Option<i64>,
}

/// One line item of a return.
///
/// `quantity` is the display quantity after the bundle fix-up; `raw_quantity`
/// preserves the value exactly as reported. A `proxy` item was substituted
/// from the associated order because the source returned a null item list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnItem {
    pub id: i64,
    pub return_id: i64,
    pub product_id: Option<i64>,
    pub raw_quantity: i64,
    pub quantity: i64,
    pub quantity_received: i64,
    pub quantity_rejected: i64,
    pub return_reasons: Vec<String>,
    pub condition_on_arrival: Vec<String>,
    pub proxy: bool,
}

/// Lifecycle of one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// Counters accumulated over one sync run and persisted on its log row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTally {
    pub pages: i64,
    pub fetched: i64,
    pub created: i64,
    pub updated: i64,
    pub skipped: i64,
}

/// One row of the append-only sync run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub total_pages: i64,
    pub total_fetched: i64,
    pub created: i64,
    pub updated: i64,
    pub skipped: i64,
    pub error_message: Option<String>,
    pub current_phase: String,
    pub processed_count: i64,
    pub total_to_process: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trips_through_str() {
        for status in [RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("paused"), None);
    }
}

//! Pure mapping from raw source payloads into local entities. No I/O.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

use rtd_client::{RawOrder, RawProduct, RawReturn, RawReturnItem};
use rtd_core::{
    Client, Order, OrderItem, OrderRef, Product, Return, ReturnIntegration, ReturnItem,
    StoreChannel, Warehouse,
};

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("product {id} is missing a sku")]
    MissingSku { id: i64 },
    #[error("product {id} is missing a name")]
    MissingName { id: i64 },
}

/// The source emits RFC 3339 timestamps on current records and a plain
/// `YYYY-MM-DD HH:MM:SS` form on some historical ones.
pub fn parse_source_datetime(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Bundle sub-items are reported with quantity 0; they display as 1 so the
/// line is visible. A genuine zero (no bundle reference) stays 0.
pub fn display_quantity(raw_quantity: i64, bundle_order_item_id: Option<i64>) -> i64 {
    if raw_quantity == 0 && bundle_order_item_id.is_some() {
        1
    } else {
        raw_quantity
    }
}

pub fn normalize_product(raw: &RawProduct) -> Result<Product, NormalizeError> {
    let sku = raw
        .sku
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(NormalizeError::MissingSku { id: raw.id })?;
    let name = raw
        .name
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(NormalizeError::MissingName { id: raw.id })?;
    Ok(Product {
        id: raw.id,
        sku: sku.to_string(),
        name: name.to_string(),
    })
}

fn product_from_embedded(raw: &RawProduct) -> Option<Product> {
    normalize_product(raw).ok()
}

/// Customer name comes from the nested shipping address; a missing or empty
/// address degrades to `None` rather than failing the record.
pub fn customer_name(raw: &RawOrder) -> Option<String> {
    let address = raw.ship_to_address.as_ref()?;
    let name = format!(
        "{} {}",
        address.first_name.as_deref().unwrap_or(""),
        address.last_name.as_deref().unwrap_or("")
    );
    let name = name.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedOrder {
    pub order: Order,
    pub items: Vec<OrderItem>,
    /// Products derivable from the order's line items, upserted so item rows
    /// are joinable without further network access.
    pub products: Vec<Product>,
}

pub fn normalize_order(raw: &RawOrder) -> NormalizedOrder {
    let items: Vec<OrderItem> = raw
        .items
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|item| OrderItem {
            id: item.id,
            order_id: raw.id,
            product_id: item.product_id,
            sku: item.sku.clone(),
            name: item.name.clone(),
            quantity: item.quantity.unwrap_or(0),
            quantity_shipped: item.quantity_shipped.unwrap_or(0),
            unit_price: item.unit_price,
            bundle_order_item_id: item.bundle_order_item_id,
        })
        .collect();

    let products = items
        .iter()
        .filter_map(|item| {
            let id = item.product_id?;
            let sku = item.sku.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
            let name = item.name.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
            Some(Product {
                id,
                sku: sku.to_string(),
                name: name.to_string(),
            })
        })
        .collect();

    NormalizedOrder {
        order: Order {
            id: raw.id,
            order_number: raw.order_number.clone().unwrap_or_default(),
            customer_name: customer_name(raw),
            created_at: raw.created_at.as_deref().and_then(parse_source_datetime),
            updated_at: raw.updated_at.as_deref().and_then(parse_source_datetime),
        },
        items,
        products,
    }
}

pub fn normalize_return_item(return_id: i64, raw: &RawReturnItem) -> ReturnItem {
    let raw_quantity = raw.quantity.unwrap_or(0);
    ReturnItem {
        id: raw.id,
        return_id,
        product_id: raw.product.as_ref().map(|p| p.id),
        raw_quantity,
        quantity: display_quantity(raw_quantity, raw.bundle_order_item_id),
        quantity_received: raw.quantity_received.unwrap_or(0),
        quantity_rejected: raw.quantity_rejected.unwrap_or(0),
        return_reasons: raw.return_reasons.clone().unwrap_or_default(),
        condition_on_arrival: raw.condition_on_arrival.clone().unwrap_or_default(),
        proxy: false,
    }
}

/// Substitute a return's missing item list with the associated order's items.
/// The rows are tagged explicitly so downstream consumers can label them
/// honestly instead of inferring from missing ids.
pub fn proxy_items_from_order(return_id: i64, order_items: &[OrderItem]) -> Vec<ReturnItem> {
    order_items
        .iter()
        .map(|item| {
            let base = if item.quantity_shipped > 0 {
                item.quantity_shipped
            } else {
                item.quantity
            };
            ReturnItem {
                id: item.id,
                return_id,
                product_id: item.product_id,
                raw_quantity: base,
                quantity: display_quantity(base, item.bundle_order_item_id),
                quantity_received: 0,
                quantity_rejected: 0,
                return_reasons: Vec::new(),
                condition_on_arrival: Vec::new(),
                proxy: true,
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct NormalizedReturn {
    pub client: Option<Client>,
    pub warehouse: Option<Warehouse>,
    pub store_channel: Option<StoreChannel>,
    pub integration: Option<ReturnIntegration>,
    pub order_ref: Option<OrderRef>,
    /// Products embedded in the item payloads.
    pub products: Vec<Product>,
    pub ret: Return,
    pub items: Vec<ReturnItem>,
}

/// Normalize one raw return. `fallback_order_items` is the associated
/// order's stored item list, consulted only when the source item list is
/// null (records older than the source-side schema change).
pub fn normalize_return(raw: &RawReturn, fallback_order_items: &[OrderItem]) -> NormalizedReturn {
    let client = raw.client.as_ref().map(|c| Client {
        id: c.id,
        name: c.name.clone().unwrap_or_default(),
    });
    let warehouse = raw.warehouse.as_ref().map(|w| Warehouse {
        id: w.id,
        name: w.name.clone().unwrap_or_default(),
    });
    let store_channel = raw
        .return_integration
        .as_ref()
        .and_then(|i| i.store.as_ref())
        .map(|s| StoreChannel {
            id: s.id,
            name: s.name.clone().unwrap_or_default(),
        });
    let integration = raw.return_integration.as_ref().map(|i| ReturnIntegration {
        id: i.id,
        name: i.name.clone().unwrap_or_default(),
        integration_type: i.return_integration_type.clone(),
        store_id: i.store.as_ref().map(|s| s.id),
    });
    let order_ref = raw.order.as_ref().map(|o| OrderRef {
        id: o.id,
        order_number: o.order_number.clone(),
    });

    let mut products = Vec::new();
    let items = match &raw.items {
        Some(raw_items) => raw_items
            .iter()
            .map(|item| {
                if let Some(product) = item.product.as_ref().and_then(product_from_embedded) {
                    products.push(product);
                }
                normalize_return_item(raw.id, item)
            })
            .collect(),
        None => proxy_items_from_order(raw.id, fallback_order_items),
    };

    let ret = Return {
        id: raw.id,
        api_id: raw.api_id.clone(),
        status: raw.status.clone(),
        paid_by: raw.paid_by.clone(),
        processed: raw.processed.unwrap_or(false),
        processed_at: raw.processed_at.as_deref().and_then(parse_source_datetime),
        warehouse_note: raw.warehouse_note.clone(),
        customer_note: raw.customer_note.clone(),
        tracking_number: raw.tracking_number.clone(),
        tracking_url: raw.tracking_url.clone(),
        carrier: raw.carrier.clone(),
        service: raw.service.clone(),
        label_cost: raw.label_cost,
        label_pdf_url: raw.label_pdf_url.clone(),
        rma_slip_url: raw.rma_slip_url.clone(),
        label_voided: raw.label_voided.unwrap_or(false),
        created_at: raw.created_at.as_deref().and_then(parse_source_datetime),
        updated_at: raw.updated_at.as_deref().and_then(parse_source_datetime),
        client_id: client.as_ref().map(|c| c.id),
        warehouse_id: warehouse.as_ref().map(|w| w.id),
        order_id: order_ref.as_ref().map(|o| o.id),
        integration_id: integration.as_ref().map(|i| i.id),
    };

    NormalizedReturn {
        client,
        warehouse,
        store_channel,
        integration,
        order_ref,
        products,
        ret,
        items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtd_client::RawShipToAddress;

    fn order_item(id: i64, quantity: i64, bundle: Option<i64>) -> OrderItem {
        OrderItem {
            id,
            order_id: 50,
            product_id: Some(id * 10),
            sku: Some(format!("SKU-{id}")),
            name: Some(format!("Item {id}")),
            quantity,
            quantity_shipped: 0,
            unit_price: None,
            bundle_order_item_id: bundle,
        }
    }

    #[test]
    fn bundle_sub_item_displays_as_one() {
        assert_eq!(display_quantity(0, Some(77)), 1);
        assert_eq!(display_quantity(0, None), 0);
        assert_eq!(display_quantity(3, Some(77)), 3);
    }

    #[test]
    fn customer_name_degrades_to_none() {
        let mut raw = RawOrder {
            id: 1,
            order_number: Some("ORD-1".to_string()),
            created_at: None,
            updated_at: None,
            ship_to_address: None,
            items: None,
        };
        assert_eq!(customer_name(&raw), None);

        raw.ship_to_address = Some(RawShipToAddress {
            first_name: Some("Dana".to_string()),
            last_name: None,
        });
        assert_eq!(customer_name(&raw).as_deref(), Some("Dana"));

        raw.ship_to_address = Some(RawShipToAddress {
            first_name: Some("Dana".to_string()),
            last_name: Some("Reyes".to_string()),
        });
        assert_eq!(customer_name(&raw).as_deref(), Some("Dana Reyes"));
    }

    #[test]
    fn null_item_list_substitutes_tagged_proxy_rows() {
        let raw: RawReturn = serde_json::from_str(
            r#"{"id": 9, "order": {"id": 50, "order_number": "ORD-50"}, "items": null}"#,
        )
        .unwrap();
        let fallback = vec![order_item(1, 2, None), order_item(2, 0, Some(1))];
        let normalized = normalize_return(&raw, &fallback);

        assert_eq!(normalized.items.len(), 2);
        assert!(normalized.items.iter().all(|item| item.proxy));
        assert_eq!(normalized.items[0].quantity, 2);
        // bundle fix-up applies to proxy rows too
        assert_eq!(normalized.items[1].raw_quantity, 0);
        assert_eq!(normalized.items[1].quantity, 1);
    }

    #[test]
    fn empty_item_list_is_not_a_fallback_case() {
        let raw: RawReturn = serde_json::from_str(
            r#"{"id": 9, "order": {"id": 50}, "items": []}"#,
        )
        .unwrap();
        let fallback = vec![order_item(1, 2, None)];
        let normalized = normalize_return(&raw, &fallback);
        assert!(normalized.items.is_empty());
    }

    #[test]
    fn reason_tags_keep_order_and_duplicates() {
        let raw: RawReturn = serde_json::from_str(
            r#"{"id": 3, "items": [{"id": 1, "quantity": 1,
                 "return_reasons": ["too small", "damaged", "too small"],
                 "condition_on_arrival": ["opened"]}]}"#,
        )
        .unwrap();
        let normalized = normalize_return(&raw, &[]);
        assert_eq!(
            normalized.items[0].return_reasons,
            vec!["too small", "damaged", "too small"]
        );
        assert_eq!(normalized.items[0].condition_on_arrival, vec!["opened"]);
    }

    #[test]
    fn product_without_sku_is_rejected() {
        let raw = RawProduct {
            id: 4,
            sku: None,
            name: Some("Widget".to_string()),
        };
        assert!(matches!(
            normalize_product(&raw),
            Err(NormalizeError::MissingSku { id: 4 })
        ));
        let raw = RawProduct {
            id: 4,
            sku: Some("  ".to_string()),
            name: Some("Widget".to_string()),
        };
        assert!(normalize_product(&raw).is_err());
    }

    #[test]
    fn source_datetimes_parse_both_shapes() {
        assert!(parse_source_datetime("2026-03-01T12:30:00Z").is_some());
        assert!(parse_source_datetime("2026-03-01T12:30:00.250Z").is_some());
        assert!(parse_source_datetime("2026-03-01 12:30:00").is_some());
        assert!(parse_source_datetime("yesterday").is_none());
    }
}

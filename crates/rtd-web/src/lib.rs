//! Axum web layer: dashboard page, JSON API, CSV export and sync control.
//!
//! Handlers read already-committed rows only; a sync running in the
//! background never blocks them.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};

use rtd_store::{ReturnFilter, Store, StoreError};
use rtd_sync::{SyncConfig, SyncError, SyncService};

pub const CRATE_NAME: &str = "rtd-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub sync: Arc<SyncService>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/dashboard/stats", get(dashboard_stats_handler))
        .route("/api/clients", get(clients_handler))
        .route("/api/warehouses", get(warehouses_handler))
        .route("/api/returns/search", post(returns_search_handler))
        .route("/api/returns/export/csv", post(returns_export_csv_handler))
        .route("/api/returns/{id}", get(return_detail_handler))
        .route("/api/analytics/return-reasons", get(return_reasons_handler))
        .route(
            "/api/analytics/top-returned-products",
            get(top_products_handler),
        )
        .route("/api/sync/trigger", post(sync_trigger_handler))
        .route("/api/sync/status", get(sync_status_handler))
        .with_state(Arc::new(state))
}

/// Connect, migrate and serve using environment configuration. Also starts
/// the cron scheduler when enabled.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let store = Store::connect(&config.database_url).await?;
    store.migrate().await?;
    let sync = Arc::new(SyncService::from_config(&config, store.clone())?);

    if config.scheduler_enabled {
        let scheduler = rtd_sync::build_scheduler(Arc::clone(&sync), &config.sync_cron).await?;
        scheduler.start().await?;
        info!(cron = %config.sync_cron, "sync scheduler started");
    }

    let state = AppState { store, sync };
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving dashboard");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    total_returns: i64,
    pending_returns: i64,
    processed_returns: i64,
    total_clients: i64,
    total_items: i64,
    sync_state: String,
    last_sync: String,
}

/// Search/export filter body. `status` is `"pending"` or `"processed"`.
#[derive(Debug, Clone, Default, Deserialize)]
struct SearchBody {
    client_id: Option<i64>,
    status: Option<String>,
    search: Option<String>,
    page: Option<i64>,
    per_page: Option<i64>,
}

impl SearchBody {
    fn filter(&self) -> ReturnFilter {
        ReturnFilter {
            client_id: self.client_id,
            processed: match self.status.as_deref() {
                Some("pending") => Some(false),
                Some("processed") => Some(true),
                _ => None,
            },
            search: self.search.clone(),
        }
    }
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let stats = match state.store.dashboard_stats().await {
        Ok(stats) => stats,
        Err(err) => return server_error(err.into()),
    };
    let latest = match state.store.latest_sync_log().await {
        Ok(latest) => latest,
        Err(err) => return server_error(err.into()),
    };
    let tpl = IndexTemplate {
        total_returns: stats.total_returns,
        pending_returns: stats.pending_returns,
        processed_returns: stats.processed_returns,
        total_clients: stats.total_clients,
        total_items: stats.total_items,
        sync_state: latest
            .map(|log| log.status.as_str().to_string())
            .unwrap_or_else(|| "never run".to_string()),
        last_sync: stats
            .last_completed_sync
            .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "never".to_string()),
    };
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

async fn dashboard_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.dashboard_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn clients_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_clients().await {
        Ok(clients) => Json(clients).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn warehouses_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_warehouses().await {
        Ok(warehouses) => Json(warehouses).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn returns_search_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SearchBody>,
) -> Response {
    let page = body.page.unwrap_or(1);
    let per_page = body.per_page.unwrap_or(50);
    match state
        .store
        .search_returns(&body.filter(), page, per_page)
        .await
    {
        Ok(result) => Json(serde_json::json!({
            "returns": result.rows,
            "total": result.total,
            "page": result.page,
            "per_page": result.per_page,
            "total_pages": result.total_pages,
        }))
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn return_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    match state.store.return_detail(id).await {
        Ok(Some(detail)) => {
            let items_note = detail
                .items
                .iter()
                .any(|item| item.item.proxy)
                .then_some("Order items shown (detailed return items unavailable)");
            Json(serde_json::json!({
                "return": detail.summary,
                "items": detail.items,
                "items_note": items_note,
            }))
            .into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Return not found"})),
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn csv_date(value: Option<DateTime<Utc>>) -> String {
    value.map(|dt| dt.format("%Y-%m-%d").to_string()).unwrap_or_default()
}

async fn returns_export_csv_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SearchBody>,
) -> Response {
    let rows = match state.store.export_rows(&body.filter()).await {
        Ok(rows) => rows,
        Err(err) => return server_error(err.into()),
    };

    let mut writer = csv::Writer::from_writer(Vec::new());
    let header = writer.write_record([
        "Client",
        "Customer Name",
        "Order Date",
        "Return Date",
        "Order Number",
        "Item Name",
        "Order Qty",
        "Return Qty",
        "Reason for Return",
    ]);
    if let Err(err) = header {
        return server_error(err.into());
    }
    for row in &rows {
        let record = [
            row.client_name.clone().unwrap_or_default(),
            row.customer_name.clone().unwrap_or_default(),
            csv_date(row.order_date),
            csv_date(row.return_date),
            row.order_number.clone().unwrap_or_default(),
            row.item_name.clone(),
            row.order_qty.to_string(),
            row.return_qty.to_string(),
            row.reasons.clone(),
        ];
        if let Err(err) = writer.write_record(&record) {
            return server_error(err.into());
        }
    }
    let bytes = match writer.into_inner() {
        Ok(bytes) => bytes,
        Err(err) => return server_error(anyhow::anyhow!(err.to_string())),
    };

    let filename = format!(
        "returns_export_{}.csv",
        Utc::now().format("%Y%m%d_%H%M%S")
    );
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        bytes,
    )
        .into_response()
}

async fn return_reasons_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.return_reason_counts().await {
        Ok(reasons) => Json(reasons).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn top_products_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.top_returned_products(10).await {
        Ok(products) => Json(products).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn sync_trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    match Arc::clone(&state.sync).trigger().await {
        Ok(run_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "message": "Sync started",
                "status": "started",
                "run_id": run_id,
            })),
        )
            .into_response(),
        Err(SyncError::Store(StoreError::RunInProgress)) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "message": "Sync already in progress",
                "status": "running",
            })),
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

/// Status polling reads the latest sync-log row, so it distinguishes
/// "no run yet", "running" (with progress), "completed" (with counts) and
/// "failed" (with message) even across process restarts.
async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.latest_sync_log().await {
        Ok(None) => Json(serde_json::json!({
            "status": "no_runs",
            "message": "No sync has run yet",
        }))
        .into_response(),
        Ok(Some(log)) => Json(serde_json::json!({
            "status": log.status.as_str(),
            "run_id": log.id,
            "started_at": log.started_at,
            "completed_at": log.completed_at,
            "counts": {
                "pages": log.total_pages,
                "fetched": log.total_fetched,
                "created": log.created,
                "updated": log.updated,
                "skipped": log.skipped,
            },
            "progress": {
                "phase": log.current_phase,
                "processed": log.processed_count,
                "total": log.total_to_process,
            },
            "error": log.error_message,
        }))
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(%err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": err.to_string()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use rtd_client::{
        BackoffPolicy, FetchError, Page, RawOrder, RawProduct, RawReturn, ReturnsSource,
    };
    use rtd_core::{Client, Return, ReturnItem};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct EmptySource;

    #[async_trait]
    impl ReturnsSource for EmptySource {
        async fn fetch_returns(&self, _: i64, _: i64) -> Result<Page<RawReturn>, FetchError> {
            Ok(Page::empty())
        }
        async fn fetch_orders(&self, _: i64, _: i64) -> Result<Page<RawOrder>, FetchError> {
            Ok(Page::empty())
        }
        async fn fetch_products(&self, _: i64, _: i64) -> Result<Page<RawProduct>, FetchError> {
            Ok(Page::empty())
        }
    }

    async fn test_state() -> (AppState, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let url = format!("sqlite://{}/web.db?mode=rwc", dir.path().display());
        let store = Store::connect(&url).await.expect("connect");
        store.migrate().await.expect("migrate");
        let sync = Arc::new(SyncService::new(
            store.clone(),
            Arc::new(EmptySource),
            100,
            BackoffPolicy::default(),
        ));
        (AppState { store, sync }, dir)
    }

    async fn seed_return_with_items(store: &Store) {
        store
            .upsert_client(&Client {
                id: 1,
                name: "Acme".to_string(),
            })
            .await
            .unwrap();
        let ret = Return {
            id: 9,
            api_id: None,
            status: Some("pending".to_string()),
            paid_by: None,
            processed: false,
            processed_at: None,
            warehouse_note: None,
            customer_note: None,
            tracking_number: Some("TRK9".to_string()),
            tracking_url: None,
            carrier: None,
            service: None,
            label_cost: None,
            label_pdf_url: None,
            rma_slip_url: None,
            label_voided: false,
            created_at: Some(Utc::now()),
            updated_at: None,
            client_id: Some(1),
            warehouse_id: None,
            order_id: None,
            integration_id: None,
        };
        store.upsert_return(&ret).await.unwrap();
        let item = |id: i64| ReturnItem {
            id,
            return_id: 9,
            product_id: None,
            raw_quantity: 1,
            quantity: 1,
            quantity_received: 1,
            quantity_rejected: 0,
            return_reasons: vec!["damaged".to_string()],
            condition_on_arrival: vec![],
            proxy: false,
        };
        store
            .replace_return_items(9, &[item(1), item(2)])
            .await
            .unwrap();
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn index_renders_dashboard() {
        let (state, _dir) = test_state().await;
        let app = app(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_string(response).await;
        assert!(text.contains("Returns Dashboard"));
        assert!(text.contains("never run"));
    }

    #[tokio::test]
    async fn search_returns_seeded_rows() {
        let (state, _dir) = test_state().await;
        seed_return_with_items(&state.store).await;
        let app = app(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/returns/search")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"status": "pending"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(value["total"], 1);
        assert_eq!(value["returns"][0]["id"], 9);
        assert_eq!(value["returns"][0]["client_name"], "Acme");
        assert_eq!(value["returns"][0]["items_count"], 2);
    }

    #[tokio::test]
    async fn csv_export_flattens_one_row_per_item() {
        let (state, _dir) = test_state().await;
        seed_return_with_items(&state.store).await;
        let app = app(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/returns/export/csv")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/csv"));
        let text = body_string(response).await;
        let lines: Vec<&str> = text.trim().lines().collect();
        // header + one row per line item
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Client,Customer Name"));
        assert!(lines[1].contains("damaged"));
    }

    #[tokio::test]
    async fn sync_status_distinguishes_no_runs() {
        let (state, _dir) = test_state().await;
        let app = app(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/sync/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(value["status"], "no_runs");
    }

    #[tokio::test]
    async fn trigger_conflicts_while_running() {
        let (state, _dir) = test_state().await;
        state.store.begin_run().await.unwrap();
        let app = app(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/sync/trigger")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn missing_return_is_404() {
        let (state, _dir) = test_state().await;
        let app = app(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/returns/12345")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

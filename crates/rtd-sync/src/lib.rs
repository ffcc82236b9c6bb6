//! Sync orchestration: configuration, the run state machine and the
//! pull-normalize-upsert pipeline over the paged source.
//!
//! A run walks the entity types in dependency order (products, orders,
//! returns; the reference entities embedded in return payloads are upserted
//! ahead of the return row that points at them). Progress and the final
//! outcome are recorded on the run's sync-log row, which is also the only
//! "is a sync running" signal.

pub mod normalize;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_cron_scheduler::{Job, JobScheduler};
use thiserror::Error;
use tracing::{error, info, warn};

use rtd_client::{BackoffPolicy, FetchError, ReturnsSource, WarehouseApi, WarehouseApiConfig};
use rtd_core::RunTally;
use rtd_store::{Store, StoreError, UpsertOutcome};

pub const CRATE_NAME: &str = "rtd-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub api_url: String,
    pub api_key: String,
    pub page_size: i64,
    pub max_retries: usize,
    pub http_timeout_secs: u64,
    pub web_port: u16,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://returns.db?mode=rwc".to_string()),
            api_url: std::env::var("WAREHANCE_API_URL")
                .unwrap_or_else(|_| "https://api.warehance.com/v1".to_string()),
            api_key: std::env::var("WAREHANCE_API_KEY").unwrap_or_default(),
            page_size: env_parse("API_PAGE_SIZE", 100),
            max_retries: env_parse("MAX_RETRIES", 3),
            http_timeout_secs: env_parse("HTTP_TIMEOUT_SECS", 30),
            web_port: env_parse("RTD_WEB_PORT", 8000),
            scheduler_enabled: std::env::var("RTD_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            // six-field cron (with seconds): hourly on the hour
            sync_cron: std::env::var("SYNC_CRON").unwrap_or_else(|_| "0 0 * * * *".to_string()),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOutcome {
    pub run_id: i64,
    pub tally: RunTally,
}

/// Drives the end-to-end sync cycle. Cheap to share behind an [`Arc`]; the
/// web layer triggers background runs through [`SyncService::trigger`].
pub struct SyncService {
    store: Store,
    source: Arc<dyn ReturnsSource>,
    page_size: i64,
    backoff: BackoffPolicy,
}

impl SyncService {
    pub fn new(
        store: Store,
        source: Arc<dyn ReturnsSource>,
        page_size: i64,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            source,
            page_size: page_size.max(1),
            backoff,
        }
    }

    pub fn from_config(config: &SyncConfig, store: Store) -> anyhow::Result<Self> {
        let api = WarehouseApi::new(WarehouseApiConfig {
            base_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
        })
        .context("building warehouse api client")?;
        Ok(Self::new(store, Arc::new(api), config.page_size, config.backoff()))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Run one sync cycle inline and wait for it to finish.
    pub async fn run_once(&self) -> Result<SyncOutcome, SyncError> {
        let run_id = self.store.begin_run().await?;
        self.execute_run(run_id).await
    }

    /// Open a run and execute it as a background task, returning the run id
    /// immediately. A run already in progress is rejected
    /// ([`StoreError::RunInProgress`]), never queued.
    pub async fn trigger(self: Arc<Self>) -> Result<i64, SyncError> {
        let run_id = self.store.begin_run().await?;
        let service = Arc::clone(&self);
        tokio::spawn(async move {
            if let Err(err) = service.execute_run(run_id).await {
                error!(run_id, %err, "background sync run failed");
            }
        });
        Ok(run_id)
    }

    async fn execute_run(&self, run_id: i64) -> Result<SyncOutcome, SyncError> {
        info!(run_id, "sync run started");
        let mut tally = RunTally::default();
        match self.run_phases(run_id, &mut tally).await {
            Ok(()) => {
                self.store.complete_run(run_id, &tally).await?;
                info!(
                    run_id,
                    pages = tally.pages,
                    fetched = tally.fetched,
                    created = tally.created,
                    updated = tally.updated,
                    skipped = tally.skipped,
                    "sync run completed"
                );
                Ok(SyncOutcome { run_id, tally })
            }
            Err(err) => {
                // Pages committed before the failure stay committed.
                let message = err.to_string();
                if let Err(store_err) = self.store.fail_run(run_id, &message).await {
                    error!(run_id, %store_err, "could not record run failure");
                }
                warn!(run_id, %message, "sync run failed");
                Err(err)
            }
        }
    }

    async fn run_phases(&self, run_id: i64, tally: &mut RunTally) -> Result<(), SyncError> {
        self.sync_products(run_id, tally).await?;
        self.sync_orders(run_id, tally).await?;
        self.sync_returns(run_id, tally).await?;
        Ok(())
    }

    async fn sync_products(&self, run_id: i64, tally: &mut RunTally) -> Result<(), SyncError> {
        let mut offset = 0i64;
        let mut processed = 0i64;
        loop {
            let mut attempt = 0usize;
            let page = loop {
                match self.source.fetch_products(self.page_size, offset).await {
                    Ok(page) => break page,
                    Err(FetchError::Transient(reason)) if attempt < self.backoff.max_retries => {
                        warn!(run_id, offset, attempt, %reason, "transient products fetch; backing off");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err.into()),
                }
            };
            if page.records.is_empty() {
                break;
            }
            tally.pages += 1;
            tally.fetched += page.records.len() as i64;

            for raw in &page.records {
                match normalize::normalize_product(raw) {
                    Ok(product) => {
                        self.tally_upsert(tally, self.store.upsert_product(&product).await, "product", raw.id)
                    }
                    Err(err) => {
                        warn!(run_id, product_id = raw.id, %err, "skipping product");
                        tally.skipped += 1;
                    }
                }
                processed += 1;
            }
            self.store
                .update_progress(run_id, "products", tally, processed, page.total_count)
                .await?;
            if !page.has_more {
                break;
            }
            offset += self.page_size;
        }
        Ok(())
    }

    async fn sync_orders(&self, run_id: i64, tally: &mut RunTally) -> Result<(), SyncError> {
        let mut offset = 0i64;
        let mut processed = 0i64;
        loop {
            let mut attempt = 0usize;
            let page = loop {
                match self.source.fetch_orders(self.page_size, offset).await {
                    Ok(page) => break page,
                    Err(FetchError::Transient(reason)) if attempt < self.backoff.max_retries => {
                        warn!(run_id, offset, attempt, %reason, "transient orders fetch; backing off");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err.into()),
                }
            };
            if page.records.is_empty() {
                break;
            }
            tally.pages += 1;
            tally.fetched += page.records.len() as i64;

            for raw in &page.records {
                let normalized = normalize::normalize_order(raw);
                for product in &normalized.products {
                    if let Err(err) = self.store.upsert_product(product).await {
                        warn!(run_id, order_id = raw.id, product_id = product.id, %err,
                            "could not upsert product referenced by order item");
                    }
                }
                self.tally_upsert(
                    tally,
                    self.store.upsert_order(&normalized.order, &normalized.items).await,
                    "order",
                    raw.id,
                );
                processed += 1;
            }
            self.store
                .update_progress(run_id, "orders", tally, processed, page.total_count)
                .await?;
            if !page.has_more {
                break;
            }
            offset += self.page_size;
        }
        Ok(())
    }

    async fn sync_returns(&self, run_id: i64, tally: &mut RunTally) -> Result<(), SyncError> {
        let mut offset = 0i64;
        let mut processed = 0i64;
        loop {
            let mut attempt = 0usize;
            let page = loop {
                match self.source.fetch_returns(self.page_size, offset).await {
                    Ok(page) => break page,
                    Err(FetchError::Transient(reason)) if attempt < self.backoff.max_retries => {
                        warn!(run_id, offset, attempt, %reason, "transient returns fetch; backing off");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err.into()),
                }
            };
            if page.records.is_empty() {
                break;
            }
            tally.pages += 1;
            tally.fetched += page.records.len() as i64;

            for raw in &page.records {
                self.sync_one_return(run_id, tally, raw).await;
                processed += 1;
            }
            self.store
                .update_progress(run_id, "returns", tally, processed, page.total_count)
                .await?;
            if !page.has_more {
                break;
            }
            offset += self.page_size;
        }
        Ok(())
    }

    async fn sync_one_return(&self, run_id: i64, tally: &mut RunTally, raw: &rtd_client::RawReturn) {
        // Null (not empty) item list: substitute the stored order items.
        let fallback = if raw.items.is_none() {
            match raw.order.as_ref() {
                Some(order_ref) => match self.store.order_items_for(order_ref.id).await {
                    Ok(items) => items,
                    Err(err) => {
                        warn!(run_id, return_id = raw.id, %err, "could not load fallback order items");
                        Vec::new()
                    }
                },
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        let normalized = normalize::normalize_return(raw, &fallback);

        // Reference entities first; the return row points at them.
        if let Some(client) = &normalized.client {
            if let Err(err) = self.store.upsert_client(client).await {
                warn!(run_id, return_id = raw.id, client_id = client.id, %err, "client upsert failed");
            }
        }
        if let Some(warehouse) = &normalized.warehouse {
            if let Err(err) = self.store.upsert_warehouse(warehouse).await {
                warn!(run_id, return_id = raw.id, warehouse_id = warehouse.id, %err, "warehouse upsert failed");
            }
        }
        if let Some(store_channel) = &normalized.store_channel {
            if let Err(err) = self.store.upsert_store_channel(store_channel).await {
                warn!(run_id, return_id = raw.id, store_id = store_channel.id, %err, "store upsert failed");
            }
        }
        if let Some(integration) = &normalized.integration {
            if let Err(err) = self.store.upsert_integration(integration).await {
                warn!(run_id, return_id = raw.id, integration_id = integration.id, %err, "integration upsert failed");
            }
        }
        if let Some(order_ref) = &normalized.order_ref {
            if let Err(err) = self.store.ensure_order_ref(order_ref).await {
                warn!(run_id, return_id = raw.id, order_id = order_ref.id, %err, "order stub upsert failed");
            }
        }
        for product in &normalized.products {
            if let Err(err) = self.store.upsert_product(product).await {
                warn!(run_id, return_id = raw.id, product_id = product.id, %err,
                    "could not upsert product referenced by return item");
            }
        }

        match self.store.upsert_return(&normalized.ret).await {
            Ok(outcome) => {
                match outcome {
                    UpsertOutcome::Created => tally.created += 1,
                    UpsertOutcome::Updated => tally.updated += 1,
                }
                if let Err(err) = self
                    .store
                    .replace_return_items(normalized.ret.id, &normalized.items)
                    .await
                {
                    warn!(run_id, return_id = raw.id, %err, "replacing return items failed");
                    tally.skipped += 1;
                }
            }
            Err(err) => {
                warn!(run_id, return_id = raw.id, %err, "skipping return after upsert failure");
                tally.skipped += 1;
            }
        }
    }

    fn tally_upsert(
        &self,
        tally: &mut RunTally,
        result: Result<UpsertOutcome, StoreError>,
        entity: &str,
        external_id: i64,
    ) {
        match result {
            Ok(UpsertOutcome::Created) => tally.created += 1,
            Ok(UpsertOutcome::Updated) => tally.updated += 1,
            Err(err) => {
                warn!(entity, external_id, %err, "skipping record after upsert failure");
                tally.skipped += 1;
            }
        }
    }
}

/// Convenience used by the CLI: connect, migrate and run one cycle.
pub async fn run_sync_once_from_env() -> anyhow::Result<SyncOutcome> {
    let config = SyncConfig::from_env();
    let store = Store::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("applying schema")?;
    let service = SyncService::from_config(&config, store)?;
    Ok(service.run_once().await?)
}

/// Build (but do not start) the cron scheduler for periodic syncs. A tick
/// that lands while a run is in flight is skipped.
pub async fn build_scheduler(
    service: Arc<SyncService>,
    cron: &str,
) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let service = Arc::clone(&service);
        Box::pin(async move {
            match service.trigger().await {
                Ok(run_id) => info!(run_id, "scheduled sync run started"),
                Err(SyncError::Store(StoreError::RunInProgress)) => {
                    info!("scheduled sync skipped; a run is already in progress")
                }
                Err(err) => error!(%err, "scheduled sync could not start"),
            }
        })
    })
    .with_context(|| format!("creating sync job for cron {cron}"))?;
    sched.add(job).await.context("adding sync job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rtd_client::{Page, RawOrder, RawProduct, RawReturn};
    use rtd_core::RunStatus;
    use rtd_store::ReturnFilter;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Source that replays a script of page results per collection. A drained
    /// script answers with empty pages.
    #[derive(Default)]
    struct ScriptedSource {
        returns: Mutex<VecDeque<Result<Page<RawReturn>, FetchError>>>,
        orders: Mutex<VecDeque<Result<Page<RawOrder>, FetchError>>>,
        products: Mutex<VecDeque<Result<Page<RawProduct>, FetchError>>>,
        return_calls: AtomicUsize,
    }

    #[async_trait]
    impl ReturnsSource for ScriptedSource {
        async fn fetch_returns(&self, _limit: i64, _offset: i64) -> Result<Page<RawReturn>, FetchError> {
            self.return_calls.fetch_add(1, Ordering::SeqCst);
            self.returns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Page::empty()))
        }

        async fn fetch_orders(&self, _limit: i64, _offset: i64) -> Result<Page<RawOrder>, FetchError> {
            self.orders
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Page::empty()))
        }

        async fn fetch_products(&self, _limit: i64, _offset: i64) -> Result<Page<RawProduct>, FetchError> {
            self.products
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Page::empty()))
        }
    }

    fn raw_return(id: i64) -> RawReturn {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "status": "pending",
            "tracking_number": format!("TRK{id}"),
            "client": {"id": 1, "name": "Acme"},
            "items": []
        }))
        .unwrap()
    }

    fn return_page(ids: std::ops::Range<i64>, total: i64, has_more: bool) -> Page<RawReturn> {
        Page {
            records: ids.map(raw_return).collect(),
            total_count: total,
            has_more,
        }
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    async fn test_service(source: ScriptedSource) -> (Arc<SyncService>, Arc<ScriptedSource>, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let url = format!("sqlite://{}/sync.db?mode=rwc", dir.path().display());
        let store = Store::connect(&url).await.expect("connect");
        store.migrate().await.expect("migrate");
        let source = Arc::new(source);
        let service = SyncService::new(store, source.clone(), 100, fast_backoff());
        (Arc::new(service), source, dir)
    }

    #[tokio::test]
    async fn full_sync_consumes_every_page_and_stops() {
        let source = ScriptedSource::default();
        source.returns.lock().unwrap().extend([
            Ok(return_page(0..100, 237, true)),
            Ok(return_page(100..200, 237, true)),
            Ok(return_page(200..237, 237, false)),
        ]);
        let (service, _source, _dir) = test_service(source).await;

        let outcome = service.run_once().await.expect("sync");
        assert_eq!(outcome.tally.fetched, 237);
        assert_eq!(outcome.tally.pages, 3);
        assert_eq!(outcome.tally.created, 237);

        let log = service.store().latest_sync_log().await.unwrap().unwrap();
        assert_eq!(log.status, RunStatus::Completed);
        assert_eq!(log.total_fetched, 237);

        let page = service
            .store()
            .search_returns(&ReturnFilter::default(), 1, 500)
            .await
            .unwrap();
        assert_eq!(page.total, 237);
    }

    #[tokio::test]
    async fn second_pass_updates_instead_of_duplicating() {
        let source = ScriptedSource::default();
        source
            .returns
            .lock()
            .unwrap()
            .push_back(Ok(return_page(0..2, 2, false)));
        let (service, _source, _dir) = test_service(source).await;
        let outcome = service.run_once().await.unwrap();
        assert_eq!(outcome.tally.created, 2);
        assert_eq!(outcome.tally.updated, 0);

        // replay the same page in a fresh run
        let source = ScriptedSource::default();
        source
            .returns
            .lock()
            .unwrap()
            .push_back(Ok(return_page(0..2, 2, false)));
        let service2 = SyncService::new(
            service.store().clone(),
            Arc::new(source),
            100,
            fast_backoff(),
        );
        let outcome = service2.run_once().await.unwrap();
        assert_eq!(outcome.tally.created, 0);
        assert_eq!(outcome.tally.updated, 2);

        let page = service2
            .store()
            .search_returns(&ReturnFilter::default(), 1, 500)
            .await
            .unwrap();
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn transient_failure_beyond_retries_fails_run_and_keeps_committed_pages() {
        let source = ScriptedSource::default();
        source.returns.lock().unwrap().extend([
            Ok(return_page(0..100, 300, true)),
            Err(FetchError::Transient("http 502".to_string())),
            Err(FetchError::Transient("http 502".to_string())),
        ]);
        let (service, _source, _dir) = test_service(source).await;

        let err = service.run_once().await.expect_err("run should fail");
        assert!(matches!(err, SyncError::Fetch(FetchError::Transient(_))));

        let log = service.store().latest_sync_log().await.unwrap().unwrap();
        assert_eq!(log.status, RunStatus::Failed);
        assert!(log.error_message.as_deref().unwrap_or("").contains("transient"));

        // page 1 stays committed and queryable
        let page = service
            .store()
            .search_returns(&ReturnFilter::default(), 1, 500)
            .await
            .unwrap();
        assert_eq!(page.total, 100);
    }

    #[tokio::test]
    async fn auth_failure_aborts_without_retry() {
        let source = ScriptedSource::default();
        source
            .products
            .lock()
            .unwrap()
            .push_back(Err(FetchError::Auth { status: 401 }));
        let (service, _source, _dir) = test_service(source).await;

        let err = service.run_once().await.expect_err("run should fail");
        assert!(matches!(err, SyncError::Fetch(FetchError::Auth { .. })));

        let log = service.store().latest_sync_log().await.unwrap().unwrap();
        assert_eq!(log.status, RunStatus::Failed);
        assert!(log
            .error_message
            .as_deref()
            .unwrap_or("")
            .contains("authentication"));
    }

    #[tokio::test]
    async fn null_item_list_is_backfilled_from_stored_order_items() {
        let source = ScriptedSource::default();
        let order: RawOrder = serde_json::from_value(serde_json::json!({
            "id": 50,
            "order_number": "ORD-50",
            "ship_to_address": {"first_name": "Dana", "last_name": "Reyes"},
            "items": [
                {"id": 71, "product_id": 7, "sku": "SKU-7", "name": "Widget", "quantity": 2},
                {"id": 72, "product_id": 8, "sku": "SKU-8", "name": "Bundle part", "quantity": 0,
                 "bundle_order_item_id": 71}
            ]
        }))
        .unwrap();
        source.orders.lock().unwrap().push_back(Ok(Page {
            records: vec![order],
            total_count: 1,
            has_more: false,
        }));
        let ret: RawReturn = serde_json::from_value(serde_json::json!({
            "id": 9,
            "status": "pending",
            "order": {"id": 50, "order_number": "ORD-50"},
            "items": null
        }))
        .unwrap();
        source.returns.lock().unwrap().push_back(Ok(Page {
            records: vec![ret],
            total_count: 1,
            has_more: false,
        }));
        let (service, _source, _dir) = test_service(source).await;
        service.run_once().await.expect("sync");

        let detail = service.store().return_detail(9).await.unwrap().unwrap();
        assert_eq!(detail.items.len(), 2);
        assert!(detail.items.iter().all(|item| item.item.proxy));
        assert_eq!(detail.items[0].product_name.as_deref(), Some("Widget"));
        // bundle sub-item displays as 1
        let bundle_row = detail.items.iter().find(|i| i.item.id == 72).unwrap();
        assert_eq!(bundle_row.item.raw_quantity, 0);
        assert_eq!(bundle_row.item.quantity, 1);
        assert_eq!(detail.summary.customer_name.as_deref(), Some("Dana Reyes"));
    }

    #[tokio::test]
    async fn trigger_is_rejected_while_a_run_is_open() {
        let (service, _source, _dir) = test_service(ScriptedSource::default()).await;
        let run_id = service.store().begin_run().await.unwrap();
        let err = service.run_once().await.expect_err("second run must be rejected");
        assert!(matches!(err, SyncError::Store(StoreError::RunInProgress)));
        service.store().fail_run(run_id, "abandoned").await.unwrap();
        service.run_once().await.expect("runs again after the first closed");
    }

    #[tokio::test]
    async fn stops_after_last_page_without_extra_calls() {
        let source = ScriptedSource::default();
        source.returns.lock().unwrap().extend([
            Ok(return_page(0..100, 137, true)),
            Ok(return_page(100..137, 137, false)),
        ]);
        let (service, source, _dir) = test_service(source).await;
        let outcome = service.run_once().await.unwrap();
        assert_eq!(outcome.tally.fetched, 137);
        assert_eq!(outcome.tally.pages, 2);
        assert_eq!(source.return_calls.load(Ordering::SeqCst), 2);
    }
}

//! # Enrichment Pipeline
//!
//! Fans each flagged item out to the product, stock and shelf-location lookups.
//!
//! Per item: resolve the identifier through the product lookup (falling back to the
//! base identifier on "not found"), then run the stock and location lookups
//! concurrently. Items run concurrently up to the lookup pool size. Every submitted
//! identifier yields exactly one [`EnrichmentResult`], partial or not; repeated
//! identifiers within a cycle are not looked up again.

use futures::FutureExt;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{
    AuthMode, EnrichmentResult, FlaggedItem, LocationInfo, ProductInfo, ResolvedVia, StockInfo,
    SubLookup,
};
use crate::enrichment::auth::{AuthContext, AuthSnapshot};
use crate::enrichment::identifier::fallback_identifier;
use crate::enrichment::lookup::{InventoryLookup, LookupError};
use crate::infrastructure::config::EnrichmentConfig;

pub struct EnrichmentPipeline {
    shared: Arc<Shared>,
    seen: HashSet<String>,
    tasks: JoinSet<EnrichmentResult>,
}

struct Shared {
    config: EnrichmentConfig,
    lookup: Arc<dyn InventoryLookup>,
    auth: Arc<AuthContext>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl EnrichmentPipeline {
    pub fn new(
        config: EnrichmentConfig,
        lookup: Arc<dyn InventoryLookup>,
        auth: Arc<AuthContext>,
        cancel: CancellationToken,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.lookup_pool_size.max(1)));
        Self {
            shared: Arc::new(Shared {
                config,
                lookup,
                auth,
                permits,
                cancel,
            }),
            seen: HashSet::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Queues an item. Returns false when its identifier was already queued this cycle.
    pub fn submit(&mut self, item: &FlaggedItem) -> bool {
        if !self.seen.insert(item.identifier.clone()) {
            debug!(identifier = %item.identifier, "Already enriched this cycle");
            return false;
        }
        let shared = Arc::clone(&self.shared);
        let item = item.clone();
        self.tasks.spawn(async move {
            let fallback = EnrichmentResult::unattempted(&item, "enrichment task panicked");
            AssertUnwindSafe(shared.enrich(item))
                .catch_unwind()
                .await
                .unwrap_or(fallback)
        });
        true
    }

    /// Identifiers queued so far
    #[must_use]
    pub fn submitted(&self) -> usize {
        self.seen.len()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Waits for all queued items and returns their results.
    pub async fn settle(mut self) -> Vec<EnrichmentResult> {
        let mut results = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!("❌ Enrichment task lost: {}", e),
            }
        }
        let complete = results.iter().filter(|r| r.is_complete()).count();
        info!(
            "✅ Enrichment settled: {} items, {} complete, {} partial",
            results.len(),
            complete,
            results.len() - complete
        );
        results
    }
}

impl EnrichmentResult {
    fn unattempted(item: &FlaggedItem, reason: &str) -> Self {
        Self {
            identifier: item.identifier.clone(),
            resolved_identifier: None,
            lookup_location: item.location_id.clone(),
            product: SubLookup::Failed(reason.to_string()),
            stock: SubLookup::Skipped,
            location: SubLookup::Skipped,
            resolved_via: ResolvedVia::Primary,
            auth_mode: AuthMode::None,
        }
    }

    fn cancelled(item: &FlaggedItem) -> Self {
        Self {
            product: SubLookup::Skipped,
            ..Self::unattempted(item, "")
        }
    }
}

impl Shared {
    async fn enrich(self: Arc<Self>, item: FlaggedItem) -> EnrichmentResult {
        let _permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return EnrichmentResult::cancelled(&item),
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return EnrichmentResult::cancelled(&item),
            },
        };

        let location_id = item.location_id.as_str();
        let (product, resolved_via, product_mode) = self.resolve_product(&item.identifier).await;

        // Stock and shelf lookups need a known identifier
        let lookup_id = match &product {
            SubLookup::Found(info) => Some(info.identifier.clone()),
            SubLookup::NotFound | SubLookup::Skipped => None,
            SubLookup::Failed(_) => Some(item.identifier.clone()),
        };

        let (stock, location, modes) = match lookup_id.as_deref() {
            Some(id) => {
                let mut candidates = vec![id.to_string()];
                if let Some(info) = product.found() {
                    for component in &info.component_ids {
                        if !candidates.contains(component) {
                            candidates.push(component.clone());
                        }
                    }
                }
                let ((stock, stock_mode), (location, location_mode)) = tokio::join!(
                    self.stock_lookup(location_id, &candidates),
                    self.location_lookup(location_id, id),
                );
                (stock, location, vec![product_mode, stock_mode, location_mode])
            }
            None => (SubLookup::Skipped, SubLookup::Skipped, vec![product_mode]),
        };

        let result = EnrichmentResult {
            identifier: item.identifier.clone(),
            resolved_identifier: lookup_id.filter(|_| product.is_found()),
            lookup_location: item.location_id.clone(),
            product,
            stock,
            location,
            resolved_via,
            auth_mode: latest_mode(&modes),
        };
        debug!(
            identifier = %result.identifier,
            complete = result.is_complete(),
            via = ?result.resolved_via,
            "Item enriched"
        );
        result
    }

    async fn resolve_product(
        &self,
        identifier: &str,
    ) -> (SubLookup<ProductInfo>, ResolvedVia, AuthMode) {
        let (primary, mode) = self
            .with_auth(|auth| self.lookup.product(identifier, auth))
            .await;

        match primary {
            Ok(info) => (SubLookup::Found(info), ResolvedVia::Primary, mode),
            Err(LookupError::NotFound) => {
                let Some(fallback) = fallback_identifier(identifier) else {
                    return (SubLookup::NotFound, ResolvedVia::Primary, mode);
                };
                debug!(identifier, fallback = %fallback, "Product not found, trying base identifier");
                let (retried, fallback_mode) = self
                    .with_auth(|auth| self.lookup.product(&fallback, auth))
                    .await;
                let mode = latest_mode(&[mode, fallback_mode]);
                match retried {
                    Ok(mut info) => {
                        info.identifier = fallback;
                        (SubLookup::Found(info), ResolvedVia::FallbackIdentifier, mode)
                    }
                    Err(e) => (sub_lookup_error(e), ResolvedVia::Primary, mode),
                }
            }
            Err(e) => (sub_lookup_error(e), ResolvedVia::Primary, mode),
        }
    }

    /// Tries each candidate until one yields a stock position.
    async fn stock_lookup(
        &self,
        location_id: &str,
        candidates: &[String],
    ) -> (SubLookup<StockInfo>, AuthMode) {
        let mut modes = Vec::with_capacity(candidates.len());
        let mut last_failure: Option<LookupError> = None;

        for candidate in candidates {
            let (outcome, mode) = self
                .with_auth(|auth| self.lookup.stock(location_id, candidate, auth))
                .await;
            modes.push(mode);
            match outcome {
                Ok(mut stock) => {
                    if stock.identifier.is_empty() {
                        stock.identifier.clone_from(candidate);
                    }
                    return (SubLookup::Found(stock), latest_mode(&modes));
                }
                Err(LookupError::NotFound) => {}
                Err(LookupError::Cancelled) => {
                    return (SubLookup::Skipped, latest_mode(&modes));
                }
                Err(e) => last_failure = Some(e),
            }
        }

        let outcome = last_failure.map_or(SubLookup::NotFound, sub_lookup_error);
        (outcome, latest_mode(&modes))
    }

    async fn location_lookup(
        &self,
        location_id: &str,
        identifier: &str,
    ) -> (SubLookup<LocationInfo>, AuthMode) {
        let (outcome, mode) = self
            .with_auth(|auth| self.lookup.location(location_id, identifier, auth))
            .await;
        let outcome = match outcome {
            Ok(info) => SubLookup::Found(info),
            Err(e) => sub_lookup_error(e),
        };
        (outcome, mode)
    }

    /// One lookup under the shared credentials.
    ///
    /// An authorization failure triggers the coordinated refresh and exactly one
    /// retry with the new token; the call is never retried without a token.
    async fn with_auth<T, F, Fut>(&self, op: F) -> (Result<T, LookupError>, AuthMode)
    where
        F: Fn(AuthSnapshot) -> Fut,
        Fut: Future<Output = Result<T, LookupError>>,
    {
        let snapshot = self.auth.snapshot().await;
        let first = self.attempt(|| op(snapshot.clone())).await;

        let Err(LookupError::Unauthorized { status }) = first else {
            return (first, snapshot.mode());
        };

        debug!(status, generation = snapshot.generation, "Lookup unauthorized, refreshing token");
        match self.auth.refresh(&snapshot).await {
            Ok(fresh) => {
                let mode = fresh.mode();
                (self.attempt(|| op(fresh.clone())).await, mode)
            }
            Err(e) => {
                warn!("⚠️ Token refresh unavailable, lookup marked failed: {}", e);
                (Err(LookupError::Unauthorized { status }), snapshot.mode())
            }
        }
    }

    /// Runs `op` with a timeout, retrying transient failures.
    async fn attempt<T, F, Fut>(&self, op: F) -> Result<T, LookupError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, LookupError>>,
    {
        let max_attempts = self.config.lookup_max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Err(LookupError::Cancelled),
                outcome = timeout(self.config.lookup_timeout(), op()) => {
                    outcome.unwrap_or(Err(LookupError::Timeout))
                }
            };

            match outcome {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    debug!(attempt, "Lookup failed ({}), retrying", e);
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return Err(LookupError::Cancelled),
                        () = sleep(self.config.lookup_retry_delay()) => {}
                    }
                }
                other => return other,
            }
        }
    }
}

fn sub_lookup_error<T>(error: LookupError) -> SubLookup<T> {
    match error {
        LookupError::NotFound => SubLookup::NotFound,
        LookupError::Cancelled => SubLookup::Skipped,
        other => SubLookup::Failed(other.to_string()),
    }
}

/// Bearer mode with the highest generation wins over older tokens and `None`.
fn latest_mode(modes: &[AuthMode]) -> AuthMode {
    modes
        .iter()
        .copied()
        .max_by_key(|mode| match mode {
            AuthMode::None => None,
            AuthMode::Bearer { generation } => Some(*generation),
        })
        .unwrap_or(AuthMode::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Catalog keyed by identifier; stock and shelf answers are uniform
    #[derive(Default)]
    struct FakeLookup {
        products: HashMap<String, ProductInfo>,
        stock_for: HashMap<String, f64>,
        stock_error: Option<LookupError>,
        product_calls: Mutex<Vec<String>>,
        stock_calls: AtomicUsize,
    }

    #[async_trait]
    impl InventoryLookup for FakeLookup {
        async fn product(&self, identifier: &str, _auth: AuthSnapshot) -> Result<ProductInfo, LookupError> {
            self.product_calls.lock().unwrap().push(identifier.to_string());
            self.products.get(identifier).cloned().ok_or(LookupError::NotFound)
        }

        async fn stock(&self, _location_id: &str, identifier: &str, _auth: AuthSnapshot) -> Result<StockInfo, LookupError> {
            self.stock_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = &self.stock_error {
                return Err(e.clone());
            }
            self.stock_for
                .get(identifier)
                .map(|qty| StockInfo {
                    identifier: identifier.to_string(),
                    quantity: Some(*qty),
                    ..StockInfo::default()
                })
                .ok_or(LookupError::NotFound)
        }

        async fn location(&self, _location_id: &str, _identifier: &str, _auth: AuthSnapshot) -> Result<LocationInfo, LookupError> {
            Ok(LocationInfo {
                standard_locations: vec!["Aisle 4, Left bay 2, shelf 1".into()],
                ..LocationInfo::default()
            })
        }
    }

    fn product(id: &str, components: &[&str]) -> ProductInfo {
        ProductInfo {
            identifier: id.to_string(),
            description: Some(format!("Product {id}")),
            component_ids: components.iter().map(ToString::to_string).collect(),
            ..ProductInfo::default()
        }
    }

    fn pipeline(lookup: FakeLookup) -> (EnrichmentPipeline, Arc<FakeLookup>) {
        let lookup = Arc::new(lookup);
        let config = EnrichmentConfig {
            lookup_retry_delay_ms: 10,
            ..EnrichmentConfig::default()
        };
        let auth = Arc::new(AuthContext::new("key", Some("token".into()), None));
        let pipeline = EnrichmentPipeline::new(
            config,
            lookup.clone() as Arc<dyn InventoryLookup>,
            auth,
            CancellationToken::new(),
        );
        (pipeline, lookup)
    }

    #[tokio::test(start_paused = true)]
    async fn test_pack_component_supplies_stock() {
        let mut fake = FakeLookup::default();
        fake.products.insert("500".into(), product("500", &["501", "502"]));
        fake.stock_for.insert("502".into(), 12.0);
        let (mut pipeline, lookup) = pipeline(fake);

        pipeline.submit(&FlaggedItem::new("500", 3, "S1"));
        let results = pipeline.settle().await;

        let stock = results[0].stock_info().unwrap();
        assert_eq!(stock.identifier, "502");
        assert_eq!(stock.quantity, Some(12.0));
        assert_eq!(lookup.stock_calls.load(Ordering::SeqCst), 3);
        assert!(results[0].location_info().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_identifier_skips_dependent_lookups() {
        let (mut pipeline, lookup) = pipeline(FakeLookup::default());

        pipeline.submit(&FlaggedItem::new("999-Z", 1, "S1"));
        let results = pipeline.settle().await;

        assert_eq!(results[0].product, SubLookup::NotFound);
        assert_eq!(results[0].stock, SubLookup::Skipped);
        assert_eq!(results[0].location, SubLookup::Skipped);
        assert_eq!(*lookup.product_calls.lock().unwrap(), vec!["999-Z".to_string(), "999".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_stock_failure_keeps_partial_result() {
        let mut fake = FakeLookup::default();
        fake.products.insert("700".into(), product("700", &[]));
        fake.stock_error = Some(LookupError::Transient("HTTP 503".into()));
        let (mut pipeline, lookup) = pipeline(fake);

        pipeline.submit(&FlaggedItem::new("700", 2, "S9"));
        let results = pipeline.settle().await;

        let result = &results[0];
        assert!(result.is_complete());
        assert!(result.stock.is_failed());
        assert!(result.location_info().is_some());
        // One retry for the transient failure
        assert_eq!(lookup.stock_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_pipeline_still_yields_results() {
        let lookup = Arc::new(FakeLookup::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut pipeline = EnrichmentPipeline::new(
            EnrichmentConfig::default(),
            lookup.clone() as Arc<dyn InventoryLookup>,
            Arc::new(AuthContext::new("key", None, None)),
            cancel,
        );
        pipeline.submit(&FlaggedItem::new("1", 1, "A"));
        pipeline.submit(&FlaggedItem::new("2", 1, "B"));

        let results = pipeline.settle().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.product == SubLookup::Skipped));
        assert!(lookup.product_calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_lookup_times_out() {
        struct StallingLookup;

        #[async_trait]
        impl InventoryLookup for StallingLookup {
            async fn product(&self, _identifier: &str, _auth: AuthSnapshot) -> Result<ProductInfo, LookupError> {
                sleep(Duration::from_secs(3_600)).await;
                Err(LookupError::NotFound)
            }
            async fn stock(&self, _l: &str, _i: &str, _auth: AuthSnapshot) -> Result<StockInfo, LookupError> {
                Err(LookupError::NotFound)
            }
            async fn location(&self, _l: &str, _i: &str, _auth: AuthSnapshot) -> Result<LocationInfo, LookupError> {
                Err(LookupError::NotFound)
            }
        }

        let mut pipeline = EnrichmentPipeline::new(
            EnrichmentConfig::default(),
            Arc::new(StallingLookup),
            Arc::new(AuthContext::new("key", None, None)),
            CancellationToken::new(),
        );
        pipeline.submit(&FlaggedItem::new("42", 1, "A"));
        let results = pipeline.settle().await;

        assert_eq!(results[0].product, SubLookup::Failed(LookupError::Timeout.to_string()));
        // Raw identifier is still usable for the dependent lookups
        assert_eq!(results[0].stock, SubLookup::NotFound);
    }

    #[test]
    fn test_latest_mode_prefers_newest_bearer() {
        let modes = [
            AuthMode::None,
            AuthMode::Bearer { generation: 2 },
            AuthMode::Bearer { generation: 1 },
        ];
        assert_eq!(latest_mode(&modes), AuthMode::Bearer { generation: 2 });
        assert_eq!(latest_mode(&[]), AuthMode::None);
    }
}

//! Asset preloader.
//!
//! Loads assets ahead of need and serves them from a two-tier cache (an
//! in-process TTL store over the durable mirror). Every read goes through
//! the version gate. Concurrent loads of one URL share a single fetch.
//!
//! Four paths feed the same `preload` pipeline:
//! explicit requests, the critical list at startup, predictive strategies
//! (via the queue) and the viewport trigger.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::asset::{AssetKind, AssetRecord, AssetRequest, Priority};
use crate::cache::mirror::{asset_key, DurableMirror, ASSET_PREFIX};
use crate::cache::preload_queue::{PreloadQueue, QueueStats, ScheduleOutcome};
use crate::cache::strategies::{CandidateProducer, PredictionContext, ViewportTrigger};
use crate::cache::ttl_store::{Lookup, TtlStore, VolatilityClass};
use crate::cache::version::VersionGate;
use crate::clock::SharedClock;
use crate::config::{AssetConfig, PreloadConfig};
use crate::error::CacheError;
use crate::fetch::{retry_with_backoff, AssetFetcher, RetryPolicy};
use crate::metrics::CacheMetrics;

type LoadResult = Result<Arc<AssetRecord>, Arc<CacheError>>;
type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

/// Outcome of a bulk preload. Failures are counted, never raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PreloadReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

impl PreloadReport {
    fn merge(&mut self, other: PreloadReport) {
        self.total += other.total;
        self.successful += other.successful;
        self.failed += other.failed;
    }
}

#[derive(Debug, Default)]
struct Counters {
    loaded: AtomicU64,
    failed: AtomicU64,
    deduped: AtomicU64,
    memory_hits: AtomicU64,
    mirror_hits: AtomicU64,
    stale_evictions: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        for counter in [
            &self.loaded,
            &self.failed,
            &self.deduped,
            &self.memory_hits,
            &self.mirror_hits,
            &self.stale_evictions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreloaderStats {
    pub loaded: u64,
    pub failed: u64,
    pub deduped: u64,
    pub memory_hits: u64,
    pub mirror_hits: u64,
    pub stale_evictions: u64,
    pub cached: usize,
    pub in_flight: usize,
    pub queued: usize,
    pub observed: usize,
    pub queue: QueueStats,
}

/// The asset preloader. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AssetPreloader {
    inner: Arc<PreloaderInner>,
    wake: Arc<Notify>,
}

struct PreloaderInner {
    memory: TtlStore<Arc<AssetRecord>>,
    mirror: Arc<DurableMirror>,
    gate: Arc<VersionGate>,
    fetcher: Arc<dyn AssetFetcher>,
    in_flight: Mutex<HashMap<String, SharedLoad>>,
    queue: Mutex<PreloadQueue>,
    strategies: RwLock<Vec<Arc<dyn CandidateProducer>>>,
    viewport: Mutex<ViewportTrigger>,
    retry: RetryPolicy,
    fetch_timeout: Duration,
    max_concurrent: usize,
    utc_offset_hours: i32,
    clock: SharedClock,
    counters: Counters,
    metrics: Arc<CacheMetrics>,
    queue_task: Mutex<Option<JoinHandle<()>>>,
}

impl AssetPreloader {
    pub fn new(
        mirror: Arc<DurableMirror>,
        gate: Arc<VersionGate>,
        fetcher: Arc<dyn AssetFetcher>,
        clock: SharedClock,
        metrics: Arc<CacheMetrics>,
        assets: &AssetConfig,
        preload: &PreloadConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PreloaderInner {
                memory: TtlStore::new(clock.clone()),
                mirror,
                gate,
                fetcher,
                in_flight: Mutex::new(HashMap::new()),
                queue: Mutex::new(PreloadQueue::new(preload.queue_capacity)),
                strategies: RwLock::new(Vec::new()),
                viewport: Mutex::new(ViewportTrigger::new(preload.viewport_margin_px)),
                retry: RetryPolicy::from_config(assets),
                fetch_timeout: Duration::from_millis(assets.fetch_timeout_ms),
                max_concurrent: assets.max_concurrent.max(1),
                utc_offset_hours: preload.utc_offset_hours,
                clock,
                counters: Counters::default(),
                metrics,
                queue_task: Mutex::new(None),
            }),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Load every asset not already cached and current.
    pub async fn preload(&self, assets: &[AssetRequest]) -> PreloadReport {
        let loads = assets.iter().cloned().map(|request| self.inner.load(request));
        let results = join_all(loads).await;

        let successful = results.iter().filter(|r| r.is_ok()).count();
        let report = PreloadReport {
            total: assets.len(),
            successful,
            failed: assets.len() - successful,
        };
        debug!(total = report.total, failed = report.failed, "Preload finished");
        report
    }

    /// Cached asset, fetching it on a miss. `None` when the fetch failed.
    pub async fn get_asset(&self, url: &str) -> Option<Arc<AssetRecord>> {
        self.inner
            .load(AssetRequest::new(url, Priority::Preload))
            .await
            .ok()
    }

    /// Cached asset without fetching. Stale versions are evicted and missed.
    pub fn cached(&self, url: &str) -> Option<Arc<AssetRecord>> {
        self.inner.cached(url)
    }

    /// Load `urls` as critical assets.
    pub async fn preload_critical(&self, urls: &[String]) -> PreloadReport {
        let requests: Vec<_> = urls
            .iter()
            .map(|url| AssetRequest::new(url.clone(), Priority::Critical))
            .collect();
        let report = self.preload(&requests).await;
        info!(
            total = report.total,
            successful = report.successful,
            failed = report.failed,
            "Critical assets preloaded"
        );
        report
    }

    pub fn add_strategy(&self, strategy: Arc<dyn CandidateProducer>) {
        debug!(strategy = strategy.name(), "Registered preload strategy");
        self.inner.strategies.write().push(strategy);
    }

    /// Ask every strategy for candidates and queue them. Returns how many
    /// new entries were queued.
    pub fn predict(&self, ctx: &PredictionContext) -> usize {
        let strategies: Vec<_> = self.inner.strategies.read().clone();
        let mut queued = 0;

        for strategy in strategies {
            let candidates =
                match std::panic::catch_unwind(AssertUnwindSafe(|| strategy.candidates(ctx))) {
                    Ok(candidates) => candidates,
                    Err(_) => {
                        warn!(strategy = strategy.name(), "Preload strategy panicked, skipping");
                        continue;
                    }
                };

            let requests: Vec<_> = candidates
                .into_iter()
                .filter(|c| self.inner.memory.peek(&c.url).is_none())
                .map(|c| c.into_request())
                .collect();
            queued += self.enqueue(requests, strategy.name());
        }

        queued
    }

    /// The context strategies see right now.
    pub fn prediction_context(&self) -> PredictionContext {
        PredictionContext::at(self.inner.clock.as_ref(), self.inner.utc_offset_hours)
    }

    /// Queue requests for background loading.
    pub fn enqueue(&self, requests: impl IntoIterator<Item = AssetRequest>, origin: &str) -> usize {
        let queued = {
            let mut queue = self.inner.queue.lock();
            requests
                .into_iter()
                .filter(|request| queue.schedule(request.clone(), origin) == ScheduleOutcome::Queued)
                .count()
        };
        if queued > 0 {
            self.wake.notify_one();
        }
        queued
    }

    /// Drain the queue through `preload`, at most `max_concurrent` at a time.
    pub async fn process_queue(&self) -> PreloadReport {
        let mut report = PreloadReport::default();
        loop {
            let batch = self.inner.queue.lock().next_batch(self.inner.max_concurrent);
            if batch.is_empty() {
                break;
            }
            let requests: Vec<_> = batch.into_iter().map(|q| q.request).collect();
            report.merge(self.preload(&requests).await);
        }
        report
    }

    /// Process the queue in the background whenever something is enqueued.
    pub fn spawn_queue_processing(&self) {
        let mut slot = self.inner.queue_task.lock();
        if slot.is_some() {
            return;
        }

        let wake = self.wake.clone();
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            loop {
                wake.notified().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let preloader = AssetPreloader {
                    inner,
                    wake: wake.clone(),
                };
                let report = preloader.process_queue().await;
                debug!(
                    total = report.total,
                    failed = report.failed,
                    "Background preload batch done"
                );
            }
        }));
    }

    /// Cancel queued lazy loads, e.g. after leaving a page.
    pub fn cancel_lazy(&self) -> usize {
        self.inner.queue.lock().cancel_lazy()
    }

    /// Watch `url` for viewport proximity.
    pub fn observe_lazy(&self, url: &str, kind: AssetKind) {
        self.inner.viewport.lock().observe(url, kind);
    }

    /// Stop watching `url` and drop any load still queued for it.
    pub fn unobserve(&self, url: &str) -> bool {
        let observed = self.inner.viewport.lock().unobserve(url);
        let cancelled = self.inner.queue.lock().cancel(url);
        if cancelled {
            debug!(url, "Cancelled queued load");
        }
        observed || cancelled
    }

    /// Feed viewport distances; assets within the margin are loaded now.
    pub async fn viewport_update(&self, distances: &[(String, f64)]) -> PreloadReport {
        let triggered = self.inner.viewport.lock().update(distances);
        if triggered.is_empty() {
            return PreloadReport::default();
        }
        self.preload(&triggered).await
    }

    pub fn gate(&self) -> &Arc<VersionGate> {
        &self.inner.gate
    }

    pub fn stats(&self) -> PreloaderStats {
        let inner = &self.inner;
        let c = &inner.counters;
        let queue = inner.queue.lock();
        PreloaderStats {
            loaded: c.loaded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            deduped: c.deduped.load(Ordering::Relaxed),
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            mirror_hits: c.mirror_hits.load(Ordering::Relaxed),
            stale_evictions: c.stale_evictions.load(Ordering::Relaxed),
            cached: inner.memory.len(),
            in_flight: inner.in_flight.lock().len(),
            queued: queue.pending_count(),
            observed: inner.viewport.lock().observed_count(),
            queue: queue.stats(),
        }
    }

    /// Drop every cached and persisted asset, queued load and observation.
    pub fn clear(&self) {
        self.inner.memory.clear();
        self.inner.queue.lock().clear();
        self.inner.viewport.lock().clear();
        let removed = self.inner.mirror.clear(ASSET_PREFIX);
        debug!(removed, "Asset cache cleared");
    }

    /// [`clear`](Self::clear) plus counters. Strategies stay registered.
    pub fn reset(&self) {
        self.clear();
        self.inner.counters.reset();
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.queue_task.lock().take() {
            handle.abort();
        }
    }
}

impl PreloaderInner {
    async fn load(self: &Arc<Self>, request: AssetRequest) -> LoadResult {
        if let Some(record) = self.cached(&request.url) {
            return Ok(record);
        }

        let url = request.url.clone();
        let shared = {
            let mut in_flight = self.in_flight.lock();
            if let Some(existing) = in_flight.get(&url) {
                self.counters.deduped.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_asset("deduped");
                debug!(url, "Joining in-flight load");
                existing.clone()
            } else if let Lookup::Hit(record) = self.memory.get(&url, VolatilityClass::Static) {
                // Finished between the cache check and taking the lock.
                return Ok(record);
            } else {
                let inner = Arc::clone(self);
                let load = async move { inner.fetch_and_store(request).await.map_err(Arc::new) }
                    .boxed()
                    .shared();
                in_flight.insert(url.clone(), load.clone());
                load
            }
        };

        let result = shared.clone().await;

        let mut in_flight = self.in_flight.lock();
        if in_flight.get(&url).is_some_and(|current| current.ptr_eq(&shared)) {
            in_flight.remove(&url);
        }
        result
    }

    fn cached(&self, url: &str) -> Option<Arc<AssetRecord>> {
        let (record, from_mirror) = match self.memory.get(url, VolatilityClass::Static) {
            Lookup::Hit(record) => (record, false),
            Lookup::Expired(_) | Lookup::Miss => {
                let record = self.mirror.read_as::<AssetRecord>(&asset_key(url))?;
                (Arc::new(record), true)
            }
        };

        if !self.gate.is_valid(&record) {
            self.counters.stale_evictions.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_asset("stale");
            self.memory.delete(url);
            self.mirror.remove(&asset_key(url));
            debug!(
                url,
                cached = %record.version,
                current = %self.gate.current_version(url),
                "Evicted stale asset"
            );
            return None;
        }

        if from_mirror {
            self.counters.mirror_hits.fetch_add(1, Ordering::Relaxed);
            self.memory.set(url, record.clone(), VolatilityClass::Static);
        } else {
            self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
        }
        Some(record)
    }

    async fn fetch_and_store(&self, request: AssetRequest) -> Result<Arc<AssetRecord>, CacheError> {
        let bound = self.fetch_timeout;
        let fetched = retry_with_backoff(self.retry, &request.url, |_| {
            let fetcher = self.fetcher.clone();
            let url = request.url.clone();
            let kind = request.kind;
            async move {
                match tokio::time::timeout(bound, fetcher.fetch(&url, kind)).await {
                    Ok(result) => result,
                    Err(_) => Err(CacheError::TimeoutExceeded(bound)),
                }
            }
        })
        .await;

        let content = match fetched {
            Ok(content) => content,
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_asset("failed");
                warn!(url = %request.url, error = %e, "Asset load failed");
                return Err(e);
            }
        };

        let record = Arc::new(AssetRecord {
            version: self.gate.current_version(&request.url),
            url: request.url,
            priority: request.priority,
            content,
            loaded_at: self.clock.now_ms(),
        });

        self.memory
            .set(&record.url, record.clone(), VolatilityClass::Static);
        if let Err(e) = self.mirror.write_as(&asset_key(&record.url), record.as_ref()) {
            self.metrics.mirror_write_failures_total.inc();
            debug!(url = %record.url, error = %e, "Asset not persisted");
        }

        self.counters.loaded.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_asset("loaded");
        debug!(
            url = %record.url,
            priority = %record.priority,
            version = %record.version,
            size = record.content.len(),
            "Asset loaded"
        );
        Ok(record)
    }
}

impl Drop for PreloaderInner {
    fn drop(&mut self) {
        if let Some(handle) = self.queue_task.get_mut().take() {
            handle.abort();
        }
    }
}

//! Cache facade: the public entry point for configuration values.
//!
//! Unifies TTL lookup, chain resolution, write-through persistence and
//! change notification. None of the public operations return errors; every
//! failure degrades to the best value available (a stale entry, then the
//! default table, then null).

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::cache::mirror::{config_key, ContextId, DurableMirror, MirrorEvent, MirrorUsage, CONFIG_PREFIX};
use crate::cache::resolver::{Source, SourceChain, SourceResolver};
use crate::cache::ttl_store::{Lookup, TtlStore, VolatilityClass};
use crate::clock::SharedClock;
use crate::metrics::CacheMetrics;

/// Listener invoked with `(new_value, old_value, key)`.
pub type ChangeCallback = Arc<dyn Fn(&Value, &Value, &str) + Send + Sync>;

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "context", rename_all = "snake_case")]
pub enum ChangeOrigin {
    /// `set_config` in this context.
    Local,
    /// A write made by another context, delivered through the mirror.
    Context(ContextId),
}

/// A configuration change, as broadcast to watchers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigChange {
    pub key: String,
    pub new_value: Value,
    pub old_value: Value,
    pub origin: ChangeOrigin,
}

/// Per-call read policy.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub class: VolatilityClass,
    /// Explicit chain, overriding the default one.
    pub sources: Option<SourceChain>,
    /// Add the remote source to the default chain for this call.
    pub use_remote: bool,
}

impl GetOptions {
    pub fn with_class(class: VolatilityClass) -> Self {
        Self {
            class,
            ..Self::default()
        }
    }

    pub fn with_sources(chain: SourceChain) -> Self {
        Self {
            sources: Some(chain),
            ..Self::default()
        }
    }

    pub fn with_remote() -> Self {
        Self {
            use_remote: true,
            ..Self::default()
        }
    }
}

/// Per-call write policy.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub class: VolatilityClass,
    /// Also push the value to the remote settings service.
    pub push_remote: bool,
}

/// One observed config access.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSample {
    pub key: String,
    pub access_time_ms: f64,
    pub cache_hit: bool,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

/// Running counters of the facade.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub access_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
    pub entries: usize,
    pub subscriptions: usize,
    pub average_access_ms: f64,
    pub mirror: MirrorUsage,
}

/// Summary of the sample ring buffer.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub samples: usize,
    pub hit_rate: f64,
    pub average_hit_ms: f64,
    pub average_miss_ms: f64,
    /// `1 - average_hit / average_miss`, when both are known.
    pub latency_reduction: Option<f64>,
    pub slowest: Vec<PerformanceSample>,
}

/// Handle returned by [`ConfigCache::on_config_change`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    key: String,
    registry: Weak<FacadeInner>,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stop receiving changes.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.remove_subscription(&self.key, self.id);
        }
    }
}

struct SampleRing {
    samples: VecDeque<PerformanceSample>,
    capacity: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, sample: PerformanceSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }
}

/// Per-key write counters. A read that resolved upstream may only write its
/// result back if no write to that key happened while it was resolving.
#[derive(Default)]
struct WriteSequence {
    epoch: u64,
    per_key: HashMap<String, u64>,
}

impl WriteSequence {
    fn token(&self, key: &str) -> (u64, u64) {
        (self.epoch, self.per_key.get(key).copied().unwrap_or(0))
    }

    fn bump(&mut self, key: &str) {
        *self.per_key.entry(key.to_string()).or_default() += 1;
    }

    fn bump_all(&mut self) {
        self.epoch += 1;
        self.per_key.clear();
    }
}

/// The configuration cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConfigCache {
    inner: Arc<FacadeInner>,
}

struct FacadeInner {
    store: TtlStore<Value>,
    mirror: Arc<DurableMirror>,
    resolver: SourceResolver,
    subscriptions: Mutex<HashMap<String, Vec<(u64, ChangeCallback)>>>,
    writes: Mutex<WriteSequence>,
    next_subscription: AtomicU64,
    changes: broadcast::Sender<ConfigChange>,
    samples: Mutex<SampleRing>,
    access_count: AtomicU64,
    hit_count: AtomicU64,
    remote_by_default: bool,
    clock: SharedClock,
    metrics: Arc<CacheMetrics>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigCache {
    pub fn new(
        mirror: Arc<DurableMirror>,
        resolver: SourceResolver,
        clock: SharedClock,
        metrics: Arc<CacheMetrics>,
        remote_by_default: bool,
        sample_capacity: usize,
    ) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(FacadeInner {
                store: TtlStore::new(clock.clone()),
                mirror,
                resolver,
                subscriptions: Mutex::new(HashMap::new()),
                writes: Mutex::new(WriteSequence::default()),
                next_subscription: AtomicU64::new(0),
                changes,
                samples: Mutex::new(SampleRing::new(sample_capacity)),
                access_count: AtomicU64::new(0),
                hit_count: AtomicU64::new(0),
                remote_by_default,
                clock,
                metrics,
                sync_task: Mutex::new(None),
            }),
        }
    }

    /// Resolve `key`. Never fails; see the module docs for the fallback order.
    pub async fn get_config(&self, key: &str, options: GetOptions) -> Value {
        let inner = &self.inner;
        let started = Instant::now();
        inner.access_count.fetch_add(1, Ordering::Relaxed);

        let stale = match inner.store.get(key, options.class) {
            Lookup::Hit(value) => {
                inner.hit_count.fetch_add(1, Ordering::Relaxed);
                inner.record_sample(key, started, true, "hit");
                return value;
            }
            Lookup::Expired(value) => Some(value),
            Lookup::Miss => None,
        };

        let chain = inner.chain_for(&options);
        let token = inner.writes.lock().token(key);
        let resolved = AssertUnwindSafe(inner.resolver.resolve(key, &chain))
            .catch_unwind()
            .await;

        match resolved {
            Ok(resolution) => {
                let writes = inner.writes.lock();
                if writes.token(key) != token {
                    drop(writes);
                    debug!(key, source = %resolution.source, "Config written during resolution, keeping the newer value");
                    inner.record_sample(key, started, false, "miss");
                    return inner
                        .store
                        .peek(key)
                        .map(|entry| entry.value)
                        .unwrap_or(resolution.value);
                }
                inner.store.set(key, resolution.value.clone(), options.class);
                if resolution.source != Source::DurableMirror && !resolution.value.is_null() {
                    inner.persist(key, &resolution.value);
                }
                drop(writes);
                debug!(key, source = %resolution.source, "Config resolved");
                inner.record_sample(key, started, false, "miss");
                resolution.value
            }
            Err(_) => {
                warn!(key, has_stale = stale.is_some(), "Config resolution panicked, using fallback");
                inner.record_sample(key, started, false, "fallback");
                stale.unwrap_or_else(|| inner.resolver.default_value(key))
            }
        }
    }

    /// Write `value`, then notify this key's listeners before returning.
    pub async fn set_config(&self, key: &str, value: Value, options: SetOptions) {
        let inner = &self.inner;
        let old = inner.current_value(key);

        {
            let mut writes = inner.writes.lock();
            writes.bump(key);
            inner.store.set(key, value.clone(), options.class);
            inner.persist(key, &value);
        }
        inner.notify(key, &value, &old, ChangeOrigin::Local);

        if options.push_remote {
            inner.push_remote(key, &value).await;
        }
    }

    /// Register a listener for `key`.
    pub fn on_config_change<F>(&self, key: &str, callback: F) -> Subscription
    where
        F: Fn(&Value, &Value, &str) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscriptions
            .lock()
            .entry(key.to_string())
            .or_default()
            .push((id, Arc::new(callback)));

        Subscription {
            id,
            key: key.to_string(),
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Drop `key` from both tiers without notifying listeners. Idempotent.
    pub fn invalidate_config(&self, key: &str) {
        let _writes = {
            let mut writes = self.inner.writes.lock();
            writes.bump(key);
            writes
        };
        let cached = self.inner.store.delete(key).is_some();
        let persisted = self.inner.mirror.remove(&config_key(key));
        debug!(key, cached, persisted, "Config invalidated");
    }

    /// Resolve many keys concurrently. A key whose resolution blows up maps
    /// to its default value; the batch itself always completes.
    pub async fn get_configs<I, K>(&self, keys: I, options: GetOptions) -> HashMap<String, Value>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let keys: Vec<String> = keys.into_iter().map(|k| k.as_ref().to_string()).collect();

        let lookups = keys.iter().map(|key| {
            let options = options.clone();
            async move {
                let value = AssertUnwindSafe(self.get_config(key, options))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| self.inner.resolver.default_value(key));
                (key.clone(), value)
            }
        });

        join_all(lookups).await.into_iter().collect()
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        let inner = &self.inner;
        let access_count = inner.access_count.load(Ordering::Relaxed);
        let hit_count = inner.hit_count.load(Ordering::Relaxed);
        let samples = inner.samples.lock();
        let average_access_ms = if samples.samples.is_empty() {
            0.0
        } else {
            samples.samples.iter().map(|s| s.access_time_ms).sum::<f64>() / samples.samples.len() as f64
        };
        drop(samples);

        CacheStats {
            access_count,
            hit_count,
            miss_count: access_count.saturating_sub(hit_count),
            hit_rate: ratio(hit_count, access_count),
            entries: inner.store.len(),
            subscriptions: inner.subscriptions.lock().values().map(Vec::len).sum(),
            average_access_ms,
            mirror: inner.mirror.usage(),
        }
    }

    /// Receive every change to any key.
    pub fn watch(&self) -> broadcast::Receiver<ConfigChange> {
        self.inner.changes.subscribe()
    }

    pub fn performance_samples(&self) -> Vec<PerformanceSample> {
        self.inner.samples.lock().samples.iter().cloned().collect()
    }

    pub fn performance_report(&self) -> PerformanceReport {
        let samples = self.performance_samples();
        let (hits, misses): (Vec<_>, Vec<_>) = samples.iter().partition(|s| s.cache_hit);

        let average = |set: &[&PerformanceSample]| {
            if set.is_empty() {
                None
            } else {
                Some(set.iter().map(|s| s.access_time_ms).sum::<f64>() / set.len() as f64)
            }
        };
        let average_hit = average(&hits);
        let average_miss = average(&misses);
        let latency_reduction = match (average_hit, average_miss) {
            (Some(hit), Some(miss)) if miss > 0.0 => Some(1.0 - hit / miss),
            _ => None,
        };

        let mut slowest = samples.clone();
        slowest.sort_by(|a, b| {
            b.access_time_ms
                .partial_cmp(&a.access_time_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        slowest.truncate(5);

        PerformanceReport {
            samples: samples.len(),
            hit_rate: ratio(hits.len() as u64, samples.len() as u64),
            average_hit_ms: average_hit.unwrap_or(0.0),
            average_miss_ms: average_miss.unwrap_or(0.0),
            latency_reduction,
            slowest,
        }
    }

    /// Inject a process-local value (the `ProcessMemory` source).
    pub fn inject(&self, key: &str, value: Value) {
        self.inner.resolver.memory().inject(key, value);
    }

    /// Drop every cached and persisted config entry.
    pub fn clear(&self) {
        let _writes = {
            let mut writes = self.inner.writes.lock();
            writes.bump_all();
            writes
        };
        self.inner.store.clear();
        let removed = self.inner.mirror.clear(CONFIG_PREFIX);
        debug!(removed, "Config cache cleared");
    }

    /// Return to a just-constructed state: no entries, listeners, samples or
    /// counters. Persisted entries are left alone.
    pub fn reset(&self) {
        let inner = &self.inner;
        inner.writes.lock().bump_all();
        inner.store.clear();
        inner.subscriptions.lock().clear();
        inner.samples.lock().samples.clear();
        inner.access_count.store(0, Ordering::Relaxed);
        inner.hit_count.store(0, Ordering::Relaxed);
    }

    /// Start applying other contexts' mirror writes to this context.
    pub fn spawn_sync(&self) {
        let mut slot = self.inner.sync_task.lock();
        if slot.is_some() {
            return;
        }

        let mut subscriber = self.inner.mirror.subscribe();
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            while let Some(event) = subscriber.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.apply_foreign_change(event);
            }
            debug!("Cross-context sync stopped");
        }));
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.sync_task.lock().take() {
            handle.abort();
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.inner.mirror.context_id()
    }
}

impl FacadeInner {
    fn chain_for(&self, options: &GetOptions) -> SourceChain {
        match &options.sources {
            Some(chain) => chain.clone(),
            None if options.use_remote || self.remote_by_default => SourceChain::with_remote(),
            None => SourceChain::standard(),
        }
    }

    /// Last known value, stale or not.
    fn current_value(&self, key: &str) -> Value {
        self.store
            .peek(key)
            .map(|entry| entry.value)
            .or_else(|| self.mirror.read(&config_key(key)))
            .unwrap_or(Value::Null)
    }

    /// Best-effort durable write.
    fn persist(&self, key: &str, value: &Value) {
        if let Err(e) = self.mirror.write(&config_key(key), value) {
            self.metrics.mirror_write_failures_total.inc();
            warn!(key, error = %e, "Durable write failed, memory tier remains authoritative");
        }
    }

    async fn push_remote(&self, key: &str, value: &Value) {
        let Some(remote) = self.resolver.remote() else {
            warn!(key, "Remote push requested but no remote settings client is configured");
            return;
        };
        let bound = self.resolver.remote_timeout();
        match tokio::time::timeout(bound, remote.push(key, value)).await {
            Ok(Ok(())) => debug!(key, "Pushed config to remote"),
            Ok(Err(e)) => warn!(key, error = %e, "Remote push failed"),
            Err(_) => warn!(key, ?bound, "Remote push timed out"),
        }
    }

    fn notify(&self, key: &str, new: &Value, old: &Value, origin: ChangeOrigin) {
        let callbacks: Vec<ChangeCallback> = self
            .subscriptions
            .lock()
            .get(key)
            .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();

        for callback in callbacks {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback(new, old, key)));
            if outcome.is_err() {
                self.metrics.listener_panics_total.inc();
                error!(key, "Config change listener panicked");
            }
        }

        let _ = self.changes.send(ConfigChange {
            key: key.to_string(),
            new_value: new.clone(),
            old_value: old.clone(),
            origin,
        });
    }

    fn remove_subscription(&self, key: &str, id: u64) {
        let mut subscriptions = self.subscriptions.lock();
        if let Some(subs) = subscriptions.get_mut(key) {
            subs.retain(|(sub_id, _)| *sub_id != id);
            if subs.is_empty() {
                subscriptions.remove(key);
            }
        }
    }

    /// Apply a write another context made to the mirror.
    fn apply_foreign_change(&self, event: MirrorEvent) {
        let Some(key) = event.key.strip_prefix(CONFIG_PREFIX) else {
            return;
        };

        let mut writes = self.writes.lock();
        writes.bump(key);
        let previous = self.store.peek(key);
        match event.value {
            Some(new) => {
                let class = previous.as_ref().map(|e| e.class).unwrap_or_default();
                let old = previous.map(|e| e.value).unwrap_or(Value::Null);
                self.store.set(key, new.clone(), class);
                drop(writes);
                if old != new {
                    debug!(key, origin = %event.origin, "Applied change from another context");
                    self.notify(key, &new, &old, ChangeOrigin::Context(event.origin));
                }
            }
            // Invalidation elsewhere: drop our copy, listeners stay quiet.
            None => {
                self.store.delete(key);
            }
        }
    }

    fn record_sample(&self, key: &str, started: Instant, cache_hit: bool, result: &str) {
        let elapsed = started.elapsed();
        self.metrics.record_lookup(result, elapsed.as_secs_f64());
        self.samples.lock().push(PerformanceSample {
            key: key.to_string(),
            access_time_ms: elapsed.as_secs_f64() * 1000.0,
            cache_hit,
            timestamp: self.clock.now_ms(),
        });
    }
}

impl Drop for FacadeInner {
    fn drop(&mut self) {
        if let Some(handle) = self.sync_task.get_mut().take() {
            handle.abort();
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::cache::defaults::DefaultTable;
    use crate::cache::mirror::MirrorBus;
    use crate::cache::resolver::ProcessMemory;
    use crate::clock::ManualClock;
    use crate::config::{EnvironmentConfig, MirrorConfig, SecurityConfig};
    use crate::storage::MemoryStore;

    fn cache(clock: &ManualClock) -> ConfigCache {
        let mirror = Arc::new(DurableMirror::new(
            Arc::new(MemoryStore::new()),
            MirrorBus::new(16),
            &MirrorConfig::default(),
        ));
        let resolver = SourceResolver::new(
            mirror.clone(),
            Arc::new(ProcessMemory::default()),
            None,
            DefaultTable::new(EnvironmentConfig::default(), SecurityConfig::default()),
            Duration::from_secs(5),
        );
        ConfigCache::new(
            mirror,
            resolver,
            Arc::new(clock.clone()),
            Arc::new(CacheMetrics::new().unwrap()),
            false,
            3,
        )
    }

    #[tokio::test]
    async fn test_second_read_is_a_hit() {
        let clock = ManualClock::new(0);
        let cache = cache(&clock);

        assert_eq!(cache.get_config("ui.theme", GetOptions::default()).await, json!("light"));
        assert_eq!(cache.get_config("ui.theme", GetOptions::default()).await, json!("light"));

        let stats = cache.get_cache_stats();
        assert_eq!(stats.access_count, 2);
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-10);
    }

    #[tokio::test]
    async fn test_sample_ring_is_bounded() {
        let clock = ManualClock::new(0);
        let cache = cache(&clock);
        for _ in 0..5 {
            cache.get_config("ui.language", GetOptions::default()).await;
        }
        let samples = cache.performance_samples();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.cache_hit));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_notifications() {
        let clock = ManualClock::new(0);
        let cache = cache(&clock);
        let calls = Arc::new(AtomicU64::new(0));

        let counter = calls.clone();
        let subscription = cache.on_config_change("ui.theme", move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cache.set_config("ui.theme", json!("dark"), SetOptions::default()).await;
        subscription.unsubscribe();
        cache.set_config("ui.theme", json!("light"), SetOptions::default()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get_cache_stats().subscriptions, 0);
    }

    #[tokio::test]
    async fn test_reset_clears_runtime_state() {
        let clock = ManualClock::new(0);
        let cache = cache(&clock);
        cache.get_config("ui.theme", GetOptions::default()).await;
        let _sub = cache.on_config_change("ui.theme", |_, _, _| {});

        cache.reset();

        let stats = cache.get_cache_stats();
        assert_eq!(stats.access_count, 0);
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.subscriptions, 0);
        assert!(cache.performance_samples().is_empty());
    }
}

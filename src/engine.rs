//! The engine context object.
//!
//! One [`CacheEngine`] per execution context, constructed at startup and
//! passed to whoever needs it. It wires storage, sources, the facade and the
//! preloader together and owns the background tasks. Several engines built
//! over the same store and bus behave like several contexts (tabs) of one
//! origin: each has its own TTL tier, all share the durable tier.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::mirror::{DurableMirror, MirrorBus};
use crate::cache::resolver::{ProcessMemory, SourceResolver};
use crate::cache::strategies::{NavigationStrategy, RoleStrategy, TimeOfDayStrategy};
use crate::cache::version::VersionGate;
use crate::cache::{defaults::DefaultTable, AssetPreloader, ConfigCache};
use crate::clock::{system_clock, SharedClock};
use crate::config::{Config, MirrorBackend};
use crate::error::CacheResult;
use crate::fetch::{AssetFetcher, HttpAssetFetcher, HttpRemoteSettings, RemoteSettings};
use crate::metrics::CacheMetrics;
use crate::storage::{DisabledStore, FileStore, MemoryStore, MirrorStore};

/// Overrides for the pieces [`CacheEngine::new`] would otherwise build from
/// configuration.
pub struct CacheEngineBuilder {
    config: Config,
    store: Option<Arc<dyn MirrorStore>>,
    bus: Option<MirrorBus>,
    clock: Option<SharedClock>,
    remote: Option<Arc<dyn RemoteSettings>>,
    fetcher: Option<Arc<dyn AssetFetcher>>,
}

impl CacheEngineBuilder {
    /// Share durable storage with other engines.
    pub fn store(mut self, store: Arc<dyn MirrorStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share the cross-context change bus with other engines.
    pub fn bus(mut self, bus: MirrorBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn remote(mut self, remote: Arc<dyn RemoteSettings>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn AssetFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn build(self) -> CacheResult<CacheEngine> {
        let config = self.config;
        let metrics = Arc::new(CacheMetrics::new()?);
        let clock = self.clock.unwrap_or_else(system_clock);

        let store = match self.store {
            Some(store) => store,
            None => open_store(&config),
        };
        let bus = self
            .bus
            .unwrap_or_else(|| MirrorBus::new(config.mirror.bus_capacity));
        let mirror = Arc::new(DurableMirror::new(store, bus, &config.mirror));

        let remote_timeout = Duration::from_millis(config.remote.timeout_ms);
        let remote = match (self.remote, config.remote.base_url.as_deref()) {
            (Some(remote), _) => Some(remote),
            (None, Some(base_url)) => Some(Arc::new(HttpRemoteSettings::new(base_url, remote_timeout)?)
                as Arc<dyn RemoteSettings>),
            (None, None) => None,
        };
        if config.remote.enabled && remote.is_none() {
            warn!("Remote settings enabled but no base_url configured; remote source will always fail");
        }

        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpAssetFetcher::new(Duration::from_millis(
                config.assets.fetch_timeout_ms,
            ))?),
        };

        let resolver = SourceResolver::new(
            mirror.clone(),
            Arc::new(ProcessMemory::new(config.injected.clone())),
            remote,
            DefaultTable::new(config.environment.clone(), config.security.clone()),
            remote_timeout,
        );
        let configs = ConfigCache::new(
            mirror.clone(),
            resolver,
            clock.clone(),
            metrics.clone(),
            config.remote.enabled,
            config.telemetry.sample_capacity,
        );

        let assets = AssetPreloader::new(
            mirror.clone(),
            Arc::new(VersionGate::from_config(&config.versions)),
            fetcher,
            clock.clone(),
            metrics.clone(),
            &config.assets,
            &config.preload,
        );
        let navigation = Arc::new(NavigationStrategy::from_config(&config.preload));
        assets.add_strategy(navigation.clone());
        assets.add_strategy(Arc::new(RoleStrategy::new(config.preload.role_assets.clone())));
        assets.add_strategy(Arc::new(TimeOfDayStrategy::from_config(&config.preload)));

        info!(
            context = %mirror.context_id(),
            remote = config.remote.enabled,
            build_version = %config.versions.build_version,
            "Cache engine ready"
        );

        Ok(CacheEngine {
            config: Arc::new(config),
            configs,
            assets,
            navigation,
            mirror,
            metrics,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

fn open_store(config: &Config) -> Arc<dyn MirrorStore> {
    match config.mirror.backend {
        MirrorBackend::File => match FileStore::open(&config.mirror.path) {
            Ok(store) => {
                info!(path = %config.mirror.path.display(), "File mirror opened");
                Arc::new(store)
            }
            Err(e) => {
                warn!(
                    path = %config.mirror.path.display(),
                    error = %e,
                    "Cannot open file mirror, durable tier disabled"
                );
                Arc::new(DisabledStore)
            }
        },
        MirrorBackend::Memory => Arc::new(MemoryStore::new()),
        MirrorBackend::Disabled => Arc::new(DisabledStore),
    }
}

pub struct CacheEngine {
    config: Arc<Config>,
    configs: ConfigCache,
    assets: AssetPreloader,
    navigation: Arc<NavigationStrategy>,
    mirror: Arc<DurableMirror>,
    metrics: Arc<CacheMetrics>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheEngine {
    pub fn builder(config: Config) -> CacheEngineBuilder {
        CacheEngineBuilder {
            config,
            store: None,
            bus: None,
            clock: None,
            remote: None,
            fetcher: None,
        }
    }

    /// Build everything from configuration alone.
    pub fn new(config: Config) -> CacheResult<Self> {
        Self::builder(config).build()
    }

    pub fn configs(&self) -> &ConfigCache {
        &self.configs
    }

    pub fn assets(&self) -> &AssetPreloader {
        &self.assets
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn mirror(&self) -> &Arc<DurableMirror> {
        &self.mirror
    }

    /// Start background work: cross-context sync, queue processing, the
    /// stats logger and the critical preload. Needs a tokio runtime.
    pub fn start(&self) {
        self.configs.spawn_sync();
        self.assets.spawn_queue_processing();

        let mut tasks = self.tasks.lock();

        let interval_secs = self.config.telemetry.log_interval_secs;
        if interval_secs > 0 {
            let configs = self.configs.clone();
            let assets = self.assets.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let stats = configs.get_cache_stats();
                    let asset_stats = assets.stats();
                    info!(
                        accesses = stats.access_count,
                        hit_rate = %format!("{:.1}%", stats.hit_rate * 100.0),
                        avg_access_ms = %format!("{:.3}", stats.average_access_ms),
                        entries = stats.entries,
                        mirror_bytes = stats.mirror.bytes_used,
                        assets_cached = asset_stats.cached,
                        assets_failed = asset_stats.failed,
                        "Cache stats"
                    );
                }
            }));
        }

        let critical = self.config.preload.critical.clone();
        if !critical.is_empty() {
            let assets = self.assets.clone();
            tasks.push(tokio::spawn(async move {
                assets.preload_critical(&critical).await;
            }));
        }

        debug!(tasks = tasks.len(), "Background tasks started");
    }

    /// Record a page transition and queue whatever the strategies predict
    /// for the new page. Pending lazy loads for the old page are cancelled.
    pub fn navigate(&self, from: &str, to: &str, role: Option<&str>) -> usize {
        self.navigation.record_navigation(from, to);
        let cancelled = self.assets.cancel_lazy();

        let mut ctx = self.assets.prediction_context().on_page(to);
        if let Some(role) = role {
            ctx = ctx.as_role(role);
        }
        let queued = self.assets.predict(&ctx);
        debug!(from, to, cancelled, queued, "Navigation recorded");
        queued
    }

    /// Clear caches, listeners and counters. For tests.
    pub fn reset(&self) {
        self.configs.reset();
        self.assets.reset();
    }

    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.configs.shutdown();
        self.assets.shutdown();
        info!(context = %self.mirror.context_id(), "Cache engine stopped");
    }
}

impl Drop for CacheEngine {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        self.configs.shutdown();
        self.assets.shutdown();
    }
}

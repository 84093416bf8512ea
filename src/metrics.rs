//! Prometheus metrics for the cache engine.
//!
//! Each engine owns its own registry, so several engines (tests, multiple
//! contexts in one process) never collide on registration.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Config access latency buckets (seconds).
/// Covers: 0.1ms, 0.5ms, 1ms, 5ms, 10ms, 50ms, 100ms, 500ms, 1s, 5s
const ACCESS_LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0,
];

pub struct CacheMetrics {
    registry: Registry,

    /// Config lookups - labels: result (hit/miss/fallback)
    pub config_lookups_total: IntCounterVec,

    /// Config access duration histogram
    pub config_access_seconds: Histogram,

    /// Asset loads - labels: outcome (loaded/failed/deduped/stale)
    pub asset_loads_total: IntCounterVec,

    /// Durable writes that failed and were swallowed
    pub mirror_write_failures_total: IntCounter,

    /// Change listeners that panicked
    pub listener_panics_total: IntCounter,
}

impl CacheMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let config_lookups_total = IntCounterVec::new(
            Opts::new("config_cache_lookups_total", "Config lookups by result"),
            &["result"],
        )?;
        let config_access_seconds = Histogram::with_opts(
            HistogramOpts::new("config_cache_access_seconds", "Config access time in seconds")
                .buckets(ACCESS_LATENCY_BUCKETS.to_vec()),
        )?;
        let asset_loads_total = IntCounterVec::new(
            Opts::new("config_cache_asset_loads_total", "Asset loads by outcome"),
            &["outcome"],
        )?;
        let mirror_write_failures_total = IntCounter::new(
            "config_cache_mirror_write_failures_total",
            "Durable mirror writes that failed",
        )?;
        let listener_panics_total = IntCounter::new(
            "config_cache_listener_panics_total",
            "Config change listeners that panicked",
        )?;

        registry.register(Box::new(config_lookups_total.clone()))?;
        registry.register(Box::new(config_access_seconds.clone()))?;
        registry.register(Box::new(asset_loads_total.clone()))?;
        registry.register(Box::new(mirror_write_failures_total.clone()))?;
        registry.register(Box::new(listener_panics_total.clone()))?;

        Ok(Self {
            registry,
            config_lookups_total,
            config_access_seconds,
            asset_loads_total,
            mirror_write_failures_total,
            listener_panics_total,
        })
    }

    pub fn record_lookup(&self, result: &str, seconds: f64) {
        self.config_lookups_total.with_label_values(&[result]).inc();
        self.config_access_seconds.observe(seconds);
    }

    pub fn record_asset(&self, outcome: &str) {
        self.asset_loads_total.with_label_values(&[outcome]).inc();
    }

    /// Render the registry in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

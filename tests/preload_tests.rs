//! Integration tests for the asset preloader and version gate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use config_cache_tier::cache::asset::{AssetContent, AssetKind, AssetRequest, Priority};
use config_cache_tier::clock::ManualClock;
use config_cache_tier::config::Config;
use config_cache_tier::error::{CacheError, CacheResult};
use config_cache_tier::fetch::AssetFetcher;
use config_cache_tier::CacheEngine;

/// Fetcher that counts calls, optionally failing the first `fail_first`.
#[derive(Default)]
struct CountingFetcher {
    calls: AtomicUsize,
    fail_first: usize,
    always_fail: bool,
    delay: Option<Duration>,
    urls: Mutex<Vec<String>>,
}

impl CountingFetcher {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetFetcher for CountingFetcher {
    async fn fetch(&self, url: &str, _kind: AssetKind) -> CacheResult<AssetContent> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().push(url.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.always_fail || call < self.fail_first {
            return Err(CacheError::HttpStatus {
                url: url.to_string(),
                status: 503,
            });
        }
        Ok(AssetContent::Text(format!("content of {url}")))
    }
}

fn engine(fetcher: Arc<CountingFetcher>) -> CacheEngine {
    engine_with_config(Config::in_memory(), fetcher)
}

fn engine_with_config(config: Config, fetcher: Arc<CountingFetcher>) -> CacheEngine {
    CacheEngine::builder(config)
        .clock(Arc::new(ManualClock::new(0)))
        .fetcher(fetcher)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_concurrent_preloads_share_one_fetch() {
    let fetcher = Arc::new(CountingFetcher {
        delay: Some(Duration::from_millis(20)),
        ..CountingFetcher::default()
    });
    let engine = engine(fetcher.clone());
    let assets = engine.assets();

    let request = [AssetRequest::new("/js/app.js", Priority::Critical)];
    let (a, b) = tokio::join!(assets.preload(&request), assets.preload(&request));

    assert_eq!(a.successful, 1);
    assert_eq!(b.successful, 1);
    assert_eq!(fetcher.calls(), 1);

    let first = assets.get_asset("/js/app.js").await.unwrap();
    assert_eq!(first.content, AssetContent::Text("content of /js/app.js".to_string()));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_concurrent_get_asset_resolve_to_same_record() {
    let fetcher = Arc::new(CountingFetcher {
        delay: Some(Duration::from_millis(20)),
        ..CountingFetcher::default()
    });
    let engine = engine(fetcher.clone());
    let assets = engine.assets();

    let (a, b) = tokio::join!(assets.get_asset("/img/logo.svg"), assets.get_asset("/img/logo.svg"));

    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_version_change_forces_exactly_one_refetch() {
    let fetcher = Arc::new(CountingFetcher::default());
    let mut config = Config::in_memory();
    config.versions.build_version = "v1".to_string();
    let engine = engine_with_config(config, fetcher.clone());
    let assets = engine.assets();

    let cached = assets.get_asset("/css/app.css").await.unwrap();
    assert_eq!(cached.version, "v1");
    assert_eq!(fetcher.calls(), 1);

    assets.gate().set_version("/css/app.css", "v2");

    let refreshed = assets.get_asset("/css/app.css").await.unwrap();
    assert_eq!(refreshed.version, "v2");
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(assets.stats().stale_evictions, 1);

    // Current again, served from cache.
    assets.get_asset("/css/app.css").await.unwrap();
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn test_stale_record_is_evicted_on_read() {
    let fetcher = Arc::new(CountingFetcher::default());
    let engine = engine(fetcher.clone());
    let assets = engine.assets();

    assets.get_asset("/js/chat.js").await.unwrap();
    assets.gate().set_version("/js/chat.js", "next");

    assert!(assets.cached("/js/chat.js").is_none());
    assert_eq!(engine.mirror().read("asset_/js/chat.js"), None);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let fetcher = Arc::new(CountingFetcher {
        fail_first: 2,
        ..CountingFetcher::default()
    });
    let engine = engine(fetcher.clone());

    let report = engine
        .assets()
        .preload(&[AssetRequest::new("/js/flaky.js", Priority::Preload)])
        .await;

    assert_eq!(report.successful, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test]
async fn test_failures_are_counted_not_raised() {
    let fetcher = Arc::new(CountingFetcher {
        always_fail: true,
        ..CountingFetcher::default()
    });
    let engine = engine(fetcher.clone());

    let report = engine
        .assets()
        .preload(&[
            AssetRequest::new("/a.js", Priority::Preload),
            AssetRequest::new("/b.js", Priority::Preload),
        ])
        .await;

    assert_eq!(report.total, 2);
    assert_eq!(report.successful, 0);
    assert_eq!(report.failed, 2);
    // Three attempts each.
    assert_eq!(fetcher.calls(), 6);
    assert_eq!(engine.assets().stats().failed, 2);
    assert!(engine.assets().get_asset("/a.js").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_default_backoff_schedule() {
    let fetcher = Arc::new(CountingFetcher {
        always_fail: true,
        ..CountingFetcher::default()
    });
    // Default policy: 1s then 2s between three attempts.
    let mut config = Config::in_memory();
    config.assets.retry_base_delay_ms = 1_000;
    let engine = engine_with_config(config, fetcher.clone());

    let started = tokio::time::Instant::now();
    let report = engine
        .assets()
        .preload(&[AssetRequest::new("/slow.js", Priority::Preload)])
        .await;

    assert_eq!(report.failed, 1);
    assert_eq!(fetcher.calls(), 3);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_navigation_predictions_feed_the_queue() {
    let fetcher = Arc::new(CountingFetcher::default());
    let mut config = Config::in_memory();
    config.preload.route_assets.insert(
        "/analytics".to_string(),
        vec!["/js/charts.js".to_string()],
    );
    let engine = engine_with_config(config, fetcher.clone());

    // Teach the strategy that /dashboard leads to /analytics.
    assert_eq!(engine.navigate("/dashboard", "/analytics", None), 0);
    let queued = engine.navigate("/home", "/dashboard", Some("student"));

    // /analytics assets (navigation) and the student bundle (role).
    assert_eq!(queued, 2);

    let report = engine.assets().process_queue().await;
    assert_eq!(report.successful, 2);
    let fetched = fetcher.urls.lock().clone();
    assert!(fetched.contains(&"/js/charts.js".to_string()));
    assert!(fetched.contains(&"/static/js/chat.js".to_string()));
}

#[tokio::test]
async fn test_background_queue_processing() {
    let fetcher = Arc::new(CountingFetcher::default());
    let engine = engine(fetcher.clone());
    engine.start();

    let queued = engine
        .assets()
        .enqueue([AssetRequest::new("/js/later.js", Priority::Lazy)], "test");
    assert_eq!(queued, 1);

    tokio::time::timeout(Duration::from_secs(2), async {
        while engine.assets().cached("/js/later.js").is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(fetcher.calls(), 1);
    engine.shutdown();
}

#[tokio::test]
async fn test_reset_forgets_assets() {
    let fetcher = Arc::new(CountingFetcher::default());
    let engine = engine(fetcher.clone());

    engine.assets().get_asset("/js/app.js").await.unwrap();
    engine.reset();

    assert!(engine.assets().cached("/js/app.js").is_none());
    assert_eq!(engine.assets().stats().loaded, 0);

    engine.assets().get_asset("/js/app.js").await.unwrap();
    assert_eq!(fetcher.calls(), 2);
}

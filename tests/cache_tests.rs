//! Integration tests for the config cache facade.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use config_cache_tier::cache::resolver::{Source, SourceChain};
use config_cache_tier::cache::ttl_store::{Lookup, TtlStore, VolatilityClass};
use config_cache_tier::clock::ManualClock;
use config_cache_tier::config::Config;
use config_cache_tier::error::{CacheError, CacheResult};
use config_cache_tier::fetch::RemoteSettings;
use config_cache_tier::{CacheEngine, GetOptions, SetOptions};

/// Remote settings service with scripted answers.
#[derive(Default)]
struct ScriptedRemote {
    values: HashMap<String, Value>,
    calls: AtomicUsize,
    panic_on: Mutex<Option<String>>,
    failing: bool,
    delay: Option<Duration>,
    pushed: Mutex<Vec<(String, Value)>>,
}

impl ScriptedRemote {
    fn with(values: &[(&str, Value)]) -> Self {
        Self {
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSettings for ScriptedRemote {
    async fn fetch(&self, key: &str) -> CacheResult<Option<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_on.lock().as_deref() == Some(key) {
            panic!("remote settings blew up on {key}");
        }
        if self.failing {
            return Err(CacheError::unavailable("remote", "connection refused"));
        }
        Ok(self.values.get(key).cloned())
    }

    async fn push(&self, key: &str, value: &Value) -> CacheResult<()> {
        self.pushed.lock().push((key.to_string(), value.clone()));
        Ok(())
    }
}

fn engine(clock: &ManualClock, remote: Option<Arc<ScriptedRemote>>) -> CacheEngine {
    engine_with_config(Config::in_memory(), clock, remote)
}

fn engine_with_config(
    config: Config,
    clock: &ManualClock,
    remote: Option<Arc<ScriptedRemote>>,
) -> CacheEngine {
    let mut builder = CacheEngine::builder(config).clock(Arc::new(clock.clone()));
    if let Some(remote) = remote {
        builder = builder.remote(remote);
    }
    builder.build().unwrap()
}

#[test]
fn test_ttl_store_entry_expires_after_volatile_ttl() {
    let clock = ManualClock::new(1_000);
    let store = TtlStore::new(Arc::new(clock.clone()));

    store.set("a", json!(1), VolatilityClass::Volatile);
    clock.advance(300_001);

    let lookup = store.get("a", VolatilityClass::Volatile);
    assert!(!lookup.is_hit());
    assert!(matches!(lookup, Lookup::Expired(_)));
    // The expired entry is gone, not just hidden.
    assert!(store.peek("a").is_none());
    assert!(matches!(store.get("a", VolatilityClass::Volatile), Lookup::Miss));
}

#[tokio::test]
async fn test_expired_entry_counts_as_miss() {
    let clock = ManualClock::new(0);
    let engine = engine(&clock, None);
    let configs = engine.configs();

    configs.get_config("ui.theme", GetOptions::default()).await;
    configs.get_config("ui.theme", GetOptions::default()).await;
    assert_eq!(configs.get_cache_stats().hit_count, 1);

    clock.advance(300_001);
    let value = configs.get_config("ui.theme", GetOptions::default()).await;
    assert_eq!(value, json!("light"));

    let stats = configs.get_cache_stats();
    assert_eq!(stats.access_count, 3);
    assert_eq!(stats.hit_count, 1);
}

#[tokio::test]
async fn test_static_class_outlives_volatile_ttl() {
    let clock = ManualClock::new(0);
    let engine = engine(&clock, None);
    let configs = engine.configs();
    let options = GetOptions::with_class(VolatilityClass::Static);

    configs.get_config("ui.language", options.clone()).await;
    clock.advance(300_001);
    configs.get_config("ui.language", options).await;

    assert_eq!(configs.get_cache_stats().hit_count, 1);
}

#[tokio::test]
async fn test_chain_falls_back_to_default() {
    let clock = ManualClock::new(0);
    let remote = Arc::new(ScriptedRemote::default());
    let engine = engine(&clock, Some(remote.clone()));

    let value = engine
        .configs()
        .get_config("ui.theme", GetOptions::with_remote())
        .await;

    assert_eq!(value, json!("light"));
    assert_eq!(remote.calls(), 1);
}

#[tokio::test]
async fn test_failing_remote_is_skipped() {
    let clock = ManualClock::new(0);
    let remote = Arc::new(ScriptedRemote {
        failing: true,
        ..ScriptedRemote::default()
    });
    let engine = engine(&clock, Some(remote.clone()));

    let value = engine
        .configs()
        .get_config("api.timeout", GetOptions::with_remote())
        .await;

    assert_eq!(value, json!(30_000));
    assert_eq!(remote.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_remote_times_out_to_default() {
    let clock = ManualClock::new(0);
    let remote = Arc::new(ScriptedRemote {
        values: HashMap::from([("ui.theme".to_string(), json!("dark"))]),
        delay: Some(Duration::from_secs(60)),
        ..ScriptedRemote::default()
    });
    let engine = engine(&clock, Some(remote.clone()));

    let started = tokio::time::Instant::now();
    let value = engine
        .configs()
        .get_config("ui.theme", GetOptions::with_remote())
        .await;

    assert_eq!(value, json!("light"));
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(60));
}

#[tokio::test]
async fn test_first_success_wins() {
    let clock = ManualClock::new(0);
    let remote = Arc::new(ScriptedRemote::with(&[("api.timeout", json!(1234))]));
    let engine = engine(&clock, Some(remote.clone()));

    engine
        .mirror()
        .write("config_api", &json!({ "timeout": 9999 }))
        .unwrap();

    let value = engine
        .configs()
        .get_config("api.timeout", GetOptions::with_remote())
        .await;

    assert_eq!(value, json!(9999));
    assert_eq!(remote.calls(), 0);
}

#[tokio::test]
async fn test_injected_values_resolve_before_defaults() {
    let clock = ManualClock::new(0);
    let mut config = Config::in_memory();
    config
        .injected
        .insert("features.experimental".to_string(), json!(true));
    let engine = engine_with_config(config, &clock, None);

    let value = engine
        .configs()
        .get_config("features.experimental", GetOptions::default())
        .await;
    assert_eq!(value, json!(true));
}

#[tokio::test]
async fn test_unknown_key_resolves_to_null() {
    let clock = ManualClock::new(0);
    let engine = engine(&clock, None);

    let value = engine
        .configs()
        .get_config("no.such.setting", GetOptions::default())
        .await;
    assert_eq!(value, Value::Null);
    // Null results are not persisted.
    assert_eq!(engine.mirror().read("config_no.such.setting"), None);
}

#[tokio::test]
async fn test_resolved_value_is_written_through() {
    let clock = ManualClock::new(0);
    let remote = Arc::new(ScriptedRemote::with(&[("ui.pageSize", json!(50))]));
    let engine = engine(&clock, Some(remote.clone()));

    engine
        .configs()
        .get_config("ui.pageSize", GetOptions::with_remote())
        .await;

    assert_eq!(engine.mirror().read("config_ui.pageSize"), Some(json!(50)));
}

#[tokio::test]
async fn test_invalidation_is_idempotent() {
    let clock = ManualClock::new(0);
    let engine = engine(&clock, None);
    let configs = engine.configs();

    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    let _sub = configs.on_config_change("ui.theme", move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    configs
        .set_config("ui.theme", json!("dark"), SetOptions::default())
        .await;
    configs.invalidate_config("ui.theme");
    let after_one = (configs.get_cache_stats().entries, engine.mirror().read("config_ui.theme"));
    configs.invalidate_config("ui.theme");
    let after_two = (configs.get_cache_stats().entries, engine.mirror().read("config_ui.theme"));

    assert_eq!(after_one, after_two);
    assert_eq!(after_two, (0, None));
    // Invalidation does not notify.
    assert_eq!(notified.load(Ordering::SeqCst), 1);

    // And the next read resolves afresh.
    let value = configs.get_config("ui.theme", GetOptions::default()).await;
    assert_eq!(value, json!("light"));
}

#[tokio::test]
async fn test_panicking_listener_does_not_block_others() {
    let clock = ManualClock::new(0);
    let engine = engine(&clock, None);
    let configs = engine.configs();

    let _bad = configs.on_config_change("ui.theme", |_, _, _| panic!("listener bug"));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _good = configs.on_config_change("ui.theme", move |new, old, key| {
        sink.lock().push((key.to_string(), new.clone(), old.clone()));
    });

    configs
        .set_config("ui.theme", json!("dark"), SetOptions::default())
        .await;

    assert_eq!(
        seen.lock().as_slice(),
        &[("ui.theme".to_string(), json!("dark"), Value::Null)]
    );
    assert_eq!(engine.metrics().listener_panics_total.get(), 1);
}

#[tokio::test]
async fn test_set_then_get_observes_write() {
    let clock = ManualClock::new(0);
    let engine = engine(&clock, None);
    let configs = engine.configs();

    configs
        .set_config("ui.theme", json!("dark"), SetOptions::default())
        .await;
    assert_eq!(
        configs.get_config("ui.theme", GetOptions::default()).await,
        json!("dark")
    );
    assert_eq!(configs.get_cache_stats().hit_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_write_during_remote_read_is_not_overwritten() {
    let clock = ManualClock::new(0);
    let remote = Arc::new(ScriptedRemote {
        delay: Some(Duration::from_millis(200)),
        ..ScriptedRemote::with(&[("custom.x", json!("remote"))])
    });
    let engine = engine(&clock, Some(remote.clone()));
    let configs = engine.configs();

    let (read, ()) = tokio::join!(
        configs.get_config("custom.x", GetOptions::with_remote()),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            configs
                .set_config("custom.x", json!("set"), SetOptions::default())
                .await;
        }
    );

    assert_eq!(remote.calls(), 1);
    assert_eq!(read, json!("set"));
    assert_eq!(
        configs.get_config("custom.x", GetOptions::default()).await,
        json!("set")
    );
    assert_eq!(engine.mirror().read("config_custom.x"), Some(json!("set")));
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_during_remote_read_skips_write_back() {
    let clock = ManualClock::new(0);
    let remote = Arc::new(ScriptedRemote {
        delay: Some(Duration::from_millis(200)),
        ..ScriptedRemote::with(&[("custom.y", json!("remote"))])
    });
    let engine = engine(&clock, Some(remote.clone()));
    let configs = engine.configs();

    let (read, ()) = tokio::join!(
        configs.get_config("custom.y", GetOptions::with_remote()),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            configs.invalidate_config("custom.y");
        }
    );

    // The caller still gets an answer, but nothing is cached from it.
    assert_eq!(read, json!("remote"));
    assert_eq!(configs.get_cache_stats().entries, 0);
    assert_eq!(engine.mirror().read("config_custom.y"), None);
}

#[tokio::test]
async fn test_set_null_notifies_with_previous_value() {
    let clock = ManualClock::new(0);
    let engine = engine(&clock, None);
    let configs = engine.configs();

    configs
        .set_config("ui.theme", json!("dark"), SetOptions::default())
        .await;

    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let _sub = configs.on_config_change("ui.theme", move |new, old, _| {
        *sink.lock() = Some((new.clone(), old.clone()));
    });

    configs
        .set_config("ui.theme", Value::Null, SetOptions::default())
        .await;

    assert_eq!(*seen.lock(), Some((Value::Null, json!("dark"))));
}

#[tokio::test]
async fn test_push_remote_on_set() {
    let clock = ManualClock::new(0);
    let remote = Arc::new(ScriptedRemote::default());
    let engine = engine(&clock, Some(remote.clone()));

    engine
        .configs()
        .set_config(
            "ui.language",
            json!("de"),
            SetOptions {
                push_remote: true,
                ..SetOptions::default()
            },
        )
        .await;

    assert_eq!(
        remote.pushed.lock().as_slice(),
        &[("ui.language".to_string(), json!("de"))]
    );
}

#[tokio::test]
async fn test_batch_survives_one_failing_key() {
    let clock = ManualClock::new(0);
    let remote = Arc::new(ScriptedRemote::with(&[("api.timeout", json!(1234))]));
    *remote.panic_on.lock() = Some("ui.theme".to_string());
    let engine = engine(&clock, Some(remote.clone()));

    let values = engine
        .configs()
        .get_configs(["api.timeout", "ui.theme", "ui.language"], GetOptions::with_remote())
        .await;

    assert_eq!(values.len(), 3);
    assert_eq!(values["api.timeout"], json!(1234));
    assert_eq!(values["ui.theme"], json!("light"));
    assert_eq!(values["ui.language"], json!("en"));
}

#[tokio::test]
async fn test_panicking_resolution_prefers_stale_value() {
    let clock = ManualClock::new(0);
    let remote = Arc::new(ScriptedRemote::with(&[("custom.banner", json!("v1"))]));
    let engine = engine(&clock, Some(remote.clone()));
    let remote_only = GetOptions::with_sources(SourceChain::new([Source::Remote]));

    let first = engine
        .configs()
        .get_config("custom.banner", remote_only.clone())
        .await;
    assert_eq!(first, json!("v1"));

    *remote.panic_on.lock() = Some("custom.banner".to_string());
    clock.advance(300_001);

    let second = engine
        .configs()
        .get_config("custom.banner", remote_only)
        .await;
    assert_eq!(second, json!("v1"));
    assert_eq!(remote.calls(), 2);
}

#[tokio::test]
async fn test_watch_receives_changes() {
    let clock = ManualClock::new(0);
    let engine = engine(&clock, None);
    let mut changes = engine.configs().watch();

    engine
        .configs()
        .set_config("chat.historyLimit", json!(100), SetOptions::default())
        .await;

    let change = changes.recv().await.unwrap();
    assert_eq!(change.key, "chat.historyLimit");
    assert_eq!(change.new_value, json!(100));
    assert_eq!(change.old_value, Value::Null);
}

#[tokio::test]
async fn test_disabled_storage_keeps_memory_tier_working() {
    let clock = ManualClock::new(0);
    let mut config = Config::in_memory();
    config.mirror.backend = config_cache_tier::config::MirrorBackend::Disabled;
    let engine = engine_with_config(config, &clock, None);
    let configs = engine.configs();

    configs
        .set_config("ui.theme", json!("dark"), SetOptions::default())
        .await;

    assert_eq!(
        configs.get_config("ui.theme", GetOptions::default()).await,
        json!("dark")
    );
    assert_eq!(engine.metrics().mirror_write_failures_total.get(), 1);
}

//! Source chain resolver.
//!
//! Walks an ordered list of providers until one yields a non-null value.
//! First success wins; values are never merged across sources. A failing
//! provider is logged and skipped, and the chain always ends at the default
//! table, so resolution itself cannot fail.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::cache::defaults::DefaultTable;
use crate::cache::mirror::{config_key, DurableMirror};
use crate::error::{CacheError, CacheResult};
use crate::fetch::RemoteSettings;

/// A value provider in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Persisted values shared with other contexts.
    DurableMirror,
    /// Values injected into this process.
    ProcessMemory,
    /// The remote settings service.
    Remote,
    /// The static default table.
    Default,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::DurableMirror => write!(f, "durable_mirror"),
            Source::ProcessMemory => write!(f, "process_memory"),
            Source::Remote => write!(f, "remote"),
            Source::Default => write!(f, "default"),
        }
    }
}

/// Ordered providers, always terminated by [`Source::Default`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceChain(Vec<Source>);

impl SourceChain {
    /// Build a chain. Duplicates are dropped, anything after `Default` is
    /// ignored and `Default` is appended when missing.
    pub fn new(sources: impl IntoIterator<Item = Source>) -> Self {
        let mut chain = Vec::new();
        for source in sources {
            if chain.contains(&source) {
                continue;
            }
            chain.push(source);
            if source == Source::Default {
                break;
            }
        }
        if chain.last() != Some(&Source::Default) {
            chain.push(Source::Default);
        }
        Self(chain)
    }

    /// Mirror → process memory → defaults. Remote is opt-in.
    pub fn standard() -> Self {
        Self::new([Source::DurableMirror, Source::ProcessMemory, Source::Default])
    }

    /// The standard chain with the remote service before the defaults.
    pub fn with_remote() -> Self {
        Self::new([
            Source::DurableMirror,
            Source::ProcessMemory,
            Source::Remote,
            Source::Default,
        ])
    }

    pub fn sources(&self) -> &[Source] {
        &self.0
    }

    pub fn contains(&self, source: Source) -> bool {
        self.0.contains(&source)
    }
}

impl Default for SourceChain {
    fn default() -> Self {
        Self::standard()
    }
}

/// Process-local injected values.
#[derive(Debug, Default)]
pub struct ProcessMemory {
    values: RwLock<HashMap<String, Value>>,
}

impl ProcessMemory {
    pub fn new(initial: HashMap<String, Value>) -> Self {
        Self {
            values: RwLock::new(initial),
        }
    }

    pub fn inject(&self, key: impl Into<String>, value: Value) {
        self.values.write().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.write().remove(key)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }
}

/// A resolved value and the source that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub value: Value,
    pub source: Source,
}

pub struct SourceResolver {
    mirror: Arc<DurableMirror>,
    memory: Arc<ProcessMemory>,
    remote: Option<Arc<dyn RemoteSettings>>,
    defaults: DefaultTable,
    remote_timeout: Duration,
}

impl SourceResolver {
    pub fn new(
        mirror: Arc<DurableMirror>,
        memory: Arc<ProcessMemory>,
        remote: Option<Arc<dyn RemoteSettings>>,
        defaults: DefaultTable,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            mirror,
            memory,
            remote,
            defaults,
            remote_timeout,
        }
    }

    /// Resolve `key` through `chain`.
    pub async fn resolve(&self, key: &str, chain: &SourceChain) -> Resolution {
        for &source in chain.sources() {
            match self.fetch_from(source, key).await {
                Ok(Some(value)) if !value.is_null() => {
                    debug!(key, source = %source, "Resolved");
                    return Resolution { value, source };
                }
                Ok(_) => debug!(key, source = %source, "No value, trying next source"),
                Err(e) if e.is_source_failure() => {
                    warn!(key, source = %source, error = %e, "Source failed, trying next")
                }
                Err(e) => error!(key, source = %source, error = %e, "Source errored, trying next"),
            }
        }

        Resolution {
            value: self.default_value(key),
            source: Source::Default,
        }
    }

    /// The default table's answer for `key` (null when it has none).
    pub fn default_value(&self, key: &str) -> Value {
        self.defaults.get(key).unwrap_or(Value::Null)
    }

    pub fn defaults(&self) -> &DefaultTable {
        &self.defaults
    }

    pub fn memory(&self) -> &Arc<ProcessMemory> {
        &self.memory
    }

    pub fn remote(&self) -> Option<&Arc<dyn RemoteSettings>> {
        self.remote.as_ref()
    }

    pub fn remote_timeout(&self) -> Duration {
        self.remote_timeout
    }

    async fn fetch_from(&self, source: Source, key: &str) -> CacheResult<Option<Value>> {
        match source {
            Source::DurableMirror => Ok(self.read_mirror(key)),
            Source::ProcessMemory => Ok(self.memory.get(key)),
            Source::Remote => self.fetch_remote(key).await,
            Source::Default => Ok(self.defaults.get(key)),
        }
    }

    /// Exact entry first, then descend into a persisted parent object:
    /// `config_api = {"timeout": 9999}` answers `api.timeout`.
    fn read_mirror(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.mirror.read(&config_key(key)) {
            if !value.is_null() {
                return Some(value);
            }
        }

        let segments: Vec<&str> = key.split('.').collect();
        for split in (1..segments.len()).rev() {
            let parent = segments[..split].join(".");
            if let Some(object) = self.mirror.read(&config_key(&parent)) {
                if let Some(value) = lookup_path(&object, &segments[split..]) {
                    return Some(value.clone());
                }
            }
        }
        None
    }

    async fn fetch_remote(&self, key: &str) -> CacheResult<Option<Value>> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| CacheError::unavailable("remote", "no remote settings client configured"))?;

        match tokio::time::timeout(self.remote_timeout, remote.fetch(key)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::TimeoutExceeded(self.remote_timeout)),
        }
    }
}

fn lookup_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(value, |current, segment| current.get(*segment))
        .filter(|v| !v.is_null())
}

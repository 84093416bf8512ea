//! Durable mirror: the second tier.
//!
//! Wraps a [`MirrorStore`] with JSON encoding, a size quota, optional zstd
//! compression and a change bus. Each `DurableMirror` is one execution
//! context's handle onto storage shared with other contexts; every write or
//! removal is announced on the [`MirrorBus`] and delivered to every *other*
//! context, which is how TTL stores stay eventually consistent.
//!
//! Reads never fail: corruption and disabled storage both read as `None`.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::compressor::Compressor;
use crate::config::MirrorConfig;
use crate::error::{CacheError, CacheResult};
use crate::storage::MirrorStore;

/// Namespace of configuration entries.
pub const CONFIG_PREFIX: &str = "config_";

/// Namespace of asset entries.
pub const ASSET_PREFIX: &str = "asset_";

pub fn config_key(key: &str) -> String {
    format!("{CONFIG_PREFIX}{key}")
}

pub fn asset_key(url: &str) -> String {
    format!("{ASSET_PREFIX}{url}")
}

/// Identifies one execution context attached to the mirror.
pub type ContextId = Uuid;

/// A change made to the mirror by some context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorEvent {
    /// Namespaced storage key.
    pub key: String,
    /// New value, `None` when the entry was removed.
    pub value: Option<Value>,
    /// Context that made the change.
    pub origin: ContextId,
}

/// Cross-context change channel.
#[derive(Debug, Clone)]
pub struct MirrorBus {
    tx: broadcast::Sender<MirrorEvent>,
}

impl MirrorBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: MirrorEvent) {
        // No receivers is fine: nobody else is listening yet.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MirrorEvent> {
        self.tx.subscribe()
    }
}

/// Receives changes made by other contexts.
pub struct MirrorSubscriber {
    rx: broadcast::Receiver<MirrorEvent>,
    context: ContextId,
}

impl MirrorSubscriber {
    /// Next foreign event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<MirrorEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.origin == self.context => continue,
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Mirror subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Storage usage snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MirrorUsage {
    pub entries: usize,
    pub bytes_used: usize,
    pub quota_bytes: usize,
}

pub struct DurableMirror {
    store: Arc<dyn MirrorStore>,
    bus: MirrorBus,
    context: ContextId,
    compressor: Compressor,
    quota_bytes: usize,
}

impl DurableMirror {
    /// Attach a new context to `store`.
    pub fn new(store: Arc<dyn MirrorStore>, bus: MirrorBus, config: &MirrorConfig) -> Self {
        Self {
            store,
            bus,
            context: Uuid::new_v4(),
            compressor: Compressor::new(config),
            quota_bytes: config.quota_bytes,
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.context
    }

    pub fn bus(&self) -> &MirrorBus {
        &self.bus
    }

    pub fn read(&self, key: &str) -> Option<Value> {
        self.read_as(key)
    }

    /// Read and decode an entry. Any failure is a miss.
    pub fn read_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let stored = match self.store.get(key) {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, backend = self.store.name(), error = %e, "Mirror read failed");
                return None;
            }
        };

        let payload = match self.compressor.decode(&stored) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key, error = %e, "Corrupt compressed mirror entry, treating as miss");
                return None;
            }
        };

        match serde_json::from_slice(&payload) {
            Ok(value) => Some(value),
            Err(e) => {
                let err = CacheError::from(e);
                warn!(key, error = %err, "Malformed mirror entry, treating as miss");
                None
            }
        }
    }

    pub fn write(&self, key: &str, value: &Value) -> CacheResult<()> {
        let payload = serde_json::to_vec(value)?;
        self.write_payload(key, payload)?;
        self.bus.publish(MirrorEvent {
            key: key.to_string(),
            value: Some(value.clone()),
            origin: self.context,
        });
        Ok(())
    }

    /// Encode `value` as JSON and write it.
    pub fn write_as<T: Serialize>(&self, key: &str, value: &T) -> CacheResult<()> {
        let value = serde_json::to_value(value)?;
        self.write(key, &value)
    }

    fn write_payload(&self, key: &str, payload: Vec<u8>) -> CacheResult<()> {
        let encoded = self.compressor.encode(payload)?;

        let existing = self.store.entry_size(key)?.unwrap_or(0);
        let used = self.store.total_bytes()?.saturating_sub(existing);
        let available = self.quota_bytes.saturating_sub(used);
        if encoded.len() > available {
            return Err(CacheError::QuotaExceeded {
                needed: encoded.len(),
                available,
            });
        }

        self.store.put(key, &encoded)?;
        debug!(key, size = encoded.len(), "Mirror write");
        Ok(())
    }

    /// Remove an entry. Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        match self.store.delete(key) {
            Ok(existed) => {
                if existed {
                    self.bus.publish(MirrorEvent {
                        key: key.to_string(),
                        value: None,
                        origin: self.context,
                    });
                }
                existed
            }
            Err(e) => {
                warn!(key, error = %e, "Mirror remove failed");
                false
            }
        }
    }

    /// Remove every entry whose key starts with `prefix`.
    pub fn clear(&self, prefix: &str) -> usize {
        let keys = match self.store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(prefix, error = %e, "Mirror listing failed");
                return 0;
            }
        };
        keys.iter()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| self.remove(k))
            .count()
    }

    pub fn usage(&self) -> MirrorUsage {
        MirrorUsage {
            entries: self.store.keys().map(|k| k.len()).unwrap_or(0),
            bytes_used: self.store.total_bytes().unwrap_or(0),
            quota_bytes: self.quota_bytes,
        }
    }

    /// Subscribe to changes made by other contexts.
    pub fn subscribe(&self) -> MirrorSubscriber {
        MirrorSubscriber {
            rx: self.bus.subscribe(),
            context: self.context,
        }
    }
}

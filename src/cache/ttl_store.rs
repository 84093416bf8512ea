//! In-process TTL store: the first tier.
//!
//! A key → entry map with two expiry classes. No I/O. The expiry check and
//! the eviction of an expired entry happen under one lock acquisition, so a
//! caller can never observe a stale value as a hit.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;

/// TTL of [`VolatilityClass::Volatile`] entries (5 minutes).
pub const VOLATILE_TTL_MS: u64 = 300_000;

/// TTL of [`VolatilityClass::Static`] entries (60 minutes).
pub const STATIC_TTL_MS: u64 = 3_600_000;

/// How long a cached value is trusted before it must be re-resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolatilityClass {
    /// Settings that may change during a session.
    #[default]
    Volatile,
    /// Settings and assets that change only with a deploy.
    Static,
}

impl VolatilityClass {
    pub fn ttl_ms(&self) -> u64 {
        match self {
            VolatilityClass::Volatile => VOLATILE_TTL_MS,
            VolatilityClass::Static => STATIC_TTL_MS,
        }
    }
}

impl std::fmt::Display for VolatilityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolatilityClass::Volatile => write!(f, "volatile"),
            VolatilityClass::Static => write!(f, "static"),
        }
    }
}

/// A cached value with the time it was stored.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,

    /// Epoch milliseconds of the last write.
    pub cached_at: u64,

    /// Class the entry was written with.
    pub class: VolatilityClass,
}

impl<V> CacheEntry<V> {
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.cached_at)
    }

    /// Expired once its age reaches the class TTL.
    pub fn is_expired(&self, class: VolatilityClass, now_ms: u64) -> bool {
        self.age_ms(now_ms) >= class.ttl_ms()
    }
}

/// Outcome of a TTL lookup.
///
/// `Expired` is a miss for every purpose; the entry is already gone. The
/// stale value is handed back only so callers can use it as a last resort.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<V> {
    Hit(V),
    Expired(V),
    Miss,
}

impl<V> Lookup<V> {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    /// The value if this was a hit.
    pub fn hit(self) -> Option<V> {
        match self {
            Lookup::Hit(v) => Some(v),
            _ => None,
        }
    }

    /// The value if one existed, fresh or stale.
    pub fn into_stale(self) -> Option<V> {
        match self {
            Lookup::Hit(v) | Lookup::Expired(v) => Some(v),
            Lookup::Miss => None,
        }
    }
}

pub struct TtlStore<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    clock: SharedClock,
}

impl<V: Clone> TtlStore<V> {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Look up `key`, treating it as `class` for expiry.
    pub fn get(&self, key: &str, class: VolatilityClass) -> Lookup<V> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();

        let expired = match entries.get(key) {
            None => return Lookup::Miss,
            Some(entry) => entry.is_expired(class, now),
        };

        if expired {
            match entries.remove(key) {
                Some(entry) => Lookup::Expired(entry.value),
                None => Lookup::Miss,
            }
        } else {
            match entries.get(key) {
                Some(entry) => Lookup::Hit(entry.value.clone()),
                None => Lookup::Miss,
            }
        }
    }

    /// Store `value`, refreshing the timestamp. Returns the previous value.
    pub fn set(&self, key: impl Into<String>, value: V, class: VolatilityClass) -> Option<V> {
        let entry = CacheEntry {
            value,
            cached_at: self.clock.now_ms(),
            class,
        };
        self.entries.lock().insert(key.into(), entry).map(|e| e.value)
    }

    /// Current entry regardless of age. Never evicts.
    pub fn peek(&self, key: &str) -> Option<CacheEntry<V>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn delete(&self, key: &str) -> Option<V> {
        self.entries.lock().remove(key).map(|e| e.value)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! In-memory and disabled mirror stores.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{CacheError, CacheResult};
use crate::storage::MirrorStore;

/// Process-local store. Sharing one instance between several mirrors
/// simulates several contexts over one origin's storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MirrorStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, data: &[u8]) -> CacheResult<()> {
        self.entries.write().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn keys(&self) -> CacheResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    fn entry_size(&self, key: &str) -> CacheResult<Option<usize>> {
        Ok(self.entries.read().get(key).map(Vec::len))
    }

    fn total_bytes(&self) -> CacheResult<usize> {
        Ok(self.entries.read().values().map(Vec::len).sum())
    }
}

/// Storage turned off: every read misses and every write fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledStore;

impl MirrorStore for DisabledStore {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn get(&self, _key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(None)
    }

    fn put(&self, _key: &str, _data: &[u8]) -> CacheResult<()> {
        Err(CacheError::StorageDisabled)
    }

    fn delete(&self, _key: &str) -> CacheResult<bool> {
        Ok(false)
    }

    fn keys(&self) -> CacheResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn entry_size(&self, _key: &str) -> CacheResult<Option<usize>> {
        Ok(None)
    }

    fn total_bytes(&self) -> CacheResult<usize> {
        Ok(0)
    }
}

//! Byte-level backends for the durable mirror.
//!
//! - [`file_store`]: one file per key on local disk, survives restart
//! - [`memory_store`]: process-local map, plus the always-failing disabled store
//!
//! Backends are synchronous and know nothing about JSON, quotas or
//! notifications; [`crate::cache::mirror`] layers those on top.

pub mod file_store;
pub mod memory_store;

use crate::error::CacheResult;

pub use file_store::FileStore;
pub use memory_store::{DisabledStore, MemoryStore};

/// A key → bytes store shared by every context attached to the mirror.
pub trait MirrorStore: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    fn put(&self, key: &str, data: &[u8]) -> CacheResult<()>;

    /// Returns whether the key existed.
    fn delete(&self, key: &str) -> CacheResult<bool>;

    fn keys(&self) -> CacheResult<Vec<String>>;

    /// Stored size of one entry in bytes.
    fn entry_size(&self, key: &str) -> CacheResult<Option<usize>>;

    /// Stored size of all entries in bytes.
    fn total_bytes(&self) -> CacheResult<usize>;
}

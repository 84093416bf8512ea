//! File-backed mirror store.
//!
//! Each key lives in its own file under a sharded directory tree. Writes go
//! through a temp file and a rename, so a reader in another process never
//! sees a torn payload.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::error::CacheResult;
use crate::storage::MirrorStore;

const ENTRY_EXTENSION: &str = "entry";

/// Transfer statistics.
#[derive(Debug, Default)]
pub struct FileStoreStats {
    pub total_writes: AtomicU64,
    pub total_reads: AtomicU64,
    pub total_bytes_written: AtomicU64,
    pub total_bytes_read: AtomicU64,
    /// Bytes currently on disk. Seeded by a scan on open, then kept
    /// current by `put` and `delete`.
    pub bytes_stored: AtomicU64,
}

pub struct FileStore {
    root: PathBuf,
    stats: FileStoreStats,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> CacheResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let store = Self {
            root,
            stats: FileStoreStats::default(),
        };

        let mut stored = 0u64;
        for path in store.entry_files()? {
            stored += fs::metadata(&path)?.len();
        }
        store.stats.bytes_stored.store(stored, Ordering::Relaxed);
        debug!(root = %store.root.display(), bytes = stored, "Opened file mirror");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> &FileStoreStats {
        &self.stats
    }

    /// Path of the file holding `key`.
    ///
    /// Two-level layout keeps directories small:
    /// `config_ui.theme` → `<root>/<shard>/config_ui.theme.entry`
    fn entry_path(&self, key: &str) -> PathBuf {
        let shard = format!("{:02x}", shard_of(key));
        self.root
            .join(shard)
            .join(format!("{}.{ENTRY_EXTENSION}", encode_key(key)))
    }

    fn entry_files(&self) -> CacheResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        let shards = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        for shard in shards {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXTENSION) {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }
}

impl MirrorStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let path = self.entry_path(key);
        match fs::read(&path) {
            Ok(data) => {
                self.stats.total_reads.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .total_bytes_read
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                Ok(Some(data))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> CacheResult<()> {
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let previous = self.entry_size(key)?.unwrap_or(0) as u64;
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, data)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        debug!(key, path = %path.display(), size = data.len(), "Wrote mirror entry");

        self.stats.total_writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.stats
            .bytes_stored
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        shrink(&self.stats.bytes_stored, previous);
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        let path = self.entry_path(key);
        let size = self.entry_size(key)?.unwrap_or(0) as u64;
        match fs::remove_file(&path) {
            Ok(()) => {
                shrink(&self.stats.bytes_stored, size);
                debug!(key, path = %path.display(), "Deleted mirror entry");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> CacheResult<Vec<String>> {
        let mut keys = Vec::new();
        for path in self.entry_files()? {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match decode_key(stem) {
                Some(key) => keys.push(key),
                None => warn!(path = %path.display(), "Skipping undecodable mirror file"),
            }
        }
        Ok(keys)
    }

    fn entry_size(&self, key: &str) -> CacheResult<Option<usize>> {
        match fs::metadata(self.entry_path(key)) {
            Ok(meta) => Ok(Some(meta.len() as usize)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn total_bytes(&self) -> CacheResult<usize> {
        Ok(self.stats.bytes_stored.load(Ordering::Relaxed) as usize)
    }
}

fn shrink(counter: &AtomicU64, by: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(by))
    });
}

/// FNV-1a over the key, folded to one byte.
fn shard_of(key: &str) -> u8 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    (hash ^ (hash >> 8) ^ (hash >> 16) ^ (hash >> 24)) as u8
}

/// Percent-encode everything outside `[A-Za-z0-9._-]` so any key maps to a
/// valid, reversible file name.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

//! config-cache-tier: Tiered configuration and asset cache.
//!
//! Resolves configuration keys and static assets through a hierarchy of
//! sources with different latency/durability tradeoffs:
//!   TTL store (process) → durable mirror (shared) → process memory → remote → defaults
//!
//! The [`engine::CacheEngine`] context object owns one context's view of the
//! cache. The binary exposes it over HTTP.

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod server;
pub mod storage;

pub use cache::{AssetPreloader, ConfigCache, GetOptions, SetOptions};
pub use engine::CacheEngine;
pub use error::{CacheError, CacheResult};

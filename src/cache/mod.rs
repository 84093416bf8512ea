//! Tiered configuration and asset caching.
//!
//! - [`ttl_store`]: in-process tier with volatility-class expiry
//! - [`mirror`]: durable tier shared across execution contexts
//! - [`compressor`]: zstd framing for large mirror payloads
//! - [`resolver`]: source chain walked on a miss
//! - [`defaults`]: the static default table ending every chain
//! - [`facade`]: [`ConfigCache`], the config entry point
//! - [`asset`]: asset requests, records and priorities
//! - [`preloader`]: [`AssetPreloader`], deduped and version-gated asset loads
//! - [`preload_queue`]: priority queue feeding background loads
//! - [`strategies`]: predictive candidate producers and the viewport trigger
//! - [`version`]: per-asset version table

pub mod asset;
pub mod compressor;
pub mod defaults;
pub mod facade;
pub mod mirror;
pub mod preload_queue;
pub mod preloader;
pub mod resolver;
pub mod strategies;
pub mod ttl_store;
pub mod version;

pub use facade::{ConfigCache, GetOptions, SetOptions};
pub use preloader::AssetPreloader;

//! Outbound I/O: remote settings and asset bytes.
//!
//! - [`http`]: reqwest-backed implementations of both traits
//! - [`retry`]: exponential backoff used by the asset preloader

pub mod http;
pub mod retry;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::asset::{AssetContent, AssetKind};
use crate::error::CacheResult;

pub use http::{HttpAssetFetcher, HttpRemoteSettings};
pub use retry::{retry_with_backoff, RetryPolicy};

/// The remote settings service.
#[async_trait]
pub trait RemoteSettings: Send + Sync {
    /// `Ok(None)` when the service has no value for `key`.
    async fn fetch(&self, key: &str) -> CacheResult<Option<Value>>;

    async fn push(&self, key: &str, value: &Value) -> CacheResult<()>;
}

/// Raw network access for asset content.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &str, kind: AssetKind) -> CacheResult<AssetContent>;
}

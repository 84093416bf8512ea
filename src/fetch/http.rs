//! HTTP implementations of the fetch seams.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use crate::cache::asset::{AssetContent, AssetKind};
use crate::error::{CacheError, CacheResult};
use crate::fetch::{AssetFetcher, RemoteSettings};

/// Settings service speaking `GET/PUT {base}/settings/{key}`.
///
/// Responses may be the bare value or an envelope `{"value": ...}`.
pub struct HttpRemoteSettings {
    client: Client,
    base_url: String,
}

impl HttpRemoteSettings {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> CacheResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/settings/{}", self.base_url, key)
    }
}

#[async_trait]
impl RemoteSettings for HttpRemoteSettings {
    async fn fetch(&self, key: &str) -> CacheResult<Option<Value>> {
        let url = self.url_for(key);
        let response = self.client.get(&url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CacheError::HttpStatus {
                url,
                status: response.status().as_u16(),
            });
        }

        let body: Value = response.json().await?;
        debug!(key, "Remote settings answered");
        Ok(match body {
            Value::Object(mut map) if map.contains_key("value") => map.remove("value"),
            other => Some(other),
        })
    }

    async fn push(&self, key: &str, value: &Value) -> CacheResult<()> {
        let url = self.url_for(key);
        let response = self
            .client
            .put(&url)
            .json(&json!({ "value": value }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CacheError::HttpStatus {
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Plain GET of asset URLs.
pub struct HttpAssetFetcher {
    client: Client,
}

impl HttpAssetFetcher {
    pub fn new(timeout: Duration) -> CacheResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, url: &str, kind: AssetKind) -> CacheResult<AssetContent> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(CacheError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let kind = match kind {
            AssetKind::Auto => {
                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                AssetKind::from_content_type(content_type)
            }
            explicit => explicit,
        };

        let content = match kind {
            AssetKind::Json => AssetContent::Json(response.json().await?),
            AssetKind::Text => AssetContent::Text(response.text().await?),
            AssetKind::Blob | AssetKind::Auto => AssetContent::Blob(response.bytes().await?),
        };
        Ok(content)
    }
}

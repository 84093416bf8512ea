//! Asset types shared by the preloader, its queue and the version gate.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Urgency of an asset load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Needed for the current render.
    Critical,
    /// Likely needed soon.
    #[default]
    Preload,
    /// Needed once it scrolls into view.
    Lazy,
}

impl Priority {
    /// Numeric urgency (lower = more urgent).
    pub fn level(&self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::Preload => 1,
            Priority::Lazy => 2,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::Preload => write!(f, "preload"),
            Priority::Lazy => write!(f, "lazy"),
        }
    }
}

/// How the fetched bytes should be interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// Decide from the response's content type.
    #[default]
    Auto,
    Blob,
    Text,
    Json,
}

impl AssetKind {
    pub fn from_content_type(content_type: &str) -> Self {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if mime == "application/json" || mime.ends_with("+json") {
            AssetKind::Json
        } else if mime.starts_with("text/")
            || mime == "application/javascript"
            || mime == "image/svg+xml"
        {
            AssetKind::Text
        } else {
            AssetKind::Blob
        }
    }
}

/// Loaded asset content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum AssetContent {
    Blob(Bytes),
    Text(String),
    Json(Value),
}

impl AssetContent {
    /// Approximate size in bytes.
    pub fn len(&self) -> usize {
        match self {
            AssetContent::Blob(b) => b.len(),
            AssetContent::Text(t) => t.len(),
            AssetContent::Json(v) => v.to_string().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A cached asset with the version it was loaded at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub url: String,
    pub priority: Priority,
    pub version: String,
    pub content: AssetContent,
    /// Epoch milliseconds.
    pub loaded_at: u64,
}

/// A request to have an asset loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetRequest {
    pub url: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub kind: AssetKind,
}

impl AssetRequest {
    pub fn new(url: impl Into<String>, priority: Priority) -> Self {
        Self {
            url: url.into(),
            priority,
            kind: AssetKind::Auto,
        }
    }

    pub fn with_kind(mut self, kind: AssetKind) -> Self {
        self.kind = kind;
        self
    }
}

//! Version gate: decides whether a cached asset is still current.
//!
//! Every asset carries the version it was loaded at. Unknown URLs default to
//! the build version; explicit per-URL overrides take precedence. Staleness
//! is checked lazily on read, there is no background sweep.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::cache::asset::AssetRecord;
use crate::config::VersionConfig;

#[derive(Debug)]
pub struct VersionGate {
    build_version: String,
    overrides: RwLock<HashMap<String, String>>,
}

impl VersionGate {
    pub fn new(build_version: impl Into<String>, overrides: HashMap<String, String>) -> Self {
        Self {
            build_version: build_version.into(),
            overrides: RwLock::new(overrides),
        }
    }

    pub fn from_config(config: &VersionConfig) -> Self {
        Self::new(config.build_version.clone(), config.overrides.clone())
    }

    /// The version an asset loaded now would be tagged with.
    pub fn current_version(&self, url: &str) -> String {
        self.overrides
            .read()
            .get(url)
            .cloned()
            .unwrap_or_else(|| self.build_version.clone())
    }

    pub fn is_valid(&self, record: &AssetRecord) -> bool {
        record.version == self.current_version(&record.url)
    }

    /// Pin `url` to `version`. Records loaded at any other version go stale.
    pub fn set_version(&self, url: impl Into<String>, version: impl Into<String>) {
        self.overrides.write().insert(url.into(), version.into());
    }

    /// Drop the override; `url` follows the build version again.
    pub fn clear_version(&self, url: &str) -> Option<String> {
        self.overrides.write().remove(url)
    }

    pub fn build_version(&self) -> &str {
        &self.build_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::asset::{AssetContent, Priority};

    fn record(url: &str, version: &str) -> AssetRecord {
        AssetRecord {
            url: url.to_string(),
            priority: Priority::Preload,
            version: version.to_string(),
            content: AssetContent::Text("body{}".to_string()),
            loaded_at: 0,
        }
    }

    #[test]
    fn test_unknown_url_uses_build_version() {
        let gate = VersionGate::new("2.0.0", HashMap::new());
        assert_eq!(gate.current_version("/css/app.css"), "2.0.0");
        assert!(gate.is_valid(&record("/css/app.css", "2.0.0")));
        assert!(!gate.is_valid(&record("/css/app.css", "1.9.0")));
    }

    #[test]
    fn test_override_takes_precedence() {
        let gate = VersionGate::new("2.0.0", HashMap::new());
        gate.set_version("/js/chat.js", "v2");

        assert!(!gate.is_valid(&record("/js/chat.js", "2.0.0")));
        assert!(gate.is_valid(&record("/js/chat.js", "v2")));

        assert_eq!(gate.clear_version("/js/chat.js"), Some("v2".to_string()));
        assert_eq!(gate.current_version("/js/chat.js"), "2.0.0");
    }
}

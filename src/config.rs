//! Runtime configuration for config-cache-tier.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All tier-related knobs (mirror quota, remote bounds, retry policy, preload
//! heuristics) live here. The TTLs of the two volatility classes are constants
//! in `cache::ttl_store`, not configuration.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "config-cache-tier", about = "Tiered configuration and asset cache service")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides `server.listen`).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Durable mirror settings.
    pub mirror: MirrorConfig,

    /// Remote settings endpoint.
    pub remote: RemoteConfig,

    /// Asset fetch settings.
    pub assets: AssetConfig,

    /// Predictive preloading settings.
    pub preload: PreloadConfig,

    /// Asset version table.
    pub versions: VersionConfig,

    /// Telemetry settings.
    pub telemetry: TelemetryConfig,

    /// Security-related defaults exposed through the default table.
    pub security: SecurityConfig,

    /// Host/protocol signals used to derive environment-specific defaults.
    pub environment: EnvironmentConfig,

    /// Process-injected configuration values (the `ProcessMemory` source).
    pub injected: HashMap<String, Value>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Which backend the durable mirror persists into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorBackend {
    /// One file per key under `mirror.path`.
    File,
    /// Process memory only (does not survive restart).
    Memory,
    /// Storage disabled: reads miss, writes fail.
    Disabled,
}

/// Durable mirror settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub backend: MirrorBackend,

    /// Root directory for the file backend.
    pub path: PathBuf,

    /// Maximum total bytes the mirror may hold.
    pub quota_bytes: usize,

    /// Compress large payloads with zstd.
    pub zstd_compression: bool,

    /// Payloads above this size are compressed.
    pub compress_threshold_bytes: usize,

    /// zstd compression level (1-22).
    pub zstd_level: i32,

    /// Capacity of the cross-context change channel.
    pub bus_capacity: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            backend: MirrorBackend::File,
            path: PathBuf::from("/tmp/config-cache"),
            quota_bytes: 5 * 1024 * 1024, // 5 MB
            zstd_compression: true,
            compress_threshold_bytes: 4096,
            zstd_level: 3,
            bus_capacity: 256,
        }
    }
}

/// Remote settings endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Include the remote source in the default chain.
    pub enabled: bool,

    /// Base URL of the settings service. No remote client is built without it.
    pub base_url: Option<String>,

    /// Bound on a single remote fetch.
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: None,
            timeout_ms: 5_000,
        }
    }
}

/// Asset fetch and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    /// Bound on a single asset fetch attempt.
    pub fetch_timeout_ms: u64,

    /// Attempts before an asset counts as failed.
    pub retry_attempts: u32,

    /// First backoff delay.
    pub retry_base_delay_ms: u64,

    /// Backoff multiplier.
    pub retry_factor: u32,

    /// Maximum assets fetched per queue batch.
    pub max_concurrent: usize,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 10_000,
            retry_attempts: 3,
            retry_base_delay_ms: 1_000,
            retry_factor: 2,
            max_concurrent: 4,
        }
    }
}

/// Predictive preloading settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
    /// Assets loaded as `Critical` when the engine starts.
    pub critical: Vec<String>,

    /// Page → assets needed to render it.
    pub route_assets: HashMap<String, Vec<String>>,

    /// Role → assets that role usually needs.
    pub role_assets: HashMap<String, Vec<String>>,

    /// Day band ("morning", "afternoon", "evening", "night") → assets.
    pub time_bands: HashMap<String, Vec<String>>,

    /// How many next pages the navigation strategy predicts.
    pub max_predictions: usize,

    /// Maximum queued candidates.
    pub queue_capacity: usize,

    /// Viewport distance (px) at which lazy assets are triggered.
    pub viewport_margin_px: f64,

    /// Offset applied to UTC when computing the hour of day.
    pub utc_offset_hours: i32,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        let mut role_assets = HashMap::new();
        role_assets.insert(
            "instructor".to_string(),
            vec!["/static/js/dashboard.js".to_string(), "/static/js/analytics.js".to_string()],
        );
        role_assets.insert(
            "student".to_string(),
            vec!["/static/js/chat.js".to_string()],
        );
        role_assets.insert(
            "admin".to_string(),
            vec!["/static/js/admin.js".to_string(), "/static/js/analytics.js".to_string()],
        );

        Self {
            critical: Vec::new(),
            route_assets: HashMap::new(),
            role_assets,
            time_bands: HashMap::new(),
            max_predictions: 3,
            queue_capacity: 256,
            viewport_margin_px: 50.0,
            utc_offset_hours: 0,
        }
    }
}

/// Asset version table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionConfig {
    /// Version assigned to every asset without an override.
    pub build_version: String,

    /// Per-URL overrides.
    pub overrides: HashMap<String, String>,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            build_version: env!("CARGO_PKG_VERSION").to_string(),
            overrides: HashMap::new(),
        }
    }
}

/// Telemetry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Performance samples kept in the ring buffer.
    pub sample_capacity: usize,

    /// Interval of the periodic stats log line (0 disables it).
    pub log_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            sample_capacity: 100,
            log_interval_secs: 60,
        }
    }
}

/// Session lifetimes surfaced as `security.*` defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub session_timeout_ms: u64,
    pub max_session_duration_ms: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: 30 * 60 * 1000,          // 30 minutes
            max_session_duration_ms: 8 * 60 * 60 * 1000, // 8 hours
        }
    }
}

/// Host/protocol the deployment is served from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub host: String,
    pub protocol: String,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            protocol: "http".to_string(),
        }
    }
}

impl EnvironmentConfig {
    /// Apply `APP_HOST` / `APP_PROTOCOL` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("APP_HOST") {
            self.host = host;
        }
        if let Ok(protocol) = std::env::var("APP_PROTOCOL") {
            self.protocol = protocol.trim_end_matches(':').to_string();
        }
    }

    /// Whether this is a local development deployment.
    pub fn is_local(&self) -> bool {
        let host = self.host.split(':').next().unwrap_or_default();
        matches!(host, "localhost" | "127.0.0.1" | "0.0.0.0")
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.environment.apply_env_overrides();
        Ok(config)
    }

    /// A configuration suited for tests: memory mirror, no remote, fast retries.
    pub fn in_memory() -> Self {
        let mut config = Config::default();
        config.mirror.backend = MirrorBackend::Memory;
        config.assets.retry_base_delay_ms = 1;
        config.telemetry.log_interval_secs = 0;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.remote.timeout_ms, 5_000);
        assert!(!cfg.remote.enabled);
        assert_eq!(cfg.assets.fetch_timeout_ms, 10_000);
        assert_eq!(cfg.assets.retry_attempts, 3);
        assert_eq!(cfg.telemetry.sample_capacity, 100);
        assert_eq!(cfg.security.session_timeout_ms, 1_800_000);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{ "remote": { "enabled": true }, "mirror": { "backend": "memory" } }"#,
        )
        .unwrap();
        assert!(cfg.remote.enabled);
        assert_eq!(cfg.remote.timeout_ms, 5_000);
        assert_eq!(cfg.mirror.backend, MirrorBackend::Memory);
        assert_eq!(cfg.mirror.quota_bytes, 5 * 1024 * 1024);
    }

    #[test]
    fn test_local_environment_detection() {
        let mut env = EnvironmentConfig::default();
        assert!(env.is_local());
        env.host = "127.0.0.1:3000".to_string();
        assert!(env.is_local());
        env.host = "learn.example.edu".to_string();
        assert!(!env.is_local());
    }
}

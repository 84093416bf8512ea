//! Static default table: the last link of every source chain.
//!
//! A closed mapping from known keys to literal values. Unknown keys have no
//! default, which is a valid answer. Environment-dependent entries (base
//! URLs) are computed from host/protocol signals on every lookup rather than
//! hard-coded, so one build serves dev, staging and production.

use serde_json::{json, Value};

use crate::cache::ttl_store::{STATIC_TTL_MS, VOLATILE_TTL_MS};
use crate::config::{EnvironmentConfig, SecurityConfig};

/// Keys with a fixed literal default.
const STATIC_KEYS: &[&str] = &[
    "api.timeout",
    "api.retryAttempts",
    "api.retryDelay",
    "ui.theme",
    "ui.language",
    "ui.animationsEnabled",
    "ui.sidebarCollapsed",
    "ui.pageSize",
    "chat.maxMessageLength",
    "chat.historyLimit",
    "chat.streamingEnabled",
    "features.analytics",
    "features.onboarding",
    "features.aiAssistant",
    "features.darkMode",
    "features.experimental",
    "cache.volatileTtl",
    "cache.staticTtl",
];

fn static_default(key: &str) -> Option<Value> {
    let value = match key {
        "api.timeout" => json!(30_000),
        "api.retryAttempts" => json!(3),
        "api.retryDelay" => json!(1_000),
        "ui.theme" => json!("light"),
        "ui.language" => json!("en"),
        "ui.animationsEnabled" => json!(true),
        "ui.sidebarCollapsed" => json!(false),
        "ui.pageSize" => json!(20),
        "chat.maxMessageLength" => json!(4_000),
        "chat.historyLimit" => json!(50),
        "chat.streamingEnabled" => json!(true),
        "features.analytics" => json!(true),
        "features.onboarding" => json!(true),
        "features.aiAssistant" => json!(true),
        "features.darkMode" => json!(true),
        "features.experimental" => json!(false),
        "cache.volatileTtl" => json!(VOLATILE_TTL_MS),
        "cache.staticTtl" => json!(STATIC_TTL_MS),
        _ => return None,
    };
    Some(value)
}

/// Keys computed from the environment or operator configuration.
const DERIVED_KEYS: &[&str] = &[
    "api.baseUrl",
    "api.wsUrl",
    "security.sessionTimeout",
    "security.maxSessionDuration",
];

#[derive(Debug, Clone)]
pub struct DefaultTable {
    environment: EnvironmentConfig,
    security: SecurityConfig,
}

impl DefaultTable {
    pub fn new(environment: EnvironmentConfig, security: SecurityConfig) -> Self {
        Self {
            environment,
            security,
        }
    }

    /// Default for `key`, `None` when the table has no entry.
    pub fn get(&self, key: &str) -> Option<Value> {
        match key {
            "api.baseUrl" => Some(json!(self.api_base_url())),
            "api.wsUrl" => Some(json!(self.ws_url())),
            "security.sessionTimeout" => Some(json!(self.security.session_timeout_ms)),
            "security.maxSessionDuration" => Some(json!(self.security.max_session_duration_ms)),
            _ => static_default(key),
        }
    }

    /// Every key the table answers.
    pub fn keys(&self) -> Vec<&'static str> {
        STATIC_KEYS
            .iter()
            .copied()
            .chain(DERIVED_KEYS.iter().copied())
            .collect()
    }

    /// Base URL of the backend API for the current environment.
    pub fn api_base_url(&self) -> String {
        if self.environment.is_local() {
            "http://localhost:8000".to_string()
        } else {
            format!("{}://{}/api", self.environment.protocol, self.environment.host)
        }
    }

    /// Websocket endpoint for the current environment.
    pub fn ws_url(&self) -> String {
        if self.environment.is_local() {
            "ws://localhost:8000/ws".to_string()
        } else {
            let scheme = if self.environment.protocol == "https" { "wss" } else { "ws" };
            format!("{scheme}://{}/ws", self.environment.host)
        }
    }
}

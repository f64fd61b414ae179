//! Realtime connection configuration
//!
//! Defaults match the production backend: 10 attempts, 1s base, 30s cap,
//! 20s handshake timeout. Values can come from a TOML file, from
//! `REALTIME_*` environment variables, or both.

use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::backoff::BackoffPolicy;

/// Event names forwarded under their own name (everything else is `custom_event`)
pub const DEFAULT_KNOWN_EVENTS: &[&str] = &[
    "ai_progress",
    "msgprint",
    "eval_js",
    "new_comment",
    "intent_classified",
    "privacy_filter",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Reconnection attempts before giving up
    pub max_reconnect_attempts: u32,
    pub base_reconnect_interval_ms: u64,
    pub max_reconnect_interval_ms: u64,

    /// Fixed handshake timeout, independent of the backoff schedule
    pub handshake_timeout_ms: u64,

    /// Cookie that carries the session identifier
    pub session_cookie: String,
    /// Socket.IO mount path on the endpoint
    pub socket_path: String,

    pub known_events: Vec<String>,

    /// Reconnect after a disconnect whose reason is not recognised
    pub retry_unknown_disconnects: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 10,
            base_reconnect_interval_ms: 1_000,
            max_reconnect_interval_ms: 30_000,
            handshake_timeout_ms: 20_000,
            session_cookie: "sid".to_string(),
            socket_path: "/socket.io".to_string(),
            known_events: DEFAULT_KNOWN_EVENTS.iter().map(|s| s.to_string()).collect(),
            retry_unknown_disconnects: true,
        }
    }
}

impl RealtimeConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read realtime config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse realtime config {}", path.display()))?;
        Ok(config)
    }

    /// Defaults overridden by environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Override fields from `REALTIME_*` environment variables.
    ///
    /// Unparseable or zero numeric values keep the current value.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_positive("REALTIME_MAX_RECONNECT_ATTEMPTS") {
            self.max_reconnect_attempts = v as u32;
        }
        if let Some(v) = env_positive("REALTIME_RECONNECT_INTERVAL_MS") {
            self.base_reconnect_interval_ms = v;
        }
        if let Some(v) = env_positive("REALTIME_MAX_RECONNECT_INTERVAL_MS") {
            self.max_reconnect_interval_ms = v;
        }
        if let Some(v) = env_positive("REALTIME_HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout_ms = v;
        }
        if let Ok(v) = std::env::var("REALTIME_SESSION_COOKIE") {
            if !v.trim().is_empty() {
                self.session_cookie = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("REALTIME_SOCKET_PATH") {
            if !v.trim().is_empty() {
                self.socket_path = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("REALTIME_RETRY_UNKNOWN_DISCONNECTS") {
            self.retry_unknown_disconnects = matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON");
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::from_millis(self.base_reconnect_interval_ms, self.max_reconnect_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn env_positive(var: &str) -> Option<u64> {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&v| v > 0)
}

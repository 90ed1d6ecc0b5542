//! Relay configuration loaded from environment variables.
//!
//! All settings have defaults so the relay can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::time::Duration;

use snails_shared::constants::{
    AUTH_MAX_ATTEMPTS, AUTH_WINDOW_SECS, DEFAULT_RELAY_PORT, HEARTBEAT_SECS,
    MAX_GRAPH_MESSAGE_SIZE,
};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Socket address for HTTP and the graph WebSocket.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8765`
    pub http_addr: SocketAddr,

    /// Where graph nodes are persisted: a SQLite file path, `:memory:`, or
    /// `data-dir` for the platform data directory.
    /// Env: `GRAPH_STORE`
    /// Default: `data.db`
    pub graph_store: String,

    /// Interval between heartbeat pings.
    /// Env: `HEARTBEAT_SECS`
    /// Default: 30 s
    pub heartbeat_interval: Duration,

    /// Sliding window of the signature verification limiter.
    /// Env: `AUTH_WINDOW_SECS`
    /// Default: 300 s
    pub auth_window: Duration,

    /// Verification attempts allowed per address inside one window.
    /// Env: `AUTH_MAX_ATTEMPTS`
    /// Default: 5
    pub auth_max_attempts: usize,

    /// Inbound graph frames larger than this are dropped.
    /// Env: `MAX_MESSAGE_BYTES`
    /// Default: 10 MiB
    pub max_message_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_RELAY_PORT).into(),
            graph_store: "data.db".to_string(),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_SECS),
            auth_window: Duration::from_secs(AUTH_WINDOW_SECS),
            auth_max_attempts: AUTH_MAX_ATTEMPTS,
            max_message_bytes: MAX_GRAPH_MESSAGE_SIZE,
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(store) = lookup("GRAPH_STORE") {
            if !store.is_empty() {
                config.graph_store = store;
            }
        }

        if let Some(secs) = parse_number::<u64>(&lookup, "HEARTBEAT_SECS") {
            if secs > 0 {
                config.heartbeat_interval = Duration::from_secs(secs);
            }
        }

        if let Some(secs) = parse_number::<u64>(&lookup, "AUTH_WINDOW_SECS") {
            config.auth_window = Duration::from_secs(secs);
        }

        if let Some(n) = parse_number::<usize>(&lookup, "AUTH_MAX_ATTEMPTS") {
            config.auth_max_attempts = n;
        }

        if let Some(n) = parse_number::<usize>(&lookup, "MAX_MESSAGE_BYTES") {
            config.max_message_bytes = n;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring non-numeric setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8765).into());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.auth_max_attempts, 5);
        assert_eq!(config.auth_window, Duration::from_secs(300));
    }

    #[test]
    fn test_overrides() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("GRAPH_STORE", ":memory:"),
            ("HEARTBEAT_SECS", "5"),
            ("AUTH_MAX_ATTEMPTS", "2"),
        ]));
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.graph_store, ":memory:");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.auth_max_attempts, 2);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            ("HTTP_ADDR", "not an address"),
            ("HEARTBEAT_SECS", "soon"),
            ("MAX_MESSAGE_BYTES", "-1"),
        ]));
        let default = RelayConfig::default();
        assert_eq!(config.http_addr, default.http_addr);
        assert_eq!(config.heartbeat_interval, default.heartbeat_interval);
        assert_eq!(config.max_message_bytes, default.max_message_bytes);
    }
}

//! Client configuration.
//!
//! Every setting has a default matching the public SNAILS. deployment; the
//! endpoints can be overridden from the environment.

use std::time::Duration;

use snails_shared::constants::{CHAIN_ID, DEFAULT_RELAY_URL, PEER_GRACE_MS, PROBE_TIMEOUT_MS};

pub const DEFAULT_LCD_URL: &str = "https://rest.stargaze-apis.com";

pub const DEFAULT_COLLECTION_CONTRACT: &str =
    "stars1sryvfl50ep8u450u27qj7fgularqfxycwqhdp057260lvuhpkfvs28fag0";

pub const DEFAULT_GRAPHQL_ENDPOINTS: &[&str] = &[
    "https://graphql.mainnet.stargaze-apis.com/graphql",
    "https://constellations-api.mainnet.stargaze-apis.com/graphql",
];

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Graph socket of the relay.
    /// Env: `SNAILS_RELAY_URL`
    pub relay_url: String,

    pub chain_id: String,

    /// Budget for the WebSocket reachability probe.
    pub probe_timeout: Duration,

    /// Budget for the put-then-get round trip after a peer says hello.
    pub self_test_timeout: Duration,

    /// How long a peer may be gone before the status drops to red.
    pub peer_grace: Duration,

    /// Interval of the background reachability probe.
    pub reprobe_interval: Duration,

    /// How long a put waits for the relay's ack, or a get for its reply.
    pub request_timeout: Duration,

    /// Cosmos LCD REST endpoint for contract queries.
    /// Env: `SNAILS_LCD_URL`
    pub lcd_url: String,

    pub collection_contract: String,

    pub collection_poll_interval: Duration,

    /// GraphQL endpoints tried in order by the API status monitor.
    /// Env: `SNAILS_GRAPHQL_URLS` (comma separated)
    pub graphql_endpoints: Vec<String>,

    pub status_poll_interval: Duration,

    /// Failures tolerated on one endpoint before failing over.
    pub status_max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            chain_id: CHAIN_ID.to_string(),
            probe_timeout: Duration::from_millis(PROBE_TIMEOUT_MS),
            self_test_timeout: Duration::from_millis(PROBE_TIMEOUT_MS),
            peer_grace: Duration::from_millis(PEER_GRACE_MS),
            reprobe_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            lcd_url: DEFAULT_LCD_URL.to_string(),
            collection_contract: DEFAULT_COLLECTION_CONTRACT.to_string(),
            collection_poll_interval: Duration::from_secs(5),
            graphql_endpoints: DEFAULT_GRAPHQL_ENDPOINTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            status_poll_interval: Duration::from_secs(5),
            status_max_retries: 3,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("SNAILS_RELAY_URL").filter(|s| !s.trim().is_empty()) {
            config.relay_url = url.trim().to_string();
        }

        if let Some(url) = lookup("SNAILS_LCD_URL").filter(|s| !s.trim().is_empty()) {
            config.lcd_url = url.trim().trim_end_matches('/').to_string();
        }

        if let Some(urls) = lookup("SNAILS_GRAPHQL_URLS") {
            let endpoints: Vec<String> = urls
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if endpoints.is_empty() {
                tracing::warn!("SNAILS_GRAPHQL_URLS is empty, keeping defaults");
            } else {
                config.graphql_endpoints = endpoints;
            }
        }

        config
    }
}

/// Application name
pub const APP_NAME: &str = "SNAILS.";

/// Chain every permit is signed against
pub const CHAIN_ID: &str = "stargaze-1";

/// Bech32 prefix of wallet addresses on that chain
pub const ADDRESS_PREFIX: &str = "stars";

/// Default relay port (HTTP + WebSocket)
pub const DEFAULT_RELAY_PORT: u16 = 8765;

/// Path of the graph WebSocket endpoint on the relay
pub const GRAPH_WS_PATH: &str = "/gun";

/// Default relay URL a client dials
pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8765/gun";

/// How long a signed permit stays in the client cache (1 hour)
pub const PERMIT_TTL_SECS: u64 = 60 * 60;

/// Interval of the permit cache expiry sweep
pub const PERMIT_SWEEP_SECS: u64 = 60;

/// Timeout for the WebSocket reachability probe and the round-trip self-test
pub const PROBE_TIMEOUT_MS: u64 = 2_000;

/// Grace period after a peer leaves before the status is re-evaluated
pub const PEER_GRACE_MS: u64 = 2_000;

/// Relay heartbeat interval
pub const HEARTBEAT_SECS: u64 = 30;

/// Sliding window of the relay's signature verification rate limiter
pub const AUTH_WINDOW_SECS: u64 = 5 * 60;

/// Attempts allowed per address inside one window
pub const AUTH_MAX_ATTEMPTS: usize = 5;

/// Inbound graph frames above this size are dropped (10 MiB)
pub const MAX_GRAPH_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Hard WebSocket payload limit (50 MiB)
pub const MAX_WS_PAYLOAD: usize = 50 * 1024 * 1024;

/// Field states further than this in the future are rejected by the merge (10 minutes)
pub const MAX_CLOCK_DRIFT_MS: f64 = 10.0 * 60.0 * 1000.0;

/// Root soul of the social counters used for content ranking
pub const SOCIAL_ROOT: &str = "snails-social";

/// Key of the metadata object inside a node on the wire
pub const META_KEY: &str = "_";

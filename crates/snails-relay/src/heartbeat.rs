use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connections::Connections;
use crate::rate_limit::AuthRateLimiter;

/// Ping every socket each `interval`; sockets that missed the previous ping
/// are terminated. Idle rate-limit windows are purged on the same tick.
pub fn spawn_heartbeat(
    connections: Connections,
    limiter: AuthRateLimiter,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = connections.heartbeat();
            if !report.terminated.is_empty() {
                info!(terminated = report.terminated.len(), "Dropped unresponsive sockets");
            }
            debug!(pinged = report.pinged, peers = connections.peer_count(), "Heartbeat");
            limiter.purge_stale().await;
        }
    })
}

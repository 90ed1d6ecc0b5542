//! # snails-relay
//!
//! Graph relay for SNAILS. clients.
//!
//! One process serves:
//! - **`/gun`**: the graph WebSocket. Writes are merged into the store and
//!   fanned out to every other socket; reads are answered from the store.
//! - **`/health`**: peer and socket counts, uptime and memory usage.
//! - **`/auth/verify`**: ADR-36 wallet signature check, rate limited per
//!   address.
//!
//! A heartbeat pings every socket and drops the ones that stop answering.

pub mod api;
pub mod auth;
pub mod config;
pub mod connections;
pub mod error;
pub mod heartbeat;
pub mod rate_limit;
pub mod socket;

use std::future::Future;

use tracing::info;

use snails_store::Database;

pub use api::{build_router, AppState};
pub use config::RelayConfig;
pub use error::ServerError;

/// Close code sent to every socket when the relay stops.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Open the store, start the heartbeat and serve until `shutdown` resolves.
///
/// On shutdown the heartbeat stops first, then every socket receives a
/// normal-closure frame before the listener goes away.
pub async fn run<F>(config: RelayConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    info!(addr = %listener.local_addr()?, "Starting HTTP and graph socket server");
    run_on(listener, config, shutdown).await
}

/// Same as [`run`] on an already bound listener.
pub async fn run_on<F>(
    listener: tokio::net::TcpListener,
    config: RelayConfig,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let store = Database::open(&config.graph_store)?;
    let state = AppState::new(config, store);

    let heartbeat = heartbeat::spawn_heartbeat(
        state.connections.clone(),
        state.auth_limiter.clone(),
        state.config.heartbeat_interval,
    );

    let connections = state.connections.clone();
    let graceful = async move {
        shutdown.await;
        heartbeat.abort();
        let closed = connections.close_all(NORMAL_CLOSURE, "relay shutting down");
        info!(closed, "Closed graph sockets");
    };

    api::serve_on(listener, state, graceful).await?;
    info!("Relay stopped");
    Ok(())
}

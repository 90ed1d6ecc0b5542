use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use axum::{
    extract::State,
    http::Method,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use snails_shared::constants::GRAPH_WS_PATH;
use snails_store::Database;

use crate::auth::verify_signature;
use crate::config::RelayConfig;
use crate::connections::Connections;
use crate::rate_limit::AuthRateLimiter;
use crate::socket::graph_socket;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub store: Arc<Mutex<Database>>,
    pub connections: Connections,
    pub auth_limiter: AuthRateLimiter,
    pub started_at: Instant,
    /// Peer id this relay announces in its own hello frame.
    pub relay_id: String,
}

impl AppState {
    pub fn new(config: RelayConfig, store: Database) -> Self {
        let auth_limiter = AuthRateLimiter::new(config.auth_window, config.auth_max_attempts);
        Self {
            config: Arc::new(config),
            store: Arc::new(Mutex::new(store)),
            connections: Connections::new(),
            auth_limiter,
            started_at: Instant::now(),
            relay_id: format!("relay-{}", uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn store(&self) -> MutexGuard<'_, Database> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route(GRAPH_WS_PATH, get(graph_socket))
        .route("/auth/verify", post(verify_signature))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    peer_count: usize,
    /// Seconds since the relay started.
    uptime: f64,
    /// Resident set size in bytes, 0 where the platform does not expose it.
    memory_usage: u64,
    ws_connections: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        peer_count: state.connections.peer_count(),
        uptime: state.started_at.elapsed().as_secs_f64(),
        memory_usage: resident_memory_bytes(),
        ws_connections: state.connections.socket_count(),
    })
}

/// Read `VmRSS` from `/proc/self/status`.
fn resident_memory_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_vm_rss(&status))
        .unwrap_or(0)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kib * 1024)
}

/// Serve the router until `shutdown` resolves.
pub async fn serve_on<F>(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState::new(RelayConfig::default(), Database::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let state = test_state();
        let (id, _rx) = state.connections.open(([127, 0, 0, 1], 5000).into());
        state.connections.hello(id, "peer-a", None);

        let response = build_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["peerCount"], 1);
        assert_eq!(json["wsConnections"], 1);
        assert!(json["uptime"].as_f64().unwrap() >= 0.0);
        assert!(json["memoryUsage"].as_u64().is_some());
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let response = build_router(test_state())
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/health")
                    .header("origin", "http://localhost:5173")
                    .header("access-control-request-method", "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "*"
        );
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tsnails-relay\nVmPeak:\t  9000 kB\nVmRSS:\t  2048 kB\n";
        assert_eq!(parse_vm_rss(status), Some(2048 * 1024));
        assert_eq!(parse_vm_rss("Name:\tx\n"), None);
    }
}

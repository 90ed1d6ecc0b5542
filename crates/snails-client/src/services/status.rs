//! Reachability of the Stargaze GraphQL API.
//!
//! Each check asks the current endpoint for the latest block height. A few
//! failures in a row keep the light yellow; once the retries are used up the
//! monitor moves to the next endpoint, and turns red when none is left.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use snails_shared::ConnectionStatus;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

const LATEST_BLOCK_QUERY: &str =
    "{ blocks(first: 1) { edges { node { blockHeight } } pageInfo { hasNextPage endCursor } } }";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiStatus {
    pub status: ConnectionStatus,
    pub endpoint: Option<String>,
}

#[derive(Debug, Default)]
struct Cursor {
    endpoint: usize,
    retries: u32,
}

pub struct ApiStatusMonitor {
    client: reqwest::Client,
    endpoints: Vec<String>,
    max_retries: u32,
    cursor: Mutex<Cursor>,
    status: watch::Sender<ApiStatus>,
}

impl ApiStatusMonitor {
    pub fn new(endpoints: Vec<String>, max_retries: u32, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let (status, _) = watch::channel(ApiStatus {
            status: ConnectionStatus::Red,
            endpoint: endpoints.first().cloned(),
        });
        Ok(Self {
            client,
            endpoints,
            max_retries,
            cursor: Mutex::new(Cursor::default()),
            status,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::new(
            config.graphql_endpoints.clone(),
            config.status_max_retries,
            config.request_timeout,
        )
    }

    pub fn status(&self) -> ApiStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ApiStatus> {
        self.status.subscribe()
    }

    fn current_endpoint(&self) -> Option<String> {
        let cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        self.endpoints.get(cursor.endpoint).cloned()
    }

    /// Run one check and publish the resulting status.
    pub async fn check(&self) -> ConnectionStatus {
        let Some(endpoint) = self.current_endpoint() else {
            self.publish(ConnectionStatus::Red, None);
            return ConnectionStatus::Red;
        };

        let outcome = latest_block_height(&self.client, &endpoint).await;

        let (status, endpoint) = {
            let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
            let status = match outcome {
                Ok(height) => {
                    debug!(endpoint = %endpoint, height = %height, "Stargaze API reachable");
                    cursor.retries = 0;
                    ConnectionStatus::Green
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Stargaze API check failed");
                    if cursor.retries < self.max_retries {
                        cursor.retries += 1;
                        ConnectionStatus::Yellow
                    } else if cursor.endpoint + 1 < self.endpoints.len() {
                        cursor.endpoint += 1;
                        cursor.retries = 0;
                        info!(endpoint = %self.endpoints[cursor.endpoint], "Switching to fallback endpoint");
                        ConnectionStatus::Yellow
                    } else {
                        warn!("All Stargaze API endpoints failed");
                        ConnectionStatus::Red
                    }
                }
            };
            (status, self.endpoints.get(cursor.endpoint).cloned())
        };

        self.publish(status, endpoint);
        status
    }

    fn publish(&self, status: ConnectionStatus, endpoint: Option<String>) {
        let next = ApiStatus { status, endpoint };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Check every `period` until the handle is aborted.
    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                self.check().await;
            }
        })
    }
}

async fn latest_block_height(client: &reqwest::Client, endpoint: &str) -> Result<Value> {
    let body: Value = client
        .post(endpoint)
        .header("Accept", "application/json")
        .json(&json!({ "query": LATEST_BLOCK_QUERY }))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if let Some(errors) = body.get("errors") {
        return Err(ClientError::Query(format!("GraphQL errors: {errors}")));
    }

    body.pointer("/data/blocks/edges/0/node/blockHeight")
        .filter(|height| !height.is_null())
        .cloned()
        .ok_or_else(|| ClientError::Query("no block height in response".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn block_reply() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "data": { "blocks": { "edges": [{ "node": { "blockHeight": "14500000" } }] } }
        }))
    }

    async fn mount(server: &MockServer, route: &str, response: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(path(route))
            .respond_with(response)
            .mount(server)
            .await;
    }

    fn monitor(endpoints: Vec<String>) -> ApiStatusMonitor {
        ApiStatusMonitor::new(endpoints, 3, Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn healthy_endpoint_is_green() {
        let server = MockServer::start().await;
        mount(&server, "/graphql", block_reply()).await;

        let monitor = monitor(vec![format!("{}/graphql", server.uri())]);
        assert_eq!(monitor.status().status, ConnectionStatus::Red);
        assert_eq!(monitor.check().await, ConnectionStatus::Green);
    }

    #[tokio::test]
    async fn fails_over_after_retries() {
        let server = MockServer::start().await;
        mount(&server, "/primary", ResponseTemplate::new(502)).await;
        mount(&server, "/fallback", block_reply()).await;

        let fallback = format!("{}/fallback", server.uri());
        let monitor = monitor(vec![format!("{}/primary", server.uri()), fallback.clone()]);

        for _ in 0..3 {
            assert_eq!(monitor.check().await, ConnectionStatus::Yellow);
            assert_ne!(monitor.status().endpoint.as_deref(), Some(fallback.as_str()));
        }
        assert_eq!(monitor.check().await, ConnectionStatus::Yellow);
        assert_eq!(monitor.status().endpoint.as_deref(), Some(fallback.as_str()));

        assert_eq!(monitor.check().await, ConnectionStatus::Green);
    }

    #[tokio::test]
    async fn graphql_errors_count_as_failure() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/graphql",
            ResponseTemplate::new(200).set_body_json(json!({ "errors": [{ "message": "boom" }] })),
        )
        .await;

        let monitor = monitor(vec![format!("{}/graphql", server.uri())]);
        for _ in 0..3 {
            assert_eq!(monitor.check().await, ConnectionStatus::Yellow);
        }
        assert_eq!(monitor.check().await, ConnectionStatus::Red);
    }

    #[tokio::test]
    async fn recovers_from_red() {
        let server = MockServer::start().await;
        mount(&server, "/graphql", ResponseTemplate::new(200).set_body_json(json!({ "data": {} }))).await;

        let monitor = monitor(vec![format!("{}/graphql", server.uri())]);
        for _ in 0..4 {
            monitor.check().await;
        }
        assert_eq!(monitor.status().status, ConnectionStatus::Red);

        server.reset().await;
        mount(&server, "/graphql", block_reply()).await;
        assert_eq!(monitor.check().await, ConnectionStatus::Green);
    }

    #[tokio::test]
    async fn no_endpoints_is_red() {
        let monitor = monitor(Vec::new());
        assert_eq!(monitor.check().await, ConnectionStatus::Red);
        assert_eq!(monitor.status().endpoint, None);
    }
}

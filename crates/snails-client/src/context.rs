//! Entry point for applications: one graph client, one permit signer and the
//! health tracker watching them.

use std::sync::{Arc, RwLock};

use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::{info, warn};

use snails_shared::{Address, ConnectionStatus, GraphNode, PeerInfo, Permit};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::graph_client::{GraphClient, NodeSubscription};
use crate::permit_cache::PermitCache;
use crate::tracker::{HealthSnapshot, HealthTracker, TrackerTimings};
use crate::wallet::{PermitSigner, WalletBridge};

pub struct DatabaseContext {
    graph: GraphClient,
    signer: Arc<PermitSigner>,
    tracker: HealthTracker,
    session: RwLock<Option<Address>>,
}

impl DatabaseContext {
    /// Context for the relay in `config`. Must be called inside a tokio
    /// runtime; the relay connection is opened in the background.
    pub fn new(config: &ClientConfig, wallet: Option<Arc<dyn WalletBridge>>) -> Self {
        let graph = GraphClient::new(
            config.relay_url.clone(),
            config.probe_timeout,
            config.request_timeout,
        );
        let signer = PermitSigner::new(wallet, Arc::new(PermitCache::new()), config.chain_id.clone());
        Self::from_parts(graph, Arc::new(signer), TrackerTimings::from(config))
    }

    pub fn from_parts(graph: GraphClient, signer: Arc<PermitSigner>, timings: TrackerTimings) -> Self {
        let tracker = HealthTracker::spawn(graph.clone(), timings);
        Self {
            graph,
            signer,
            tracker,
            session: RwLock::new(None),
        }
    }

    pub fn graph(&self) -> &GraphClient {
        &self.graph
    }

    pub fn signer(&self) -> &Arc<PermitSigner> {
        &self.signer
    }

    pub async fn get(&self, soul: &str) -> Result<Option<GraphNode>> {
        self.graph.get(soul).await
    }

    pub fn subscribe(&self, soul: &str) -> NodeSubscription {
        self.graph.subscribe(soul)
    }

    pub async fn put(&self, soul: &str, fields: &Map<String, Value>) -> Result<()> {
        self.graph.put(soul, fields).await
    }

    /// Store `permit` on the user node and start a session for `address`.
    ///
    /// Only the permit write is awaited; the activity record that follows is
    /// best effort.
    pub async fn authenticate(&self, address: &Address, permit: &Permit) -> Result<()> {
        let user_soul = format!("users/{address}");

        let mut fields = Map::new();
        fields.insert("permit".into(), permit.to_value());
        self.graph.put(&user_soul, &fields).await?;

        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(address.clone());
        self.tracker.session_started();
        info!(address = %address, "Session started");

        let data = json!({
            "data": {
                "lastActive": chrono::Utc::now().timestamp_millis(),
                "address": address.as_str(),
            }
        });
        if let Some(data) = data.as_object() {
            if let Err(e) = self.graph.put(&user_soul, data).await {
                warn!(address = %address, error = %e, "Failed to record user activity");
            }
        }
        Ok(())
    }

    pub fn logout(&self) {
        let previous = self.session.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(address) = previous {
            self.tracker.session_ended();
            info!(address = %address, "Session ended");
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.session_address().is_some()
    }

    pub fn session_address(&self) -> Option<Address> {
        self.session.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Address of the signed-in user, or `NotConnected` without a session.
    pub(crate) fn require_session(&self) -> Result<Address> {
        self.session_address().ok_or(ClientError::NotConnected)
    }

    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        self.tracker.snapshot().peers
    }

    pub fn status(&self) -> ConnectionStatus {
        self.tracker.status()
    }

    pub fn status_watch(&self) -> watch::Receiver<HealthSnapshot> {
        self.tracker.watch()
    }

    pub async fn shutdown(&self) {
        self.tracker.shutdown();
        self.graph.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::LocalWallet;
    use snails_shared::{GraphValue, PermitType};
    use std::time::Duration;

    fn local_context(wallet: LocalWallet) -> DatabaseContext {
        let signer = PermitSigner::new(Some(Arc::new(wallet)), Arc::new(PermitCache::new()), "stargaze-1");
        DatabaseContext::from_parts(
            GraphClient::local(),
            Arc::new(signer),
            TrackerTimings::from(&ClientConfig::default()),
        )
    }

    #[tokio::test]
    async fn authenticate_records_permit_and_activity() {
        let wallet = LocalWallet::random().unwrap();
        let address = wallet.address().clone();
        let ctx = local_context(wallet);
        assert!(!ctx.is_authenticated());

        let permit = ctx
            .signer()
            .sign_gun_permit(&address, PermitType::Message, &Value::Null)
            .await
            .unwrap();
        ctx.authenticate(&address, &permit).await.unwrap();

        assert!(ctx.is_authenticated());
        assert_eq!(ctx.session_address(), Some(address.clone()));

        let params = ctx
            .get(&format!("users/{address}/permit/params"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            params.get("permit_name"),
            Some(&GraphValue::Text("snails-message".into()))
        );

        let data = ctx.get(&format!("users/{address}/data")).await.unwrap().unwrap();
        assert_eq!(
            data.get("address"),
            Some(&GraphValue::Text(address.to_string()))
        );
        assert!(data.get("lastActive").and_then(GraphValue::as_f64).is_some());

        ctx.logout();
        assert!(!ctx.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn local_context_is_red() {
        let ctx = local_context(LocalWallet::random().unwrap());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ctx.status(), ConnectionStatus::Red);
        assert!(ctx.connected_peers().is_empty());
    }
}

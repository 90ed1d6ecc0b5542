use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use snails_client::{ClientConfig, ClientError, DatabaseContext, GraphClient, HealthSnapshot, LocalWallet};
use snails_relay::RelayConfig;
use snails_shared::{ConnectionStatus, GraphValue, PermitType};

async fn start_relay() -> (String, oneshot::Sender<()>, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = RelayConfig {
        http_addr: addr,
        graph_store: ":memory:".to_string(),
        ..RelayConfig::default()
    };

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(snails_relay::run_on(listener, config, async move {
        let _ = stop_rx.await;
    }));
    (format!("ws://{addr}/gun"), stop_tx, server)
}

fn client_config(relay_url: &str) -> ClientConfig {
    ClientConfig {
        relay_url: relay_url.to_string(),
        peer_grace: Duration::from_millis(200),
        ..ClientConfig::default()
    }
}

async fn wait_for_status(ctx: &DatabaseContext, status: ConnectionStatus) -> HealthSnapshot {
    let mut rx = ctx.status_watch();
    let snapshot = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| s.status == status))
        .await
        .unwrap_or_else(|_| panic!("status never became {status}"))
        .unwrap()
        .clone();
    snapshot
}

fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn client_goes_green_then_blue_and_syncs_writes() {
    let (relay_url, stop, server) = start_relay().await;

    let wallet = LocalWallet::random().unwrap();
    let address = wallet.address().clone();
    let alice = DatabaseContext::new(&client_config(&relay_url), Some(Arc::new(wallet)));
    let bob = DatabaseContext::new(&client_config(&relay_url), None);

    let snapshot = wait_for_status(&alice, ConnectionStatus::Green).await;
    assert_eq!(snapshot.peers.len(), 1);
    assert_eq!(snapshot.peers[0].url, relay_url);
    wait_for_status(&bob, ConnectionStatus::Green).await;

    let permit = alice
        .signer()
        .sign_gun_permit(&address, PermitType::Message, &json!({ "action": "login" }))
        .await
        .unwrap();
    alice.authenticate(&address, &permit).await.unwrap();
    wait_for_status(&alice, ConnectionStatus::Blue).await;
    assert!(alice.is_authenticated());

    // Bob sees Alice's write pushed by the relay.
    let mut lobby = bob.subscribe("rooms/lobby");
    alice
        .put("rooms/lobby", &fields(json!({ "name": "Lobby" })))
        .await
        .unwrap();
    let node = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let node = lobby.next().await.unwrap();
            if node.soul == "rooms/lobby" {
                return node;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(node.get("name"), Some(&GraphValue::Text("Lobby".into())));

    // A fresh read goes through the relay's store.
    let data = bob
        .get(&format!("users/{address}/data"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data.get("address"), Some(&GraphValue::Text(address.to_string())));

    stop.send(()).unwrap();
    server.await.unwrap().unwrap();

    wait_for_status(&alice, ConnectionStatus::Red).await;
    assert!(alice.connected_peers().is_empty());

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn unreachable_relay_stays_red() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let ctx = DatabaseContext::new(&client_config(&format!("ws://{addr}/gun")), None);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(ctx.status(), ConnectionStatus::Red);

    let err = ctx
        .put("rooms/lobby", &fields(json!({ "name": "Lobby" })))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));
}

#[tokio::test]
async fn offline_write_reaches_relay_after_connect() {
    let (relay_url, stop, server) = start_relay().await;
    let timeout = Duration::from_secs(2);

    let alice = GraphClient::new(relay_url.clone(), timeout, timeout);
    let err = alice
        .put_value("rooms/lobby", "name", json!("Lobby"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NotConnected));
    assert_eq!(alice.pending_writes(), 1);

    alice.connect().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while alice.pending_writes() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("queued write was never acknowledged");

    let bob = GraphClient::new(relay_url, timeout, timeout);
    bob.connect().await.unwrap();
    let lobby = bob.get("rooms/lobby").await.unwrap().unwrap();
    assert_eq!(lobby.get("name"), Some(&GraphValue::Text("Lobby".into())));

    alice.disconnect().await;
    bob.disconnect().await;
    stop.send(()).unwrap();
    server.await.unwrap().unwrap();
}

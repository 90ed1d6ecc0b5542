use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use snails_relay::RelayConfig;
use snails_shared::graph::now_state;
use snails_shared::{GraphNode, GraphValue, WireMessage};
use snails_store::Database;

async fn next_text<S>(ws: &mut S) -> String
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return text;
        }
    }
}

#[tokio::test]
async fn put_is_persisted_and_shutdown_closes_with_1000() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("data.db");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = RelayConfig {
        http_addr: addr,
        graph_store: db_path.to_string_lossy().into_owned(),
        ..RelayConfig::default()
    };

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(snails_relay::run_on(listener, config, async move {
        let _ = stop_rx.await;
    }));

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/gun"))
        .await
        .unwrap();

    // Relay greets first.
    let hello = WireMessage::decode(&next_text(&mut ws).await).unwrap();
    assert!(matches!(hello, WireMessage::Hello { .. }));

    ws.send(Message::Text(WireMessage::hello("peer-test").encode()))
        .await
        .unwrap();

    let node = GraphNode::new("rooms/lobby").with_field(
        "name",
        GraphValue::Text("Lobby".into()),
        now_state() - 1.0,
    );
    let put = WireMessage::put(vec![node.clone()]);
    let put_id = put.id().unwrap().to_string();
    ws.send(Message::Text(put.encode())).await.unwrap();

    match WireMessage::decode(&next_text(&mut ws).await).unwrap() {
        WireMessage::Ack { reply_to, err, .. } => {
            assert_eq!(reply_to, put_id);
            assert_eq!(err, None);
        }
        other => panic!("unexpected frame {other:?}"),
    }

    let health: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["peerCount"], 1);
    assert_eq!(health["wsConnections"], 1);

    stop_tx.send(()).unwrap();

    let close = loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
        {
            Some(Ok(Message::Close(frame))) => break frame,
            Some(Ok(_)) => continue,
            other => panic!("expected a close frame, got {other:?}"),
        }
    };
    assert_eq!(close.unwrap().code, CloseCode::Normal);
    drop(ws);

    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let db = Database::open_at(&db_path).unwrap();
    assert_eq!(db.get_node("rooms/lobby").unwrap(), Some(node));
}

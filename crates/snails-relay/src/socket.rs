//! Graph socket: the `/gun` WebSocket endpoint.

use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use snails_shared::constants::MAX_WS_PAYLOAD;
use snails_shared::graph::now_state;
use snails_shared::{GraphNode, WireMessage};

use crate::api::AppState;
use crate::connections::{ConnId, Outbound};
use crate::error::ServerError;

pub async fn graph_socket(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_WS_PAYLOAD)
        .max_frame_size(MAX_WS_PAYLOAD)
        .on_upgrade(move |socket| handle_socket(socket, remote, state))
}

async fn handle_socket(socket: WebSocket, remote: SocketAddr, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (conn_id, mut outbound) = state.connections.open(remote);
    let max_bytes = state.config.max_message_bytes;

    let hello = WireMessage::hello(&state.relay_id).encode();
    if sink.send(Message::Text(hello)).await.is_err() {
        state.connections.close(conn_id);
        return;
    }

    loop {
        tokio::select! {
            out = outbound.recv() => {
                match out {
                    Some(Outbound::Frame(text)) => {
                        if text.len() > max_bytes {
                            warn!(conn = conn_id, size = text.len(), "Dropping oversized outgoing frame");
                            continue;
                        }
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Ping) => {
                        if sink.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let frame = CloseFrame { code, reason: reason.into() };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        break;
                    }
                    Some(Outbound::Terminate) | None => {
                        debug!(conn = conn_id, "Terminating socket");
                        break;
                    }
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(conn = conn_id, size = text.len(), "Incoming graph frame");
                        if text.len() > max_bytes {
                            warn!(conn = conn_id, size = text.len(), "Dropping oversized incoming frame");
                            continue;
                        }
                        if let Some(reply) = handle_frame(&state, conn_id, &text) {
                            if sink.send(Message::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => state.connections.mark_alive(conn_id),
                    Some(Ok(Message::Ping(data))) => {
                        state.connections.mark_alive(conn_id);
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        debug!(conn = conn_id, size = data.len(), "Ignoring binary frame");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(conn = conn_id, error = %e, "Socket error");
                        break;
                    }
                }
            }
        }
    }

    state.connections.close(conn_id);
}

/// Apply one inbound frame. Returns the reply to send back, if any.
pub(crate) fn handle_frame(state: &AppState, conn_id: ConnId, text: &str) -> Option<String> {
    let message = match WireMessage::decode(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(conn = conn_id, error = %e, "Malformed graph frame");
            return None;
        }
    };

    match message {
        WireMessage::Hello { peer_id } => {
            state.connections.hello(conn_id, &peer_id, None);
            None
        }
        WireMessage::Get { id, soul, key } => {
            let reply = match read(state, &soul, key.as_deref()) {
                Ok(node) => WireMessage::ok(id, node.into_iter().collect()),
                Err(e) => WireMessage::err(id, e.to_string()),
            };
            Some(reply.encode())
        }
        WireMessage::Put { id, nodes } => {
            let reply = match merge_and_broadcast(state, Some(conn_id), &nodes) {
                Ok(()) => WireMessage::ok(id, Vec::new()),
                Err(e) => {
                    warn!(conn = conn_id, error = %e, "Graph write rejected");
                    WireMessage::err(id, e.to_string())
                }
            };
            Some(reply.encode())
        }
        WireMessage::Ack { reply_to, .. } => {
            debug!(conn = conn_id, reply_to = %reply_to, "Ignoring ack from client");
            None
        }
    }
}

fn read(state: &AppState, soul: &str, key: Option<&str>) -> Result<Option<GraphNode>, ServerError> {
    let store = state.store();
    let node = match key {
        Some(key) => store.get_field(soul, key)?,
        None => store.get_node(soul)?,
    };
    Ok(node)
}

/// Merge `nodes` into the store and forward whatever changed to every socket
/// but `origin`.
pub(crate) fn merge_and_broadcast(
    state: &AppState,
    origin: Option<ConnId>,
    nodes: &[GraphNode],
) -> Result<(), ServerError> {
    let now = now_state();
    let mut diffs = Vec::new();
    {
        let store = state.store();
        for node in nodes {
            let report = store.put_node(node, now)?;
            if report.deferred > 0 {
                warn!(soul = %node.soul, deferred = report.deferred, "Fields from the future were not applied");
            }
            if report.changed() {
                diffs.push(report.diff);
            }
        }
    }

    if !diffs.is_empty() {
        let frame = WireMessage::put(diffs).encode();
        let reached = state.connections.broadcast_except(origin, &frame);
        debug!(origin = ?origin, reached, "Broadcast graph diff");
    }
    Ok(())
}

//! Graph client: a local replica of the graph, synced with one relay.
//!
//! The socket runs in its own tokio task. The client talks to it through a
//! command channel, and everything the relay pushes (hello frames, writes by
//! other peers) comes back as [`GraphEvent`]s on a broadcast channel.
//!
//! Writes are merged into the local replica first, then sent to the relay;
//! `put` resolves once the relay acknowledges. Writes the relay has not
//! acknowledged stay in an outbox and are sent again after the next hello,
//! so the replica and the relay converge once a socket is up. A client built
//! with [`GraphClient::local`] has no relay and only ever touches its replica.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use snails_shared::graph::{ancestor_links, explode, now_state, StateClock};
use snails_shared::{GraphNode, GraphValue, PeerInfo, WireMessage};

use crate::error::{ClientError, Result};

const EVENT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 64;

/// Something the relay told us.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    /// The relay greeted us.
    PeerHi(PeerInfo),
    /// The relay socket closed.
    PeerBye(PeerInfo),
    /// These fields changed in the local replica.
    NodeUpdated(GraphNode),
}

enum Pending {
    Put(oneshot::Sender<Result<()>>),
    Get(oneshot::Sender<Result<Vec<GraphNode>>>),
}

enum Command {
    Send {
        message: WireMessage,
        pending: Option<Pending>,
    },
    Close,
}

struct Inner {
    relay_url: Option<String>,
    peer_id: String,
    replica: RwLock<HashMap<String, GraphNode>>,
    /// Unacknowledged puts by message id, oldest first.
    outbox: Mutex<Vec<(String, Vec<GraphNode>)>>,
    clock: StateClock,
    events: broadcast::Sender<GraphEvent>,
    session: Mutex<Option<mpsc::Sender<Command>>>,
    peers: RwLock<HashMap<String, PeerInfo>>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

#[derive(Clone)]
pub struct GraphClient {
    inner: Arc<Inner>,
}

impl GraphClient {
    /// Client for the relay at `relay_url`. Call [`connect`](Self::connect)
    /// before expecting writes to reach it.
    pub fn new(relay_url: impl Into<String>, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self::build(Some(relay_url.into()), connect_timeout, request_timeout)
    }

    /// Replica-only client with no relay.
    pub fn local() -> Self {
        Self::build(None, Duration::ZERO, Duration::ZERO)
    }

    fn build(relay_url: Option<String>, connect_timeout: Duration, request_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                relay_url,
                peer_id: uuid::Uuid::new_v4().simple().to_string(),
                replica: RwLock::new(HashMap::new()),
                outbox: Mutex::new(Vec::new()),
                clock: StateClock::new(),
                events,
                session: Mutex::new(None),
                peers: RwLock::new(HashMap::new()),
                connect_timeout,
                request_timeout,
            }),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn relay_url(&self) -> Option<&str> {
        self.inner.relay_url.as_deref()
    }

    pub fn events(&self) -> broadcast::Receiver<GraphEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.session_tx().is_some()
    }

    /// Peers that greeted us on a socket that is still open.
    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        let peers = self.inner.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<PeerInfo> = peers.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    fn session_tx(&self) -> Option<mpsc::Sender<Command>> {
        let session = self.inner.session.lock().unwrap_or_else(|e| e.into_inner());
        session.as_ref().filter(|tx| !tx.is_closed()).cloned()
    }

    /// Open the relay socket. No-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        let url = self.inner.relay_url.clone().ok_or(ClientError::NotConnected)?;
        if self.is_connected() {
            return Ok(());
        }

        let (ws, _) = tokio::time::timeout(
            self.inner.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| ClientError::Timeout("relay connection"))??;

        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        {
            let mut session = self.inner.session.lock().unwrap_or_else(|e| e.into_inner());
            if session.as_ref().is_some_and(|s| !s.is_closed()) {
                // Lost a race with another connect; keep the first socket.
                return Ok(());
            }
            *session = Some(tx);
        }

        info!(url = %url, peer = %self.inner.peer_id, "Connected to relay");
        tokio::spawn(run_session(self.inner.clone(), url, ws, rx));
        Ok(())
    }

    /// Close the relay socket, if any.
    pub async fn disconnect(&self) {
        let tx = self
            .inner
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(Command::Close).await;
        }
    }

    /// Write `fields` under `soul`. Nested objects become child nodes, and
    /// every ancestor of `soul` gets a link to it.
    pub async fn put(&self, soul: &str, fields: &Map<String, Value>) -> Result<()> {
        let state = self.inner.clock.next();
        let mut nodes = ancestor_links(soul, state);
        nodes.extend(explode(soul, fields, state)?);
        self.put_nodes(nodes).await
    }

    /// Write a single field.
    pub async fn put_value(&self, soul: &str, key: &str, value: Value) -> Result<()> {
        let mut fields = Map::new();
        fields.insert(key.to_string(), value);
        self.put(soul, &fields).await
    }

    /// Merge locally, then send. Without a socket the write is queued and
    /// `NotConnected` is returned; it reaches the relay on the next connect.
    async fn put_nodes(&self, nodes: Vec<GraphNode>) -> Result<()> {
        merge_local(&self.inner, &nodes);

        if self.inner.relay_url.is_none() {
            return Ok(());
        }

        let message = WireMessage::put(nodes.clone());
        if let Some(id) = message.id() {
            lock(&self.inner.outbox).push((id.to_string(), nodes));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(message, Some(Pending::Put(reply_tx))).await?;
        self.await_reply(reply_rx, "put ack").await?
    }

    /// Writes not yet acknowledged by the relay.
    pub fn pending_writes(&self) -> usize {
        lock(&self.inner.outbox).len()
    }

    /// Node under `soul`, refreshed from the relay when connected.
    pub async fn get(&self, soul: &str) -> Result<Option<GraphNode>> {
        if self.is_connected() {
            match self.fetch(soul, None).await {
                Ok(_) => {}
                Err(e @ ClientError::Write(_)) => return Err(e),
                Err(e) => debug!(soul = %soul, error = %e, "Serving node from replica"),
            }
        }
        Ok(self.local_node(soul))
    }

    /// Single field of a node, refreshed like [`get`](Self::get).
    pub async fn get_field(&self, soul: &str, key: &str) -> Result<Option<GraphValue>> {
        Ok(self
            .get(soul)
            .await?
            .and_then(|node| node.get(key).cloned()))
    }

    /// Ask the relay directly and return what it answered, without looking at
    /// the replica. The answer is still merged into the replica.
    pub async fn fetch(&self, soul: &str, key: Option<&str>) -> Result<Option<GraphNode>> {
        let message = WireMessage::Get {
            id: snails_shared::protocol::new_message_id(),
            soul: soul.to_string(),
            key: key.map(str::to_string),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(message, Some(Pending::Get(reply_tx))).await?;
        let nodes = self.await_reply(reply_rx, "get reply").await??;
        Ok(nodes.into_iter().find(|n| n.soul == soul))
    }

    /// Child nodes linked from `soul`, skipping deleted keys.
    pub async fn children(&self, soul: &str) -> Result<Vec<(String, GraphNode)>> {
        let Some(parent) = self.get(soul).await? else {
            return Ok(Vec::new());
        };

        let mut children = Vec::new();
        for (key, field) in &parent.fields {
            if let GraphValue::Link(child) = &field.value {
                if let Some(node) = self.get(child).await? {
                    children.push((key.clone(), node));
                }
            }
        }
        Ok(children)
    }

    pub fn local_node(&self, soul: &str) -> Option<GraphNode> {
        let replica = self.inner.replica.read().unwrap_or_else(|e| e.into_inner());
        replica.get(soul).cloned()
    }

    /// Updates to `soul` and every node below it.
    pub fn subscribe(&self, soul: &str) -> NodeSubscription {
        NodeSubscription {
            client: self.clone(),
            soul: soul.to_string(),
            events: self.events(),
        }
    }

    #[cfg(test)]
    pub(crate) fn emit(&self, event: GraphEvent) {
        let _ = self.inner.events.send(event);
    }

    async fn send(&self, message: WireMessage, pending: Option<Pending>) -> Result<()> {
        let tx = self.session_tx().ok_or(ClientError::NotConnected)?;
        tx.send(Command::Send { message, pending })
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    async fn await_reply<T>(&self, rx: oneshot::Receiver<T>, what: &'static str) -> Result<T> {
        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Err(_) => Err(ClientError::Timeout(what)),
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Ok(Ok(reply)) => Ok(reply),
        }
    }
}

/// Stream of node updates under one soul.
pub struct NodeSubscription {
    client: GraphClient,
    soul: String,
    events: broadcast::Receiver<GraphEvent>,
}

impl NodeSubscription {
    /// Next updated node (the full merged node, not just the diff). `None`
    /// once the client is gone.
    pub async fn next(&mut self) -> Option<GraphNode> {
        loop {
            match self.events.recv().await {
                Ok(GraphEvent::NodeUpdated(diff)) if self.matches(&diff.soul) => {
                    return self.client.local_node(&diff.soul);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(soul = %self.soul, skipped, "Subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, soul: &str) -> bool {
        soul == self.soul
            || soul
                .strip_prefix(self.soul.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drop an acknowledged put from the outbox.
fn settle(inner: &Inner, id: &str) {
    lock(&inner.outbox).retain(|(queued, _)| queued != id);
}

/// Merge nodes into the replica and announce whatever changed.
fn merge_local(inner: &Inner, nodes: &[GraphNode]) {
    let now = now_state();
    let mut changed = Vec::new();
    {
        let mut replica = inner.replica.write().unwrap_or_else(|e| e.into_inner());
        for node in nodes {
            let current = replica
                .entry(node.soul.clone())
                .or_insert_with(|| GraphNode::new(node.soul.clone()));
            let report = current.merge(node, now);
            if report.deferred > 0 {
                warn!(soul = %node.soul, deferred = report.deferred, "Ignoring fields from the future");
            }
            if report.changed() {
                changed.push(report.diff);
            }
        }
    }
    for diff in changed {
        let _ = inner.events.send(GraphEvent::NodeUpdated(diff));
    }
}

async fn run_session<S>(
    inner: Arc<Inner>,
    url: String,
    ws: tokio_tungstenite::WebSocketStream<S>,
    mut commands: mpsc::Receiver<Command>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let mut pending: HashMap<String, Pending> = HashMap::new();
    let mut relay_peer: Option<PeerInfo> = None;

    let hello = WireMessage::hello(&inner.peer_id).encode();
    if sink.send(Message::Text(hello)).await.is_err() {
        return;
    }

    let queued: Vec<(String, Vec<GraphNode>)> = lock(&inner.outbox).clone();
    if !queued.is_empty() {
        info!(writes = queued.len(), "Replaying unacknowledged writes");
    }
    for (id, nodes) in queued {
        let message = WireMessage::Put { id, nodes };
        if sink.send(Message::Text(message.encode())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(Command::Send { message, pending: reply }) => {
                        if let (Some(id), Some(reply)) = (message.id(), reply) {
                            pending.insert(id.to_string(), reply);
                        }
                        if sink.send(Message::Text(message.encode())).await.is_err() {
                            break;
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&inner, &url, &text, &mut pending, &mut relay_peer);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "Relay closed the socket");
                        break;
                    }
                    None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "Relay socket error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // Dropping the receiver marks the session closed for `is_connected`.
    drop(commands);
    for (_, reply) in pending.drain() {
        match reply {
            Pending::Put(tx) => {
                let _ = tx.send(Err(ClientError::NotConnected));
            }
            Pending::Get(tx) => {
                let _ = tx.send(Err(ClientError::NotConnected));
            }
        }
    }

    if let Some(peer) = relay_peer {
        inner
            .peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&peer.id);
        info!(peer = %peer.id, "Relay disconnected");
        let _ = inner.events.send(GraphEvent::PeerBye(peer));
    }
}

fn handle_frame(
    inner: &Inner,
    url: &str,
    text: &str,
    pending: &mut HashMap<String, Pending>,
    relay_peer: &mut Option<PeerInfo>,
) {
    let message = match WireMessage::decode(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Malformed frame from relay");
            return;
        }
    };

    match message {
        WireMessage::Hello { peer_id } => {
            let peer = PeerInfo {
                id: peer_id,
                url: url.to_string(),
            };
            inner
                .peers
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(peer.id.clone(), peer.clone());
            info!(peer = %peer.id, "Relay said hello");
            *relay_peer = Some(peer.clone());
            let _ = inner.events.send(GraphEvent::PeerHi(peer));
        }
        WireMessage::Put { nodes, .. } => merge_local(inner, &nodes),
        WireMessage::Ack {
            reply_to,
            err,
            nodes,
            ..
        } => match pending.remove(&reply_to) {
            Some(Pending::Put(tx)) => {
                settle(inner, &reply_to);
                let _ = tx.send(match err {
                    Some(err) => Err(ClientError::Write(err)),
                    None => Ok(()),
                });
            }
            Some(Pending::Get(tx)) => {
                merge_local(inner, &nodes);
                let _ = tx.send(match err {
                    Some(err) => Err(ClientError::Write(err)),
                    None => Ok(nodes),
                });
            }
            None => {
                settle(inner, &reply_to);
                debug!(reply_to = %reply_to, "Ack without a waiting caller");
            }
        },
        WireMessage::Get { .. } => debug!("Ignoring get from relay"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn acked_put_leaves_outbox() {
        let graph = GraphClient::new("ws://127.0.0.1:1/gun", Duration::ZERO, Duration::ZERO);
        let _ = graph.put_value("rooms/a", "name", json!("A")).await;
        let queued = lock(&graph.inner.outbox)[0].0.clone();

        let ack = WireMessage::ok(queued, Vec::new()).encode();
        let mut pending = HashMap::new();
        let mut relay_peer = None;
        handle_frame(&graph.inner, "ws://relay", &ack, &mut pending, &mut relay_peer);
        assert_eq!(graph.pending_writes(), 0);
    }

    #[tokio::test]
    async fn local_put_then_get() {
        let graph = GraphClient::local();
        graph
            .put("users/stars1abc", &fields(json!({ "name": "turbo", "data": { "lastActive": 5 } })))
            .await
            .unwrap();

        let user = graph.get("users/stars1abc").await.unwrap().unwrap();
        assert_eq!(user.get("name"), Some(&GraphValue::Text("turbo".into())));
        assert_eq!(
            user.get("data"),
            Some(&GraphValue::Link("users/stars1abc/data".into()))
        );

        let users = graph.get("users").await.unwrap().unwrap();
        assert_eq!(
            users.get("stars1abc"),
            Some(&GraphValue::Link("users/stars1abc".into()))
        );
    }

    #[tokio::test]
    async fn children_skip_deleted_keys() {
        let graph = GraphClient::local();
        graph.put("rooms/a", &fields(json!({ "name": "A" }))).await.unwrap();
        graph.put("rooms/b", &fields(json!({ "name": "B" }))).await.unwrap();
        graph.put_value("rooms", "b", Value::Null).await.unwrap();

        let children = graph.children("rooms").await.unwrap();
        let keys: Vec<&str> = children.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a"]);
    }

    #[tokio::test]
    async fn subscription_sees_nested_updates() {
        let graph = GraphClient::local();
        let mut sub = graph.subscribe("messages/room1");

        graph
            .put("messages/room1/m1", &fields(json!({ "text": "hello" })))
            .await
            .unwrap();

        let node = loop {
            let node = sub.next().await.unwrap();
            if node.soul == "messages/room1/m1" {
                break node;
            }
        };
        assert_eq!(node.get("text"), Some(&GraphValue::Text("hello".into())));
    }

    #[test]
    fn subscription_prefix_match() {
        let graph = GraphClient::local();
        let sub = graph.subscribe("rooms/a");
        assert!(sub.matches("rooms/a"));
        assert!(sub.matches("rooms/a/users"));
        assert!(!sub.matches("rooms/ab"));
        assert!(!sub.matches("rooms"));
    }

    #[tokio::test]
    async fn disconnected_relay_client_rejects_writes() {
        let graph = GraphClient::new(
            "ws://127.0.0.1:1/gun",
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        let err = graph
            .put("rooms/a", &fields(json!({ "name": "A" })))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));

        // The write still landed in the replica and waits for a socket.
        assert!(graph.local_node("rooms/a").is_some());
        assert_eq!(graph.pending_writes(), 1);
        assert!(graph.connect().await.is_err());
        assert_eq!(graph.pending_writes(), 1);
    }
}

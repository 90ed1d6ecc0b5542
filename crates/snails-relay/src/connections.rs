//! Open graph sockets and the peers announced over them.
//!
//! Every socket task registers here and receives an [`Outbound`] channel.
//! The heartbeat, broadcasts and shutdown talk to sockets only through that
//! channel, so nothing holds the registry lock while a socket is writing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub type ConnId = u64;

/// Instruction for a socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// JSON text frame.
    Frame(String),
    Ping,
    /// Send a close frame, then stop.
    Close { code: u16, reason: String },
    /// Drop the socket without a close handshake.
    Terminate,
}

/// A peer that said hello on one of the sockets.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub id: String,
    pub url: Option<String>,
    pub remote: SocketAddr,
    pub connected_at: DateTime<Utc>,
    #[serde(skip)]
    pub conn_id: ConnId,
}

struct SocketEntry {
    tx: mpsc::UnboundedSender<Outbound>,
    remote: SocketAddr,
    /// Cleared when a ping goes out, set again by any pong.
    alive: bool,
    peer_id: Option<String>,
}

#[derive(Default)]
struct Inner {
    next_id: ConnId,
    sockets: HashMap<ConnId, SocketEntry>,
    peers: HashMap<String, PeerRecord>,
}

/// What one heartbeat cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub pinged: usize,
    pub terminated: Vec<ConnId>,
}

#[derive(Clone, Default)]
pub struct Connections {
    inner: Arc<Mutex<Inner>>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a freshly upgraded socket.
    pub fn open(&self, remote: SocketAddr) -> (ConnId, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.sockets.insert(
            id,
            SocketEntry {
                tx,
                remote,
                alive: true,
                peer_id: None,
            },
        );
        debug!(conn = id, remote = %remote, "socket opened");
        (id, rx)
    }

    /// Bind a peer id to a socket. A peer reconnecting on a new socket
    /// replaces its old record.
    pub fn hello(&self, conn_id: ConnId, peer_id: &str, url: Option<String>) {
        let mut inner = self.lock();
        let Some(socket) = inner.sockets.get_mut(&conn_id) else {
            return;
        };
        socket.peer_id = Some(peer_id.to_string());
        let remote = socket.remote;

        inner.peers.insert(
            peer_id.to_string(),
            PeerRecord {
                id: peer_id.to_string(),
                url,
                remote,
                connected_at: Utc::now(),
                conn_id,
            },
        );
        info!(peer = %peer_id, conn = conn_id, peers = inner.peers.len(), "peer connected");
    }

    /// Forget a socket and the peer bound to it. Returns that peer's id.
    pub fn close(&self, conn_id: ConnId) -> Option<String> {
        let mut inner = self.lock();
        let socket = inner.sockets.remove(&conn_id)?;
        let peer_id = socket.peer_id?;

        // Only drop the record if it still points at this socket.
        if inner
            .peers
            .get(&peer_id)
            .is_some_and(|p| p.conn_id == conn_id)
        {
            inner.peers.remove(&peer_id);
            info!(peer = %peer_id, conn = conn_id, peers = inner.peers.len(), "peer disconnected");
        }
        Some(peer_id)
    }

    pub fn mark_alive(&self, conn_id: ConnId) {
        if let Some(socket) = self.lock().sockets.get_mut(&conn_id) {
            socket.alive = true;
        }
    }

    /// One heartbeat cycle: sockets that never answered the previous ping
    /// are terminated and forgotten, the rest are pinged again.
    pub fn heartbeat(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();
        let mut inner = self.lock();

        let dead: Vec<ConnId> = inner
            .sockets
            .iter()
            .filter(|(_, s)| !s.alive)
            .map(|(id, _)| *id)
            .collect();

        for id in dead {
            if let Some(socket) = inner.sockets.remove(&id) {
                let _ = socket.tx.send(Outbound::Terminate);
                if let Some(peer_id) = socket.peer_id {
                    if inner.peers.get(&peer_id).is_some_and(|p| p.conn_id == id) {
                        inner.peers.remove(&peer_id);
                    }
                }
                report.terminated.push(id);
            }
        }

        for socket in inner.sockets.values_mut() {
            socket.alive = false;
            if socket.tx.send(Outbound::Ping).is_ok() {
                report.pinged += 1;
            }
        }

        report
    }

    /// Queue `frame` on every socket except `origin`. Returns how many
    /// sockets it was queued on.
    pub fn broadcast_except(&self, origin: Option<ConnId>, frame: &str) -> usize {
        let inner = self.lock();
        inner
            .sockets
            .iter()
            .filter(|(id, _)| Some(**id) != origin)
            .filter(|(_, s)| s.tx.send(Outbound::Frame(frame.to_string())).is_ok())
            .count()
    }

    /// Ask every socket to close with `code`, then forget them all.
    pub fn close_all(&self, code: u16, reason: &str) -> usize {
        let mut inner = self.lock();
        let count = inner.sockets.len();
        for (_, socket) in inner.sockets.drain() {
            let _ = socket.tx.send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
        inner.peers.clear();
        count
    }

    pub fn socket_count(&self) -> usize {
        self.lock().sockets.len()
    }

    pub fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.lock().peers.contains_key(peer_id)
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.lock().peers.values().cloned().collect();
        peers.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SocketAddr {
        ([127, 0, 0, 1], 40000).into()
    }

    #[test]
    fn hello_registers_peer() {
        let conns = Connections::new();
        let (id, _rx) = conns.open(remote());
        assert_eq!(conns.socket_count(), 1);
        assert_eq!(conns.peer_count(), 0);

        conns.hello(id, "peer-a", None);
        assert!(conns.is_connected("peer-a"));
        assert_eq!(conns.peers()[0].remote, remote());

        assert_eq!(conns.close(id).as_deref(), Some("peer-a"));
        assert_eq!(conns.socket_count(), 0);
        assert_eq!(conns.peer_count(), 0);
    }

    #[test]
    fn reconnect_keeps_newer_record() {
        let conns = Connections::new();
        let (old, _rx1) = conns.open(remote());
        let (new, _rx2) = conns.open(remote());
        conns.hello(old, "peer-a", None);
        conns.hello(new, "peer-a", None);

        conns.close(old);
        assert!(conns.is_connected("peer-a"));
        conns.close(new);
        assert!(!conns.is_connected("peer-a"));
    }

    #[test]
    fn silent_socket_terminated_after_two_cycles() {
        let conns = Connections::new();
        let (id, mut rx) = conns.open(remote());
        conns.hello(id, "peer-a", None);

        let first = conns.heartbeat();
        assert_eq!(first.pinged, 1);
        assert!(first.terminated.is_empty());
        assert_eq!(rx.try_recv().unwrap(), Outbound::Ping);

        let second = conns.heartbeat();
        assert_eq!(second.terminated, vec![id]);
        assert_eq!(rx.try_recv().unwrap(), Outbound::Terminate);
        assert!(!conns.is_connected("peer-a"));
        assert_eq!(conns.socket_count(), 0);
    }

    #[test]
    fn answering_socket_survives() {
        let conns = Connections::new();
        let (id, _rx) = conns.open(remote());

        for _ in 0..5 {
            let report = conns.heartbeat();
            assert!(report.terminated.is_empty());
            conns.mark_alive(id);
        }
        assert_eq!(conns.socket_count(), 1);
    }

    #[test]
    fn broadcast_skips_origin() {
        let conns = Connections::new();
        let (a, mut rx_a) = conns.open(remote());
        let (_b, mut rx_b) = conns.open(remote());

        assert_eq!(conns.broadcast_except(Some(a), "{}"), 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), Outbound::Frame("{}".into()));
    }

    #[test]
    fn close_all_sends_code() {
        let conns = Connections::new();
        let (id, mut rx) = conns.open(remote());
        conns.hello(id, "peer-a", None);

        assert_eq!(conns.close_all(1000, "relay shutting down"), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close {
                code: 1000,
                reason: "relay shutting down".into()
            }
        );
        assert_eq!(conns.peer_count(), 0);
    }
}

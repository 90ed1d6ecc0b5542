//! Runs the health state machine against a live [`GraphClient`].
//!
//! The driver task feeds relay events into [`transition`] and executes the
//! returned effects: it opens the client socket, runs put/get self-tests and
//! grace timers, and re-probes the relay while no peer is connected. The
//! resulting status is published on a `watch` channel.

use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use snails_shared::{ConnectionStatus, GraphValue, PeerInfo};

use crate::config::ClientConfig;
use crate::graph_client::{GraphClient, GraphEvent};
use crate::health::{transition, HealthEffect, HealthEvent, HealthState};

const HEALTH_ROOT: &str = "snails-health";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthSnapshot {
    pub status: ConnectionStatus,
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerTimings {
    pub probe_timeout: Duration,
    pub self_test_timeout: Duration,
    pub peer_grace: Duration,
    pub reprobe_interval: Duration,
}

impl From<&ClientConfig> for TrackerTimings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            probe_timeout: config.probe_timeout,
            self_test_timeout: config.self_test_timeout,
            peer_grace: config.peer_grace,
            reprobe_interval: config.reprobe_interval,
        }
    }
}

pub struct HealthTracker {
    events: mpsc::UnboundedSender<HealthEvent>,
    snapshot: watch::Receiver<HealthSnapshot>,
    task: JoinHandle<()>,
}

impl HealthTracker {
    /// Start tracking. Must be called inside a tokio runtime.
    pub fn spawn(graph: GraphClient, timings: TrackerTimings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(HealthSnapshot::default());

        let driver = Driver {
            graph_events: graph.events(),
            graph,
            timings,
            state: HealthState::new(),
            feedback: events_tx.clone(),
            snapshot: snapshot_tx,
        };
        let task = tokio::spawn(driver.run(events_rx));

        Self {
            events: events_tx,
            snapshot: snapshot_rx,
            task,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.snapshot.borrow().status
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<HealthSnapshot> {
        self.snapshot.clone()
    }

    pub fn session_started(&self) {
        let _ = self.events.send(HealthEvent::SessionStarted);
    }

    pub fn session_ended(&self) {
        let _ = self.events.send(HealthEvent::SessionEnded);
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for HealthTracker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Driver {
    graph: GraphClient,
    graph_events: broadcast::Receiver<GraphEvent>,
    timings: TrackerTimings,
    state: HealthState,
    feedback: mpsc::UnboundedSender<HealthEvent>,
    snapshot: watch::Sender<HealthSnapshot>,
}

impl Driver {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<HealthEvent>) {
        let mut reprobe = tokio::time::interval(self.timings.reprobe_interval);
        reprobe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = reprobe.tick() => {
                    if self.state.peers.is_empty() {
                        self.spawn_probe();
                    }
                }
                Some(event) = events.recv() => self.apply(event),
                event = self.graph_events.recv() => match event {
                    Ok(GraphEvent::PeerHi(peer)) => self.apply(HealthEvent::PeerHi(peer)),
                    Ok(GraphEvent::PeerBye(peer)) => self.apply(HealthEvent::PeerBye { id: peer.id }),
                    Ok(GraphEvent::NodeUpdated(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Health tracker lagged behind graph events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    fn apply(&mut self, event: HealthEvent) {
        let before = self.state.status;
        let effects = transition(&mut self.state, event);
        if self.state.status != before {
            info!(from = %before, to = %self.state.status, "Connection status changed");
        }

        let snapshot = HealthSnapshot {
            status: self.state.status,
            peers: self.state.peers.values().cloned().collect(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });

        for effect in effects {
            self.run_effect(effect);
        }
    }

    fn run_effect(&self, effect: HealthEffect) {
        let feedback = self.feedback.clone();
        match effect {
            HealthEffect::ConnectClient => {
                let graph = self.graph.clone();
                tokio::spawn(async move {
                    if let Err(e) = graph.connect().await {
                        warn!(error = %e, "Relay connection failed");
                        let _ = feedback.send(HealthEvent::ProbeFailed);
                    }
                });
            }
            HealthEffect::StartSelfTest { epoch } => {
                let graph = self.graph.clone();
                let limit = self.timings.self_test_timeout;
                tokio::spawn(async move {
                    let ok = matches!(
                        tokio::time::timeout(limit, self_test(&graph)).await,
                        Ok(true)
                    );
                    debug!(epoch, ok, "Self-test finished");
                    let _ = feedback.send(HealthEvent::SelfTestFinished { epoch, ok });
                });
            }
            HealthEffect::StartGraceTimer { epoch } => {
                let grace = self.timings.peer_grace;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = feedback.send(HealthEvent::GraceElapsed { epoch });
                });
            }
        }
    }

    fn spawn_probe(&self) {
        let feedback = self.feedback.clone();
        let url = self.graph.relay_url().map(str::to_string);
        let limit = self.timings.probe_timeout;
        tokio::spawn(async move {
            let event = match url {
                Some(url) if probe(&url, limit).await => HealthEvent::ProbeSucceeded,
                _ => HealthEvent::ProbeFailed,
            };
            let _ = feedback.send(event);
        });
    }
}

/// Whether a WebSocket to `url` opens within `limit`.
async fn probe(url: &str, limit: Duration) -> bool {
    match tokio::time::timeout(limit, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((mut ws, _))) => {
            let _ = ws.close(None).await;
            true
        }
        Ok(Err(e)) => {
            debug!(url = %url, error = %e, "Relay probe failed");
            false
        }
        Err(_) => {
            debug!(url = %url, "Relay probe timed out");
            false
        }
    }
}

/// Write a nonce under this client's health node and read it back from the
/// relay.
async fn self_test(graph: &GraphClient) -> bool {
    let soul = format!("{HEALTH_ROOT}/{}", graph.peer_id());
    let nonce = uuid::Uuid::new_v4().simple().to_string();

    if let Err(e) = graph.put_value(&soul, "nonce", json!(nonce)).await {
        debug!(error = %e, "Self-test write failed");
        return false;
    }
    match graph.fetch(&soul, Some("nonce")).await {
        Ok(Some(node)) => node.get("nonce") == Some(&GraphValue::Text(nonce)),
        Ok(None) => false,
        Err(e) => {
            debug!(error = %e, "Self-test read failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timings() -> TrackerTimings {
        TrackerTimings {
            probe_timeout: Duration::from_secs(2),
            self_test_timeout: Duration::from_secs(2),
            peer_grace: Duration::from_secs(2),
            reprobe_interval: Duration::from_secs(30),
        }
    }

    fn relay_peer() -> PeerInfo {
        PeerInfo {
            id: "relay-1".into(),
            url: "ws://localhost:8765/gun".into(),
        }
    }

    async fn wait_for(tracker: &HealthTracker, status: ConnectionStatus) {
        let mut rx = tracker.watch();
        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| s.status == status))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn local_client_stays_red() {
        let tracker = HealthTracker::spawn(GraphClient::local(), timings());
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(tracker.status(), ConnectionStatus::Red);
        assert!(tracker.snapshot().peers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_peer_goes_yellow_then_red() {
        let graph = GraphClient::local();
        let tracker = HealthTracker::spawn(graph.clone(), timings());
        tokio::task::yield_now().await;

        // Without a relay socket the self-test cannot read back its write.
        graph.emit(GraphEvent::PeerHi(relay_peer()));
        wait_for(&tracker, ConnectionStatus::Yellow).await;
        assert_eq!(tracker.snapshot().peers, vec![relay_peer()]);

        graph.emit(GraphEvent::PeerBye(relay_peer()));
        wait_for(&tracker, ConnectionStatus::Red).await;
        assert!(tracker.snapshot().peers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_publishing() {
        let graph = GraphClient::local();
        let tracker = HealthTracker::spawn(graph.clone(), timings());
        tracker.shutdown();
        tokio::task::yield_now().await;

        graph.emit(GraphEvent::PeerHi(relay_peer()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(tracker.status(), ConnectionStatus::Red);
    }
}

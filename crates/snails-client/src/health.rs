//! Peer connection health as an explicit state machine.
//!
//! [`transition`] is pure: it takes the current [`HealthState`] and an event,
//! updates the state and returns the effects the driver must run. Every
//! self-test and grace timer carries the epoch it was started in. A
//! completion from an older epoch is ignored, so a slow self-test can never
//! overwrite the outcome of a newer one.

use std::collections::BTreeMap;

use snails_shared::{ConnectionStatus, PeerInfo};

pub type Epoch = u64;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthState {
    pub status: ConnectionStatus,
    pub peers: BTreeMap<String, PeerInfo>,
    pub self_test_epoch: Epoch,
    pub grace_epoch: Epoch,
    /// A user session is initialized.
    pub session: bool,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    fn healthy_status(&self) -> ConnectionStatus {
        if self.session {
            ConnectionStatus::Blue
        } else {
            ConnectionStatus::Green
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    /// The relay answered a WebSocket open.
    ProbeSucceeded,
    ProbeFailed,
    PeerHi(PeerInfo),
    PeerBye { id: String },
    GraceElapsed { epoch: Epoch },
    SelfTestFinished { epoch: Epoch, ok: bool },
    SessionStarted,
    SessionEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEffect {
    /// Open the graph client's relay socket.
    ConnectClient,
    /// Run a put/get round trip and report back with this epoch.
    StartSelfTest { epoch: Epoch },
    /// Report `GraceElapsed` with this epoch once the grace period is over.
    StartGraceTimer { epoch: Epoch },
}

pub fn transition(state: &mut HealthState, event: HealthEvent) -> Vec<HealthEffect> {
    match event {
        HealthEvent::ProbeSucceeded => {
            if state.peers.is_empty() {
                vec![HealthEffect::ConnectClient]
            } else {
                Vec::new()
            }
        }
        HealthEvent::ProbeFailed => {
            if state.peers.is_empty() {
                state.status = ConnectionStatus::Red;
            }
            Vec::new()
        }
        HealthEvent::PeerHi(peer) => {
            state.peers.insert(peer.id.clone(), peer);
            // A hi cancels any pending grace timer.
            state.grace_epoch += 1;
            state.self_test_epoch += 1;
            vec![HealthEffect::StartSelfTest {
                epoch: state.self_test_epoch,
            }]
        }
        HealthEvent::SelfTestFinished { epoch, ok } => {
            if epoch != state.self_test_epoch {
                return Vec::new();
            }
            state.status = if ok {
                state.healthy_status()
            } else {
                ConnectionStatus::Yellow
            };
            Vec::new()
        }
        HealthEvent::PeerBye { id } => {
            state.peers.remove(&id);
            state.grace_epoch += 1;
            vec![HealthEffect::StartGraceTimer {
                epoch: state.grace_epoch,
            }]
        }
        HealthEvent::GraceElapsed { epoch } => {
            if epoch != state.grace_epoch {
                return Vec::new();
            }
            if state.peers.is_empty() {
                state.status = ConnectionStatus::Red;
                // Invalidate any self-test still in flight.
                state.self_test_epoch += 1;
                Vec::new()
            } else {
                state.self_test_epoch += 1;
                vec![HealthEffect::StartSelfTest {
                    epoch: state.self_test_epoch,
                }]
            }
        }
        HealthEvent::SessionStarted => {
            state.session = true;
            if state.status == ConnectionStatus::Green {
                state.status = ConnectionStatus::Blue;
            }
            Vec::new()
        }
        HealthEvent::SessionEnded => {
            state.session = false;
            if state.status == ConnectionStatus::Blue {
                state.status = ConnectionStatus::Green;
            }
            Vec::new()
        }
    }
}

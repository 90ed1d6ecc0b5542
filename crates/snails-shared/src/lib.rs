// Types, permits, signatures and the graph model shared by the relay and its clients.

pub mod adr36;
pub mod constants;
pub mod error;
pub mod graph;
pub mod permit;
pub mod protocol;
pub mod types;

pub use error::{GraphError, SignatureError, SnailsError};
pub use graph::{GraphNode, GraphValue, State};
pub use permit::{Permit, PermitParams, PubKey, StdSignature};
pub use protocol::WireMessage;
pub use types::{Address, ConnectionStatus, PeerInfo, PermitType};

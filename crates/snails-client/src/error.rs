use thiserror::Error;

use snails_shared::{GraphError, SignatureError};

/// Failures of the wallet bridge. Never retried.
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("No wallet is available")]
    Unavailable,

    #[error("Request rejected by the user")]
    Rejected,

    #[error("Signing failed: {0}")]
    Signing(String),
}

impl From<SignatureError> for WalletError {
    fn from(e: SignatureError) -> Self {
        WalletError::Signing(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Room is full: {0}")]
    RoomFull(String),

    #[error("Premium subscription required")]
    PremiumRequired,

    #[error("Not connected to a room")]
    NotInRoom,

    #[error("Message is empty")]
    EmptyMessage,

    #[error("A poll needs at least two options")]
    InvalidPoll,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Write rejected by relay: {0}")]
    Write(String),

    #[error("Not connected to a relay")]
    NotConnected,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Chat error: {0}")]
    Chat(#[from] ChatError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

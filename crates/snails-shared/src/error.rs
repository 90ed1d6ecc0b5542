use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnailsError {
    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("Invalid public key")]
    InvalidPubKey,

    #[error("Invalid signature encoding")]
    InvalidSignature,

    #[error("Signature does not match the signed document")]
    VerificationFailed,

    #[error("Public key does not belong to address {0}")]
    AddressMismatch(String),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid bech32 address: {0}")]
    Bech32(String),
}

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Invalid soul: {0:?}")]
    InvalidSoul(String),

    #[error("Node {soul} carries metadata for soul {meta}")]
    SoulMismatch { soul: String, meta: String },

    #[error("Field {0:?} has no state")]
    MissingState(String),

    #[error("Unsupported value for field {0:?}")]
    UnsupportedValue(String),
}

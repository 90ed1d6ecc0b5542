pub mod algorithm;
pub mod chat;
pub mod collections;
pub mod status;

pub use algorithm::{AlgorithmService, ContentStats, Counter};
pub use chat::{ChatMessage, ChatRoom, ChatService, ChatSummary, DirectMessage, MessageKind};
pub use collections::{Collection, CollectionService, ContractQuerier, LcdQuerier, MintStatus};
pub use status::{ApiStatus, ApiStatusMonitor};

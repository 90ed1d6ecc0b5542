//! # snails-client
//!
//! Client side of the SNAILS. graph: everything an application embeds to
//! talk to a relay.
//!
//! - [`DatabaseContext`]: graph reads and writes, sessions, connection status
//! - [`PermitSigner`] with its [`PermitCache`]: wallet-signed permits
//! - [`health`] and [`tracker`]: the red/yellow/green/blue connection light
//! - [`services`]: collections, engagement counters, chat, API status
//!
//! The library only emits `tracing` events; the embedding binary installs
//! the subscriber.

pub mod config;
pub mod context;
pub mod error;
pub mod graph_client;
pub mod health;
pub mod permit_cache;
pub mod services;
pub mod tracker;
pub mod wallet;

pub use config::ClientConfig;
pub use context::DatabaseContext;
pub use error::{ChatError, ClientError, Result, WalletError};
pub use graph_client::{GraphClient, GraphEvent, NodeSubscription};
pub use health::{HealthEffect, HealthEvent, HealthState};
pub use permit_cache::PermitCache;
pub use tracker::{HealthSnapshot, HealthTracker};
pub use wallet::{LocalWallet, PermitSigner, WalletBridge};

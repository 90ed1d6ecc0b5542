//! # snails-store
//!
//! Durable storage for graph nodes on the relay, backed by SQLite.
//!
//! Each row is one field of one node: `(soul, key, value, state)`. Writes go
//! through the shared merge policy, so the table only ever holds the winning
//! version of every field.

pub mod database;
pub mod graph;
pub mod migrations;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use graph::StoreStats;

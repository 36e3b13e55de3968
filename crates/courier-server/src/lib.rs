//! # courier-server
//!
//! Axum HTTP + WebSocket server for the courier messaging core.
//!
//! - [`registry`]: the one active session per account
//! - [`gateway`]: socket lifecycle, authenticate handshake, heartbeat
//! - [`delivery`]: persist-then-push message delivery and receipts
//! - [`presence`]: online/offline broadcast with a reconnect grace window
//! - [`store`]: authoritative `SQLite` message store
//! - [`server`]: router, shared state, listener

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod gateway;
pub mod health;
pub mod identity;
pub mod metrics;
pub mod presence;
pub mod rate_limit;
pub mod registry;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod sweep;

pub use config::ServerConfig;
pub use identity::{IdentityVerifier, JwtIdentityVerifier};
pub use server::{AppState, CourierServer, ServerHandle};
pub use store::{MessageStore, SqliteMessageStore};

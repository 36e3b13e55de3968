//! # courier-client
//!
//! Client half of the courier sync engine.
//!
//! - [`gateway`]: connection state machine, reconnect backoff, outbound queue, ping/pong
//! - [`delivery`]: optimistic send, idempotent retry, receipts, push and poll merge
//! - [`store`]: reconciliation cache with dedup, eviction, TTL entries, corruption healing
//! - [`typing`]: typing indicators with local auto-clear
//! - [`api`]: HTTP seam to the server
//! - [`client`]: the [`ChatClient`] façade tying them together

#![deny(unsafe_code)]

pub mod api;
pub mod client;
pub mod config;
pub mod delivery;
pub mod gateway;
pub mod store;
pub mod typing;

pub use api::{ChatApi, HttpChatApi};
pub use client::ChatClient;
pub use config::ClientConfig;
pub use delivery::DeliveryPipeline;
pub use gateway::{ConnectionGateway, GatewayState, Notice};
pub use store::ReconciliationStore;

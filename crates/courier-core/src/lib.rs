//! # courier-core
//!
//! Shared vocabulary for the courier session and delivery sync engine.
//!
//! - **IDs**: branded newtypes for accounts, contacts, devices, sockets, messages
//! - **Messages**: the [`Message`](message::Message) record and its forward-only status lattice
//! - **Dedup**: the duplicate-detection and merge rule used on both ends
//! - **Events**: real-time channel events exchanged over the gateway
//! - **Errors**: the [`CourierError`] taxonomy with stable wire codes
//! - **Clock**: injectable time source for sweeps and TTLs
//! - **Crypto**: optional pluggable encryptor capability
//! - **Logging**: `tracing` subscriber bootstrap
//! - **Wire**: HTTP request/response bodies

#![deny(unsafe_code)]

pub mod clock;
pub mod crypto;
pub mod dedup;
pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod message;
pub mod summary;
pub mod validation;
pub mod wire;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use errors::{CourierError, ErrorBody, Result};
pub use ids::{AccountId, ClientMessageId, ContactId, DeviceId, MessageId, SocketId};
pub use message::{Message, MessageKind, MessageStatus};

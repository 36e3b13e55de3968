//! Client side of the real-time channel.
//!
//! [`machine`] holds the transport-free state machine; [`runner`] drives it
//! over tokio-tungstenite.

pub mod machine;
pub mod runner;

pub use machine::{BackoffPolicy, CloseReason, GatewayState, Notice};
pub use runner::{ConnectionGateway, Credentials, GatewayOptions};

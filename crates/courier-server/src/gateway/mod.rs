//! WebSocket connections: per-socket state, fan-out, liveness, and the
//! authenticate handshake.

pub mod connection;
pub mod heartbeat;
pub mod hub;
pub mod socket;

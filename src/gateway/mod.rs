//! Gateway client surface
//!
//! TCP server for external client applications: the framed binary protocol
//! codec, the per-connection record, and the connection server with its
//! broadcast fan-out. One handler thread per accepted socket; indications
//! from the collector and the OAD engine are broadcast to every live
//! connection.

pub mod codec;
pub mod connection;
pub mod server;

pub use connection::GatewayConnection;
pub use server::{Broadcaster, ConnectionRegistry, GatewayServer, HandlerCtx};

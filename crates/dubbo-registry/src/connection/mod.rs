//! Registry connections
//!
//! Both sides multiplex request/response pairs and heartbeats over one
//! WebSocket stream. The client side correlates responses to in-flight
//! requests; the server side decodes registry requests and tracks which
//! service keys its peer owns.

pub mod client;
pub mod server;

pub use client::{ClientConnection, ConnectionEvent, ConnectionHandle, ConnectionOptions, Inbound};
pub use server::{Outbound, PeerMap, ServerConnection};

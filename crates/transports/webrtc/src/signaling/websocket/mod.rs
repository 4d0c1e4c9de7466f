//! WebSocket signaling relay
//!
//! Peers connect over a plain WebSocket and exchange the JSON events of
//! [`crate::signaling::protocol`]. Negotiation envelopes are forwarded only to
//! the other members of the sender's room.

mod handler;
mod server;

pub use handler::{SharedState, WsPeerConnection};
pub use server::{RelayServer, RelayServerHandle};

//! Signaling relay: wire protocol, room bookkeeping, server and client
//!
//! - [`protocol`] - JSON events exchanged with the relay
//! - [`room`] - room membership rules
//! - [`websocket`] - the relay server
//! - [`client`] - relay connection used by peers

pub mod client;
pub mod protocol;
pub mod room;
pub mod websocket;

pub use client::{describe_connect_error, RelayHandle, SignalingClient};
pub use protocol::{ClientEvent, RelayedEnvelope, ServerEvent};
pub use room::RoomRegistry;
pub use websocket::{RelayServer, RelayServerHandle, SharedState};

use crate::peer::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;

/// Outbound half of the relay as the negotiator sees it
#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Relay a local offer to the other room member(s)
    async fn send_offer(&self, offer: &SessionDescription) -> Result<()>;

    /// Relay a local answer to the other room member(s)
    async fn send_answer(&self, answer: &SessionDescription) -> Result<()>;

    /// Relay a gathered local candidate to the other room member(s)
    async fn send_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;
}

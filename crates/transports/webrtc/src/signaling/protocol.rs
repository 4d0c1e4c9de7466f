//! Relay wire protocol
//!
//! Every WebSocket text frame carries exactly one event, adjacently tagged:
//!
//! ```json
//! {"event": "join-room", "data": "R1"}
//! {"event": "room-joined", "data": {"roomId": "R1", "peers": ["5f0c…"]}}
//! {"event": "offer", "data": {"from": "5f0c…", "payload": {"type": "offer", "sdp": "…"}}}
//! ```
//!
//! Negotiation payloads are opaque to the relay: it forwards whatever JSON the
//! sender supplied and only adds the sender id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes carried by [`ServerEvent::Error`]
pub mod error_codes {
    /// Join rejected, the room is at capacity
    pub const ROOM_FULL: &str = "room-full";

    /// Room id was empty
    pub const INVALID_ROOM: &str = "invalid-room";
}

/// Events sent by a peer to the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Join (or create) a room
    JoinRoom(String),

    /// Session description offer for the other room member(s)
    Offer(Value),

    /// Session description answer for the other room member(s)
    Answer(Value),

    /// Trickled connectivity candidate for the other room member(s)
    IceCandidate(Value),
}

impl ClientEvent {
    /// Event name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom(_) => "join-room",
            ClientEvent::Offer(_) => "offer",
            ClientEvent::Answer(_) => "answer",
            ClientEvent::IceCandidate(_) => "ice-candidate",
        }
    }

    /// Serialize to a text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a text frame
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// A negotiation envelope as delivered by the relay, stamped with its sender
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayedEnvelope {
    /// Relay-assigned id of the sending peer
    pub from: String,

    /// Payload exactly as the sender supplied it
    pub payload: Value,
}

/// Error notification from the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayErrorPayload {
    /// Machine-readable code (see [`error_codes`])
    pub code: String,

    /// Human-readable description
    pub message: String,
}

/// Events sent by the relay to a peer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Sent once after the WebSocket handshake with the peer's assigned id
    Connected {
        /// Relay-assigned peer id
        #[serde(rename = "peerId")]
        peer_id: String,
    },

    /// Reply to `join-room` listing the other current members
    RoomJoined {
        /// Joined room
        #[serde(rename = "roomId")]
        room_id: String,
        /// Other members, in join order, never including the joiner
        peers: Vec<String>,
    },

    /// Another peer joined the room
    PeerConnected(String),

    /// Another peer left the room
    PeerDisconnected(String),

    /// Forwarded offer
    Offer(RelayedEnvelope),

    /// Forwarded answer
    Answer(RelayedEnvelope),

    /// Forwarded ICE candidate
    IceCandidate(RelayedEnvelope),

    /// Request rejected
    Error(RelayErrorPayload),
}

impl ServerEvent {
    /// Event name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::RoomJoined { .. } => "room-joined",
            ServerEvent::PeerConnected(_) => "peer-connected",
            ServerEvent::PeerDisconnected(_) => "peer-disconnected",
            ServerEvent::Offer(_) => "offer",
            ServerEvent::Answer(_) => "answer",
            ServerEvent::IceCandidate(_) => "ice-candidate",
            ServerEvent::Error(_) => "error",
        }
    }

    /// Build an error event
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerEvent::Error(RelayErrorPayload {
            code: code.to_string(),
            message: message.into(),
        })
    }

    /// Serialize to a text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a text frame
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

//! Platform peer-connection seam
//!
//! The negotiator drives a [`PeerTransport`] and listens for the
//! [`TransportEvent`]s its [`TransportFactory`] reports. [`RtcTransportFactory`]
//! is the real implementation over the `webrtc` crate; [`loopback`] connects two
//! transports inside one process.

pub mod loopback;
mod rtc;

pub use loopback::LoopbackFactory;
pub use rtc::{RtcPeerTransport, RtcTransportFactory};

use crate::channels::FrameChannel;
use crate::config::{DataChannelMode, SessionConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as browsers serialize it: `{"type": "offer", "sdp": "…"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Parse a relayed payload
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::SdpError(format!("Invalid session description: {}", e)))
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Connectivity candidate as browsers serialize it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Parse a relayed payload
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::IceCandidateError(format!("Invalid candidate: {}", e)))
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Underlying connectivity state reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A remote media track announced by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMedia {
    pub track_id: String,
    /// `audio` or `video`
    pub kind: String,
    pub stream_id: String,
}

/// Something the platform connection reports asynchronously
pub enum TransportEvent {
    /// Local candidate gathered; to be relayed to the other peer
    IceCandidate(IceCandidate),
    /// Connectivity state changed
    StateChanged(TransportState),
    /// The remote peer opened a data channel
    DataChannel(Arc<dyn FrameChannel>),
    /// The remote peer's media arrived
    RemoteTrack(RemoteMedia),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            TransportEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            TransportEvent::DataChannel(c) => f.debug_tuple("DataChannel").field(&c.label()).finish(),
            TransportEvent::RemoteTrack(m) => f.debug_tuple("RemoteTrack").field(m).finish(),
        }
    }
}

/// One platform peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Produce a local offer (not yet applied)
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Produce a local answer to the applied remote offer (not yet applied)
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Apply a remote candidate; fails if no remote description is set yet
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn create_data_channel(
        &self,
        label: &str,
        mode: DataChannelMode,
    ) -> Result<Arc<dyn FrameChannel>>;

    /// Close the connection; must be safe to call more than once
    async fn close(&self) -> Result<()>;
}

/// Builds platform connections
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create one connection reporting its events on `events`
    async fn create(
        &self,
        config: &SessionConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_description_wire_format() {
        let desc = SessionDescription::offer("v=0\r\n");
        assert_eq!(desc.to_value().unwrap(), json!({"type": "offer", "sdp": "v=0\r\n"}));

        let parsed = SessionDescription::from_value(json!({"type": "answer", "sdp": "v=0"})).unwrap();
        assert_eq!(parsed.sdp_type, SdpType::Answer);

        let err = SessionDescription::from_value(json!({"type": "bogus", "sdp": ""})).unwrap_err();
        assert!(err.is_peer_error());
    }

    #[test]
    fn test_ice_candidate_browser_shape() {
        let candidate = IceCandidate::from_value(json!({
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0,
            "usernameFragment": "abcd"
        }))
        .unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));

        let value = IceCandidate {
            candidate: "candidate:x".to_string(),
            ..Default::default()
        }
        .to_value()
        .unwrap();
        assert_eq!(value, json!({"candidate": "candidate:x"}));
    }
}

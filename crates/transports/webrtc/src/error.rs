//! Error types for the relay, negotiation and data-channel layers

/// Result type alias using the crate Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in signaling, negotiation and channel operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Relay connection or routing error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Room join rejected because the room is at capacity
    #[error("Room {room_id} is full ({capacity} peers)")]
    RoomFull {
        /// Room that rejected the join
        room_id: String,
        /// Configured capacity
        capacity: usize,
    },

    /// Peer not found
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Platform peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Send attempted while no open data channel is attached
    #[error("Data channel is not open")]
    ChannelNotOpen,

    /// Operation not valid in the current session state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// File transfer error
    #[error("Transfer error: {0}")]
    TransferError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::WebSocketError(_)
                | Error::OperationTimeout(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error is a negotiation (peer-related) error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::PeerConnectionError(_)
                | Error::IceCandidateError(_)
                | Error::SdpError(_)
                | Error::WebRtcError(_)
        )
    }
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Error::WebRtcError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocketError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: test");

        let err = Error::RoomFull {
            room_id: "R1".to_string(),
            capacity: 2,
        };
        assert_eq!(err.to_string(), "Room R1 is full (2 peers)");
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::SignalingError("test".to_string()).is_retryable());
        assert!(Error::OperationTimeout("test".to_string()).is_retryable());
        assert!(!Error::ChannelNotOpen.is_retryable());
        assert!(!Error::InvalidConfig("test".to_string()).is_retryable());
    }

    #[test]
    fn test_error_is_peer_error() {
        assert!(Error::SdpError("test".to_string()).is_peer_error());
        assert!(Error::IceCandidateError("test".to_string()).is_peer_error());
        assert!(!Error::TransferError("test".to_string()).is_peer_error());
        assert!(!Error::ChannelNotOpen.is_peer_error());
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = Error::from(parse_err);
        assert!(matches!(err, Error::SerializationError(_)));
    }
}

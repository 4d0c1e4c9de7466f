//! Configuration types for the relay, relay client, sessions and file transfer

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default relay listening port
pub const DEFAULT_RELAY_PORT: u16 = 3001;

/// Default file chunk size (16 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Signaling relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Listening host (default: 0.0.0.0)
    pub host: String,

    /// Listening port (default: 3001)
    pub port: u16,

    /// Maximum members per room (default: 2, None = unbounded)
    pub max_room_size: Option<usize>,

    /// Outbound queue depth per connected peer (default: 128)
    pub outbound_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_RELAY_PORT,
            max_room_size: Some(2),
            outbound_buffer: 128,
        }
    }
}

impl RelayConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.host.trim().is_empty() {
            return Err(Error::InvalidConfig("host must not be empty".to_string()));
        }

        if self.max_room_size == Some(0) {
            return Err(Error::InvalidConfig(
                "max_room_size must be at least 1 (use None for unbounded rooms)".to_string(),
            ));
        }

        if self.outbound_buffer == 0 {
            return Err(Error::InvalidConfig(
                "outbound_buffer must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Socket address string to bind
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Set the listening host
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Set the listening port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the room capacity
    pub fn with_max_room_size(mut self, max_room_size: Option<usize>) -> Self {
        self.max_room_size = max_room_size;
        self
    }
}

/// Relay client connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingClientConfig {
    /// Relay URL (ws:// or wss://; http(s):// is rewritten)
    pub url: String,

    /// Connection attempts before giving up (default: 5)
    pub max_connect_attempts: u32,

    /// Fixed delay between attempts in milliseconds (default: 1000)
    pub retry_delay_ms: u64,

    /// Per-attempt timeout in milliseconds (default: 10000)
    pub connect_timeout_ms: u64,
}

impl Default for SignalingClientConfig {
    fn default() -> Self {
        Self {
            url: format!("ws://localhost:{}", DEFAULT_RELAY_PORT),
            max_connect_attempts: 5,
            retry_delay_ms: 1000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl SignalingClientConfig {
    /// Create a config for the given relay URL with default retry settings
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        let url = self.websocket_url();
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "url must start with ws://, wss://, http:// or https://, got {}",
                self.url
            )));
        }

        if self.max_connect_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_connect_attempts must be at least 1".to_string(),
            ));
        }

        if self.connect_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Relay URL with an http(s) scheme rewritten to ws(s)
    pub fn websocket_url(&self) -> String {
        let url = self.url.trim();
        if let Some(rest) = url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else if let Some(rest) = url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else {
            url.to_string()
        }
    }

    /// Delay between connection attempts
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Timeout for one connection attempt
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Set the attempt budget
    pub fn with_max_connect_attempts(mut self, attempts: u32) -> Self {
        self.max_connect_attempts = attempts;
        self
    }

    /// Set the delay between attempts
    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    /// Set the per-attempt timeout
    pub fn with_connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Data channel mode
///
/// Determines the reliability of message delivery. The multiplexed session
/// channel is always created `Reliable`; `Unreliable` exists for callers that
/// open auxiliary channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataChannelMode {
    /// Reliable, ordered delivery (default)
    Reliable,
    /// Unreliable, unordered delivery (low latency)
    Unreliable,
}

impl DataChannelMode {
    /// Whether messages are delivered in order
    pub fn ordered(&self) -> bool {
        match self {
            DataChannelMode::Reliable => true,
            DataChannelMode::Unreliable => false,
        }
    }

    /// Retransmit limit (None = unlimited)
    pub fn max_retransmits(&self) -> Option<u16> {
        match self {
            DataChannelMode::Reliable => None,
            DataChannelMode::Unreliable => Some(0),
        }
    }
}

/// Per-session negotiation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Label of the multiplexed data channel (default: "messages")
    pub data_channel_label: String,

    /// Delivery mode of the multiplexed data channel (default: Reliable)
    pub data_channel_mode: DataChannelMode,

    /// Time allowed from offer/answer to Connected before the session fails
    /// (default: 30000ms)
    pub negotiation_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
            data_channel_label: "messages".to_string(),
            data_channel_mode: DataChannelMode::Reliable,
            negotiation_timeout_ms: 30_000,
        }
    }
}

impl SessionConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN server must start with stun: or stuns:, got {}",
                    url
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN server must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        if self.data_channel_label.is_empty() {
            return Err(Error::InvalidConfig(
                "data_channel_label must not be empty".to_string(),
            ));
        }

        if self.data_channel_mode != DataChannelMode::Reliable {
            return Err(Error::InvalidConfig(
                "the multiplexed data channel must be reliable and ordered".to_string(),
            ));
        }

        if self.negotiation_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "negotiation_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Negotiation timeout as a Duration
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Add TURN servers
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Set the negotiation timeout
    pub fn with_negotiation_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.negotiation_timeout_ms = timeout_ms;
        self
    }
}

/// File transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Chunk size in bytes (default: 16 KiB)
    pub chunk_size: usize,

    /// Pause between chunks in milliseconds (default: 10)
    pub inter_chunk_delay_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            inter_chunk_delay_ms: 10,
        }
    }
}

impl TransferConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> crate::Result<()> {
        if self.chunk_size == 0 || self.chunk_size > crate::channels::MAX_MESSAGE_SIZE {
            return Err(crate::Error::InvalidConfig(format!(
                "chunk_size must be in range 1-{}, got {}",
                crate::channels::MAX_MESSAGE_SIZE,
                self.chunk_size
            )));
        }
        Ok(())
    }

    /// Pause between chunks
    pub fn inter_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.inter_chunk_delay_ms)
    }
}

//! Two-peer WebRTC sessions: signaling relay, negotiation and a multiplexed data channel
//!
//! # Features
//!
//! - **Signaling relay**: WebSocket server with room-scoped forwarding of
//!   offers, answers and ICE candidates, plus the matching client
//! - **Session negotiation**: `Idle → Offering → AnswerPending → Connected`
//!   state machine with trickle ICE, candidate queueing and a negotiation timeout
//! - **Data channel multiplexing**: one ordered, reliable channel shared by
//!   chat, games, playback control and file transfer, demultiplexed by `type`
//! - **File transfer**: 16 KiB chunks with strict in-order reassembly
//!
//! # Architecture
//!
//! ```text
//!  Peer A                         Relay                        Peer B
//!  SessionController  <-- join / offer / answer / ice -->  SessionController
//!   └─ Negotiator                                           └─ Negotiator
//!       └─ PeerTransport  <======= peer connection =======>     └─ PeerTransport
//!           └─ Multiplexer  <==== "messages" channel ====>          └─ Multiplexer
//!               ├─ chat, game-move, video-control handlers
//!               └─ FileTransfers (file-metadata + file-chunk)
//! ```
//!
//! # Example
//!
//! ```
//! use duetlink_webrtc::{RelayConfig, SessionConfig};
//!
//! let relay = RelayConfig::default();
//! assert_eq!(relay.port, 3001);
//! assert_eq!(relay.max_room_size, Some(2));
//!
//! let session = SessionConfig::default();
//! assert_eq!(session.data_channel_label, "messages");
//! assert!(session.validate().is_ok());
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use duetlink_webrtc::{
//!     FileTransfers, Multiplexer, Negotiator, RtcTransportFactory, SessionConfig,
//!     SessionController, SignalingClient, SignalingClientConfig, TransferConfig,
//! };
//! use duetlink_webrtc::channels::messages::ChatMessage;
//!
//! # async fn example() -> duetlink_webrtc::Result<()> {
//! let client = SignalingClient::connect(SignalingClientConfig::new("ws://localhost:3001")).await?;
//! let (relay, events) = client.into_parts();
//!
//! let mux = Multiplexer::new();
//! mux.subscribe_to::<ChatMessage, _>(|msg| println!("peer: {}", msg.text));
//! let _files = FileTransfers::install(&mux, TransferConfig::default())?;
//!
//! let negotiator = Negotiator::new(
//!     SessionConfig::default(),
//!     Arc::new(RtcTransportFactory::new()),
//!     Arc::new(relay.clone()),
//!     mux,
//! )?;
//! let controller = SessionController::new(negotiator);
//!
//! relay.join_room("R1")?;
//! controller.run(events).await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod channels;
pub mod config;
pub mod error;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod transfer;

// Re-exports for public API
pub use channels::{DataChannel, FrameChannel, Multiplexer};
pub use config::{
    DataChannelMode, RelayConfig, SessionConfig, SignalingClientConfig, TransferConfig,
    TurnServerConfig,
};
pub use error::{Error, Result};
pub use peer::{IceCandidate, LoopbackFactory, RtcTransportFactory, SessionDescription};
pub use session::{NegotiationState, Negotiator, SessionController, SessionSnapshot};
pub use signaling::{RelayHandle, RelayServer, RelayServerHandle, SignalRelay, SignalingClient};
pub use transfer::{FileTransfers, TransferEvent, TransferRecord, TransferStatus};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

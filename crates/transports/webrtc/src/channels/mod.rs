//! Data channel management and multiplexing
//!
//! One ordered, reliable data channel per session carries every application
//! sub-protocol. This module provides:
//!
//! - [`FrameChannel`] - the seam over a concrete channel (text/binary frames
//!   in, [`ChannelEvent`]s out)
//! - [`DataChannel`] - implementation over a `webrtc` `RTCDataChannel`
//! - [`MemoryChannel`] - in-process channel pair
//! - [`Multiplexer`] - kind-tagged envelope dispatch with a single writer
//! - [`messages`] - typed sub-protocol envelopes
//!
//! # Example
//!
//! ```ignore
//! use duetlink_webrtc::channels::{messages::ChatMessage, Multiplexer};
//!
//! let mux = Multiplexer::new();
//! mux.subscribe_to(|chat: ChatMessage| println!("peer says {}", chat.text));
//! mux.attach(channel);
//! mux.send_envelope(&ChatMessage::text("hi")).await?;
//! ```

mod data_channel;
mod memory;
pub mod messages;
mod mux;

pub use data_channel::DataChannel;
pub use memory::{channel_pair, MemoryChannel};
pub use messages::{EnvelopeKind, KIND_FIELD};
pub use mux::{ChunkSink, Handler, HandlerId, Multiplexer};

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

/// Largest single frame written to a channel (browsers reject larger SCTP
/// messages)
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Events buffered for a channel before anyone subscribes
const MAX_BACKLOG: usize = 1024;

/// One data-channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame
    Text(String),
    /// Binary frame
    Binary(Bytes),
}

impl Frame {
    /// Payload length in bytes
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Something that happened on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Channel became open
    Open,
    /// Frame received
    Frame(Frame),
    /// Channel closed (by either side)
    Closed,
}

/// Data channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    /// Channel is being created
    Connecting,
    /// Channel is open and ready for messages
    Open,
    /// Channel is closing
    Closing,
    /// Channel is closed
    Closed,
}

/// Channel statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataChannelStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Messages sent count
    pub messages_sent: u64,
    /// Messages received count
    pub messages_received: u64,
}

/// A bidirectional, message-oriented channel to the remote peer
#[async_trait]
pub trait FrameChannel: Send + Sync {
    /// Channel label
    fn label(&self) -> &str;

    /// Current state
    fn state(&self) -> DataChannelState;

    /// Whether frames can be sent
    fn is_open(&self) -> bool {
        self.state() == DataChannelState::Open
    }

    /// Send a text frame
    async fn send_text(&self, text: &str) -> Result<()>;

    /// Send a binary frame
    async fn send_binary(&self, data: &[u8]) -> Result<()>;

    /// Route this channel's events to `events`, replacing any earlier
    /// subscriber. Events that happened before the first subscription are
    /// delivered first, in order.
    fn subscribe(&self, events: mpsc::UnboundedSender<ChannelEvent>);

    /// Close the channel
    async fn close(&self) -> Result<()>;

    /// Traffic counters
    fn stats(&self) -> DataChannelStats;
}

/// Subscriber slot with a bounded backlog for events that arrive first
#[derive(Default)]
pub(crate) struct EventSink {
    inner: Mutex<SinkInner>,
}

#[derive(Default)]
struct SinkInner {
    tx: Option<mpsc::UnboundedSender<ChannelEvent>>,
    backlog: Vec<ChannelEvent>,
}

impl EventSink {
    pub(crate) fn emit(&self, label: &str, event: ChannelEvent) {
        let mut inner = self.inner.lock();
        let event = match inner.tx.as_ref() {
            Some(tx) => match tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        // No subscriber, or it went away: keep the event for the next one
        inner.tx = None;
        if inner.backlog.len() >= MAX_BACKLOG {
            warn!("Channel '{}' backlog full, dropping event", label);
            return;
        }
        inner.backlog.push(event);
    }

    pub(crate) fn subscribe(&self, tx: mpsc::UnboundedSender<ChannelEvent>) {
        let mut inner = self.inner.lock();
        for event in inner.backlog.drain(..) {
            if tx.send(event).is_err() {
                return;
            }
        }
        inner.tx = Some(tx);
    }
}

/// Lock-free traffic counters
#[derive(Default)]
pub(crate) struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl Counters {
    pub(crate) fn record_sent(&self, len: usize) {
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, len: usize) {
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DataChannelStats {
        DataChannelStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }
}

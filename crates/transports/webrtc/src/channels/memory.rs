//! In-process channel pair
//!
//! Two [`MemoryChannel`] ends deliver frames to each other in send order, with
//! the same open/closed rules as a real data channel. Used by the loopback
//! transport and by tests.

use super::{
    ChannelEvent, Counters, DataChannelState, DataChannelStats, EventSink, Frame, FrameChannel,
    MAX_MESSAGE_SIZE,
};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

/// One end of an in-process channel
pub struct MemoryChannel {
    label: String,
    state: RwLock<DataChannelState>,
    peer: Mutex<Weak<MemoryChannel>>,
    sink: EventSink,
    counters: Counters,
}

/// Create two connected ends; both start `Connecting` until [`MemoryChannel::open`]
pub fn channel_pair(label: &str) -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
    let a = Arc::new(MemoryChannel::new(label));
    let b = Arc::new(MemoryChannel::new(label));
    *a.peer.lock() = Arc::downgrade(&b);
    *b.peer.lock() = Arc::downgrade(&a);
    (a, b)
}

impl MemoryChannel {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            state: RwLock::new(DataChannelState::Connecting),
            peer: Mutex::new(Weak::new()),
            sink: EventSink::default(),
            counters: Counters::default(),
        }
    }

    /// Mark this end open and report [`ChannelEvent::Open`]
    pub fn open(&self) {
        {
            let mut state = self.state.write();
            if *state != DataChannelState::Connecting {
                return;
            }
            *state = DataChannelState::Open;
        }
        self.sink.emit(&self.label, ChannelEvent::Open);
    }

    fn remote(&self) -> Option<Arc<MemoryChannel>> {
        self.peer.lock().upgrade()
    }

    fn deliver(&self, frame: Frame) {
        if *self.state.read() != DataChannelState::Open {
            debug!("Channel '{}' not open, dropping inbound frame", self.label);
            return;
        }
        self.counters.record_received(frame.len());
        self.sink.emit(&self.label, ChannelEvent::Frame(frame));
    }

    fn mark_closed(&self) {
        {
            let mut state = self.state.write();
            if *state == DataChannelState::Closed {
                return;
            }
            *state = DataChannelState::Closed;
        }
        self.sink.emit(&self.label, ChannelEvent::Closed);
    }

    fn send_frame(&self, frame: Frame) -> Result<()> {
        if frame.len() > MAX_MESSAGE_SIZE {
            return Err(Error::DataChannelError(format!(
                "Message size {} exceeds maximum {} bytes",
                frame.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        if *self.state.read() != DataChannelState::Open {
            return Err(Error::ChannelNotOpen);
        }

        let remote = self
            .remote()
            .ok_or_else(|| Error::DataChannelError("remote end dropped".to_string()))?;
        self.counters.record_sent(frame.len());
        remote.deliver(frame);
        Ok(())
    }
}

#[async_trait]
impl FrameChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> DataChannelState {
        *self.state.read()
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.send_frame(Frame::Text(text.to_string()))
    }

    async fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.send_frame(Frame::Binary(Bytes::copy_from_slice(data)))
    }

    fn subscribe(&self, events: mpsc::UnboundedSender<ChannelEvent>) {
        self.sink.subscribe(events);
    }

    async fn close(&self) -> Result<()> {
        self.mark_closed();
        if let Some(remote) = self.remote() {
            remote.mark_closed();
        }
        Ok(())
    }

    fn stats(&self) -> DataChannelStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_in_order() {
        let (a, b) = channel_pair("messages");
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.subscribe(tx);

        a.open();
        b.open();
        a.send_text("one").await.unwrap();
        a.send_binary(&[1, 2, 3]).await.unwrap();

        assert_eq!(rx.recv().await, Some(ChannelEvent::Open));
        assert_eq!(
            rx.recv().await,
            Some(ChannelEvent::Frame(Frame::Text("one".to_string())))
        );
        assert_eq!(
            rx.recv().await,
            Some(ChannelEvent::Frame(Frame::Binary(Bytes::from_static(&[1, 2, 3]))))
        );
        assert_eq!(a.stats().messages_sent, 2);
        assert_eq!(b.stats().bytes_received, 6);
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let (a, _b) = channel_pair("messages");
        assert!(matches!(
            a.send_text("early").await,
            Err(Error::ChannelNotOpen)
        ));
    }

    #[tokio::test]
    async fn test_close_reaches_both_ends() {
        let (a, b) = channel_pair("messages");
        a.open();
        b.open();
        a.close().await.unwrap();
        assert_eq!(a.state(), DataChannelState::Closed);
        assert_eq!(b.state(), DataChannelState::Closed);
        assert!(b.send_text("late").await.is_err());
    }
}

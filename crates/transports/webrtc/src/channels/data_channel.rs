//! WebRTC data channel wrapper
//!
//! Adapts a `webrtc` [`RTCDataChannel`] to [`FrameChannel`]: callbacks are
//! turned into [`ChannelEvent`]s and traffic is counted.

use super::{
    ChannelEvent, Counters, DataChannelState, DataChannelStats, EventSink, Frame, FrameChannel,
    MAX_MESSAGE_SIZE,
};
use crate::config::DataChannelMode;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

/// WebRTC data channel wrapper
pub struct DataChannel {
    /// Channel label/name
    label: String,
    /// The underlying RTCDataChannel
    rtc_channel: Arc<RTCDataChannel>,
    /// Channel mode (reliable/unreliable)
    mode: DataChannelMode,
    /// Current channel state
    state: Arc<RwLock<DataChannelState>>,
    sink: Arc<EventSink>,
    counters: Arc<Counters>,
}

impl DataChannel {
    /// Create a new data channel on an existing peer connection
    pub async fn new(
        peer_connection: &RTCPeerConnection,
        label: &str,
        mode: DataChannelMode,
    ) -> Result<Arc<Self>> {
        let init = RTCDataChannelInit {
            ordered: Some(mode.ordered()),
            max_retransmits: mode.max_retransmits(),
            ..Default::default()
        };

        let rtc_channel = peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| {
                Error::DataChannelError(format!("Failed to create data channel: {}", e))
            })?;

        Ok(Self::from_rtc_channel(rtc_channel, mode))
    }

    /// Wrap an existing RTCDataChannel (for incoming channels)
    pub fn from_rtc_channel(rtc_channel: Arc<RTCDataChannel>, mode: DataChannelMode) -> Arc<Self> {
        let initial = match rtc_channel.ready_state() {
            RTCDataChannelState::Open => DataChannelState::Open,
            RTCDataChannelState::Closing => DataChannelState::Closing,
            RTCDataChannelState::Closed => DataChannelState::Closed,
            _ => DataChannelState::Connecting,
        };

        let channel = Arc::new(Self {
            label: rtc_channel.label().to_string(),
            rtc_channel,
            mode,
            state: Arc::new(RwLock::new(initial)),
            sink: Arc::new(EventSink::default()),
            counters: Arc::new(Counters::default()),
        });

        if initial == DataChannelState::Open {
            channel.sink.emit(&channel.label, ChannelEvent::Open);
        }
        channel.setup_handlers();
        channel
    }

    fn setup_handlers(&self) {
        let state = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);
        let label = self.label.clone();

        self.rtc_channel.on_open(Box::new(move || {
            let state = Arc::clone(&state);
            let sink = Arc::clone(&sink);
            let label = label.clone();
            Box::pin(async move {
                debug!("Data channel '{}' opened", label);
                let newly_open = {
                    let mut state = state.write();
                    let was_open = *state == DataChannelState::Open;
                    *state = DataChannelState::Open;
                    !was_open
                };
                if newly_open {
                    sink.emit(&label, ChannelEvent::Open);
                }
            })
        }));

        let state = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);
        let label = self.label.clone();

        self.rtc_channel.on_close(Box::new(move || {
            let state = Arc::clone(&state);
            let sink = Arc::clone(&sink);
            let label = label.clone();
            Box::pin(async move {
                debug!("Data channel '{}' closed", label);
                *state.write() = DataChannelState::Closed;
                sink.emit(&label, ChannelEvent::Closed);
            })
        }));

        let label = self.label.clone();
        self.rtc_channel.on_error(Box::new(move |err| {
            let label = label.clone();
            Box::pin(async move {
                error!("Data channel '{}' error: {}", label, err);
            })
        }));

        let sink = Arc::clone(&self.sink);
        let counters = Arc::clone(&self.counters);
        let label = self.label.clone();

        self.rtc_channel
            .on_message(Box::new(move |msg: DataChannelMessage| {
                let sink = Arc::clone(&sink);
                let counters = Arc::clone(&counters);
                let label = label.clone();
                Box::pin(async move {
                    counters.record_received(msg.data.len());
                    let frame = if msg.is_string {
                        Frame::Text(String::from_utf8_lossy(&msg.data).into_owned())
                    } else {
                        Frame::Binary(msg.data)
                    };
                    sink.emit(&label, ChannelEvent::Frame(frame));
                })
            }));
    }

    /// Get the channel mode
    pub fn mode(&self) -> DataChannelMode {
        self.mode
    }

    /// Get the underlying RTCDataChannel
    pub fn rtc_channel(&self) -> &Arc<RTCDataChannel> {
        &self.rtc_channel
    }

    fn ensure_sendable(&self, len: usize) -> Result<()> {
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::DataChannelError(format!(
                "Message size {} exceeds maximum {} bytes",
                len, MAX_MESSAGE_SIZE
            )));
        }

        if *self.state.read() != DataChannelState::Open {
            return Err(Error::ChannelNotOpen);
        }

        Ok(())
    }
}

#[async_trait]
impl FrameChannel for DataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> DataChannelState {
        *self.state.read()
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.ensure_sendable(text.len())?;

        self.rtc_channel
            .send_text(text.to_string())
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to send text: {}", e)))?;

        self.counters.record_sent(text.len());
        debug!("Sent {} bytes on data channel '{}'", text.len(), self.label);
        Ok(())
    }

    async fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.ensure_sendable(data.len())?;

        self.rtc_channel
            .send(&Bytes::copy_from_slice(data))
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to send binary: {}", e)))?;

        self.counters.record_sent(data.len());
        Ok(())
    }

    fn subscribe(&self, events: mpsc::UnboundedSender<ChannelEvent>) {
        self.sink.subscribe(events);
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state == DataChannelState::Closed {
                return Ok(());
            }
            *state = DataChannelState::Closing;
        }

        self.rtc_channel
            .close()
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to close channel: {}", e)))?;

        *self.state.write() = DataChannelState::Closed;
        debug!("Data channel '{}' closed", self.label);
        Ok(())
    }

    fn stats(&self) -> DataChannelStats {
        self.counters.snapshot()
    }
}

//! WebSocket client for the signaling relay
//!
//! [`SignalingClient::connect`] retries a bounded number of times, waits for
//! the relay to assign a peer id, then splits into a cloneable outbound
//! [`RelayHandle`] and a stream of inbound [`ServerEvent`]s.

use super::protocol::{ClientEvent, ServerEvent};
use super::SignalRelay;
use crate::config::SignalingClientConfig;
use crate::peer::{IceCandidate, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Depth of the inbound event queue
const EVENT_BUFFER: usize = 256;

/// Outbound half of a relay connection
#[derive(Clone)]
pub struct RelayHandle {
    peer_id: Arc<str>,
    tx: mpsc::UnboundedSender<Message>,
}

impl RelayHandle {
    /// Relay-assigned id of this peer
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Whether the connection's writer is still running
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send_event(&self, event: ClientEvent) -> Result<()> {
        let json = event.to_json()?;
        debug!("Sending {} to relay", event.name());
        self.tx
            .send(Message::Text(json))
            .map_err(|_| Error::SignalingError("relay connection is closed".to_string()))
    }

    /// Join (or create) a room
    pub fn join_room(&self, room_id: &str) -> Result<()> {
        self.send_event(ClientEvent::JoinRoom(room_id.to_string()))
    }

    /// Close the connection
    pub fn close(&self) {
        let _ = self.tx.send(Message::Close(None));
    }
}

#[async_trait]
impl SignalRelay for RelayHandle {
    async fn send_offer(&self, offer: &SessionDescription) -> Result<()> {
        self.send_event(ClientEvent::Offer(offer.to_value()?))
    }

    async fn send_answer(&self, answer: &SessionDescription) -> Result<()> {
        self.send_event(ClientEvent::Answer(answer.to_value()?))
    }

    async fn send_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.send_event(ClientEvent::IceCandidate(candidate.to_value()?))
    }
}

/// Connected relay client
pub struct SignalingClient {
    handle: RelayHandle,
    events: mpsc::Receiver<ServerEvent>,
}

impl SignalingClient {
    /// Connect with bounded retry
    ///
    /// After the first failed attempt a user-facing diagnostic is logged; if
    /// every attempt fails it is returned inside [`Error::SignalingError`].
    #[instrument(skip_all, fields(url = %config.url))]
    pub async fn connect(config: SignalingClientConfig) -> Result<Self> {
        config.validate()?;
        let url = config.websocket_url();
        let attempts = config.max_connect_attempts;
        let mut diagnostic = None;
        let mut last_error = None;

        for attempt in 1..=attempts {
            info!("Connecting to signaling relay {} (attempt {}/{})", url, attempt, attempts);

            match Self::connect_once(&url, config.connect_timeout()).await {
                Ok((ws_stream, peer_id)) => {
                    info!("Connected to signaling relay as {}", peer_id);
                    return Ok(Self::start(ws_stream, peer_id));
                }
                Err(e) => {
                    warn!("Relay connection attempt {}/{} failed: {}", attempt, attempts, e);
                    if diagnostic.is_none() {
                        let text = describe_connect_error(&url, &e);
                        warn!("{}", text);
                        diagnostic = Some(text);
                    }
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(config.retry_delay()).await;
            }
        }

        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        error!("Giving up on signaling relay {} after {} attempts: {}", url, attempts, detail);
        Err(Error::SignalingError(
            diagnostic.unwrap_or_else(|| format!("Failed to connect to signaling server: {}", detail)),
        ))
    }

    /// One handshake, bounded by `timeout`, ending with the assigned peer id
    async fn connect_once(url: &str, timeout: Duration) -> Result<(WsStream, String)> {
        tokio::time::timeout(timeout, Self::handshake(url))
            .await
            .map_err(|_| Error::OperationTimeout(format!("no answer from {} within {:?}", url, timeout)))?
    }

    async fn handshake(url: &str) -> Result<(WsStream, String)> {
        let (mut ws_stream, _) = connect_async(url).await.map_err(map_connect_error)?;

        while let Some(msg) = ws_stream.next().await {
            match msg.map_err(map_connect_error)? {
                Message::Text(text) => match ServerEvent::from_json(&text) {
                    Ok(ServerEvent::Connected { peer_id }) => return Ok((ws_stream, peer_id)),
                    Ok(other) => warn!("Ignoring {} before connected", other.name()),
                    Err(e) => warn!("Ignoring malformed relay frame: {}", e),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        Err(Error::SignalingError(
            "relay closed the connection before assigning a peer id".to_string(),
        ))
    }

    fn start(ws_stream: WsStream, peer_id: String) -> Self {
        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(Self::sender_task(write, rx));
        tokio::spawn(Self::receiver_task(read, tx.clone(), events_tx));

        Self {
            handle: RelayHandle {
                peer_id: Arc::from(peer_id),
                tx,
            },
            events,
        }
    }

    /// Sender task: sends messages from channel to WebSocket
    async fn sender_task(mut write: SplitSink<WsStream, Message>, mut rx: mpsc::UnboundedReceiver<Message>) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }

        debug!("Relay sender task terminated");
    }

    /// Receiver task: parses relay events and queues them for the consumer
    async fn receiver_task(
        mut read: SplitStream<WsStream>,
        tx: mpsc::UnboundedSender<Message>,
        events: mpsc::Sender<ServerEvent>,
    ) {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => match ServerEvent::from_json(&text) {
                    Ok(event) => {
                        debug!("Received {} from relay", event.name());
                        if events.send(event).await.is_err() {
                            debug!("Relay event consumer dropped");
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed relay frame: {}", e),
                },
                Ok(Message::Ping(data)) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Ok(Message::Close(_)) => {
                    info!("Relay closed the connection");
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        debug!("Relay receiver task terminated");
    }

    /// Relay-assigned id of this peer
    pub fn peer_id(&self) -> &str {
        self.handle.peer_id()
    }

    /// Cloneable outbound handle
    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// Next inbound event; `None` once the relay connection is gone
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    /// Split into the outbound handle and the inbound event stream
    pub fn into_parts(self) -> (RelayHandle, mpsc::Receiver<ServerEvent>) {
        (self.handle, self.events)
    }
}

fn map_connect_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Io(io) => Error::IoError(io),
        other => Error::from(other),
    }
}

/// User-facing explanation of a failed connection attempt
pub fn describe_connect_error(url: &str, err: &Error) -> String {
    let mut message = String::from("Failed to connect to signaling server.\n\n");

    match err {
        Error::OperationTimeout(_) => {
            let host = url
                .split("://")
                .nth(1)
                .unwrap_or(url)
                .split(['/', ':'])
                .next()
                .unwrap_or(url);
            message.push_str("Possible causes:\n");
            message.push_str("1. Signaling server is not running\n");
            message.push_str("2. Wrong IP address or port\n");
            message.push_str("3. Firewall blocking the relay port\n");
            message.push_str("4. Server not accessible from your network\n\n");
            message.push_str("Please check:\n");
            message.push_str("- Is the server running?\n");
            message.push_str(&format!("- Is the address correct? ({})\n", url));
            message.push_str(&format!("- Can you reach {} from this machine?", host));
        }
        Error::IoError(io) if io.kind() == ErrorKind::ConnectionRefused => {
            message.push_str(
                "Connection refused. The signaling server is not running or not accessible.",
            );
        }
        other => message.push_str(&format!("Error: {}", other)),
    }

    message
}

//! Per-connection WebSocket handler for the relay
//!
//! Each accepted connection gets a relay-assigned peer id, an outbound queue
//! drained by a forward task, and a read loop that turns client events into
//! room mutations and room-scoped forwards.

use crate::config::RelayConfig;
use crate::signaling::protocol::{error_codes, ClientEvent, RelayedEnvelope, ServerEvent};
use crate::signaling::room::{LeaveOutcome, RoomRegistry};
use crate::Error;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Message, Result as WsResult},
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// A connected WebSocket peer
pub struct WsPeerConnection {
    pub peer_id: String,
    pub remote_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub tx: mpsc::Sender<String>,
}

/// Shared state across all relay connections
pub struct SharedState {
    /// Connected peers by id
    pub peers: Arc<RwLock<HashMap<String, WsPeerConnection>>>,
    /// Room membership; never locked across an await
    pub rooms: Arc<Mutex<RoomRegistry>>,
    pub config: Arc<RelayConfig>,
}

impl SharedState {
    pub fn new(config: Arc<RelayConfig>) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            rooms: Arc::new(Mutex::new(RoomRegistry::new(config.max_room_size))),
            config,
        }
    }

    /// Number of connected peers
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Number of live rooms
    pub fn room_count(&self) -> usize {
        self.rooms.lock().room_count()
    }

    /// Members of a room in join order (empty if the room does not exist)
    pub fn room_members(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .lock()
            .room(room_id)
            .map(|room| room.members().to_vec())
            .unwrap_or_default()
    }

    /// Queue an event for one peer
    ///
    /// Never waits on the target: when its outbound queue is full the frame
    /// is dropped, so a slow reader cannot stall the sender's read loop.
    async fn send_to(&self, peer_id: &str, event: &ServerEvent) {
        let json = match event.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize {} event: {}", event.name(), e);
                return;
            }
        };

        let tx = self.peers.read().await.get(peer_id).map(|p| p.tx.clone());
        match tx {
            Some(tx) => match tx.try_send(json) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Peer {} is not keeping up, dropping {}", peer_id, event.name());
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Peer {} outbound queue closed, dropping {}", peer_id, event.name());
                }
            },
            None => debug!("Peer {} is gone, dropping {}", peer_id, event.name()),
        }
    }

    /// Queue an event for several peers
    async fn send_to_all(&self, peer_ids: &[String], event: &ServerEvent) {
        for peer_id in peer_ids {
            self.send_to(peer_id, event).await;
        }
    }

    async fn notify_left(&self, peer_id: &str, outcome: &LeaveOutcome) {
        if outcome.room_removed {
            info!("Room {} removed (last member {} left)", outcome.room_id, peer_id);
            return;
        }
        info!(
            "Peer {} left room {} ({} remaining)",
            peer_id,
            outcome.room_id,
            outcome.remaining.len()
        );
        self.send_to_all(
            &outcome.remaining,
            &ServerEvent::PeerDisconnected(peer_id.to_string()),
        )
        .await;
    }

    /// Remove a peer on disconnect: leave its room and notify who remains
    async fn disconnect(&self, peer_id: &str) {
        self.peers.write().await.remove(peer_id);

        let outcome = self.rooms.lock().leave(peer_id);
        if let Some(outcome) = outcome {
            self.notify_left(peer_id, &outcome).await;
        }
    }
}

/// Handle a single WebSocket connection
#[instrument(skip_all, fields(remote = tracing::field::Empty, peer_id = tracing::field::Empty))]
pub async fn handle_connection(stream: TcpStream, state: Arc<SharedState>) -> WsResult<()> {
    let addr = stream.peer_addr()?;
    tracing::Span::current().record("remote", tracing::field::display(addr));

    let ws_stream = accept_async(stream).await?;
    let (ws_tx, mut ws_rx) = ws_stream.split();

    let peer_id = Uuid::new_v4().to_string();
    tracing::Span::current().record("peer_id", tracing::field::display(&peer_id));
    info!("Peer {} connected from {}", peer_id, addr);

    // Channel for sending messages back to this connection
    let (tx, mut rx) = mpsc::channel::<String>(state.config.outbound_buffer);

    state.peers.write().await.insert(
        peer_id.clone(),
        WsPeerConnection {
            peer_id: peer_id.clone(),
            remote_addr: addr,
            connected_at: Utc::now(),
            tx,
        },
    );

    // Task to forward queued messages to the WebSocket
    let ws_tx = Arc::new(tokio::sync::Mutex::new(ws_tx));
    let ws_tx_clone = Arc::clone(&ws_tx);
    let forward_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let mut ws_tx = ws_tx_clone.lock().await;
            if let Err(e) = ws_tx.send(Message::Text(msg)).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    state
        .send_to(
            &peer_id,
            &ServerEvent::Connected {
                peer_id: peer_id.clone(),
            },
        )
        .await;

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_message(&text, &state, &peer_id).await,
            Ok(Message::Binary(data)) => {
                warn!("Ignoring {}-byte binary frame from {}", data.len(), peer_id);
            }
            Ok(Message::Ping(data)) => {
                let mut ws_tx = ws_tx.lock().await;
                if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                    debug!("Failed to answer ping from {}: {}", peer_id, e);
                }
            }
            Ok(Message::Close(_)) => {
                info!("WebSocket connection closed by peer {}", peer_id);
                break;
            }
            Err(e) => {
                warn!("WebSocket error from {}: {}", peer_id, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect
    state.disconnect(&peer_id).await;
    forward_task.abort();
    info!("Peer {} disconnected", peer_id);

    Ok(())
}

/// Handle one text frame; malformed input is logged and dropped
async fn handle_message(text: &str, state: &Arc<SharedState>, peer_id: &str) {
    let event = match ClientEvent::from_json(text) {
        Ok(event) => event,
        Err(e) => {
            warn!("Dropping malformed frame from {}: {}", peer_id, e);
            return;
        }
    };

    debug!("{} from {}", event.name(), peer_id);

    match event {
        ClientEvent::JoinRoom(room_id) => handle_join(state, peer_id, &room_id).await,
        ClientEvent::Offer(payload) => {
            relay(state, peer_id, payload, ServerEvent::Offer).await;
        }
        ClientEvent::Answer(payload) => {
            relay(state, peer_id, payload, ServerEvent::Answer).await;
        }
        ClientEvent::IceCandidate(payload) => {
            relay(state, peer_id, payload, ServerEvent::IceCandidate).await;
        }
    }
}

/// Handle join-room
async fn handle_join(state: &Arc<SharedState>, peer_id: &str, room_id: &str) {
    let result = state.rooms.lock().join(room_id, peer_id);

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(Error::RoomFull { room_id, capacity }) => {
            warn!("Peer {} rejected from full room {} ({})", peer_id, room_id, capacity);
            let message = format!("Room {} is full ({} peers)", room_id, capacity);
            state
                .send_to(peer_id, &ServerEvent::error(error_codes::ROOM_FULL, message))
                .await;
            return;
        }
        Err(e) => {
            warn!("Peer {} join failed: {}", peer_id, e);
            state
                .send_to(
                    peer_id,
                    &ServerEvent::error(error_codes::INVALID_ROOM, e.to_string()),
                )
                .await;
            return;
        }
    };

    if let Some(left) = &outcome.left {
        state.notify_left(peer_id, left).await;
    }

    if outcome.already_member {
        debug!("Peer {} re-joined room {}", peer_id, outcome.room_id);
    } else if outcome.created {
        info!("Room {} created by {}", outcome.room_id, peer_id);
    } else {
        info!(
            "Peer {} joined room {} ({} other members)",
            peer_id,
            outcome.room_id,
            outcome.others.len()
        );
    }

    state
        .send_to(
            peer_id,
            &ServerEvent::RoomJoined {
                room_id: outcome.room_id.clone(),
                peers: outcome.others.clone(),
            },
        )
        .await;

    if !outcome.already_member {
        state
            .send_to_all(&outcome.others, &ServerEvent::PeerConnected(peer_id.to_string()))
            .await;
    }
}

/// Forward a negotiation envelope to the other members of the sender's room
async fn relay(
    state: &Arc<SharedState>,
    peer_id: &str,
    payload: Value,
    wrap: fn(RelayedEnvelope) -> ServerEvent,
) {
    let targets = {
        let rooms = state.rooms.lock();
        if rooms.room_of(peer_id).is_none() {
            None
        } else {
            Some(rooms.co_members(peer_id))
        }
    };

    let event = wrap(RelayedEnvelope {
        from: peer_id.to_string(),
        payload,
    });

    match targets {
        None => warn!("Dropping {} from {}: not in a room", event.name(), peer_id),
        Some(targets) if targets.is_empty() => {
            debug!("Dropping {} from {}: alone in room", event.name(), peer_id);
        }
        Some(targets) => {
            debug!("Relaying {} from {} to {} peer(s)", event.name(), peer_id, targets.len());
            state.send_to_all(&targets, &event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    async fn state_with_peer(buffer: usize) -> (Arc<SharedState>, mpsc::Receiver<String>) {
        let config = RelayConfig {
            outbound_buffer: buffer,
            ..RelayConfig::default()
        };
        let state = Arc::new(SharedState::new(Arc::new(config)));
        let (tx, rx) = mpsc::channel(buffer);
        state.peers.write().await.insert(
            "slow".to_string(),
            WsPeerConnection {
                peer_id: "slow".to_string(),
                remote_addr: "127.0.0.1:1".parse().unwrap(),
                connected_at: Utc::now(),
                tx,
            },
        );
        (state, rx)
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_waiting() {
        let (state, mut rx) = state_with_peer(1).await;
        let first = ServerEvent::PeerConnected("a".to_string());
        let second = ServerEvent::PeerConnected("b".to_string());

        timeout(Duration::from_secs(1), async {
            state.send_to("slow", &first).await;
            state.send_to("slow", &second).await;
        })
        .await
        .expect("send_to waited on a full queue");

        assert_eq!(rx.recv().await.unwrap(), first.to_json().unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_closed_or_missing_peer_is_quiet() {
        let (state, rx) = state_with_peer(4).await;
        drop(rx);
        let event = ServerEvent::PeerDisconnected("a".to_string());

        timeout(Duration::from_secs(1), async {
            state.send_to("slow", &event).await;
            state.send_to("nobody", &event).await;
        })
        .await
        .unwrap();
        assert_eq!(state.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_remaining_member() {
        let (state, mut rx) = state_with_peer(4).await;
        {
            let mut rooms = state.rooms.lock();
            rooms.join("R1", "slow").unwrap();
            rooms.join("R1", "gone").unwrap();
        }

        state.disconnect("gone").await;
        let frame = rx.recv().await.unwrap();
        assert_eq!(
            frame,
            ServerEvent::PeerDisconnected("gone".to_string()).to_json().unwrap()
        );
        assert_eq!(state.room_members("R1"), vec!["slow".to_string()]);
    }
}

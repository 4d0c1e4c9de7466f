//! Routes relay events into the negotiator
//!
//! The member already in the room when another peer arrives is the offerer;
//! the newcomer answers. Envelopes from anyone other than the current remote
//! peer are ignored.

use super::{NegotiationState, Negotiator};
use crate::peer::{IceCandidate, SessionDescription};
use crate::signaling::protocol::{error_codes, RelayedEnvelope, ServerEvent};
use crate::{Error, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Presence {
    local_peer: Option<String>,
    room_id: Option<String>,
    remote_peer: Option<String>,
}

/// Lifecycle owner of a peer's sessions
pub struct SessionController {
    negotiator: Negotiator,
    presence: Mutex<Presence>,
}

impl SessionController {
    pub fn new(negotiator: Negotiator) -> Self {
        Self {
            negotiator,
            presence: Mutex::new(Presence::default()),
        }
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    /// Id of the other room member, if known
    pub fn remote_peer(&self) -> Option<String> {
        self.presence.lock().remote_peer.clone()
    }

    /// Room this peer was last told it joined
    pub fn room_id(&self) -> Option<String> {
        self.presence.lock().room_id.clone()
    }

    /// Handle relay events until the relay connection goes away
    ///
    /// Errors are logged per event; the loop itself never fails. The call,
    /// if any, outlives the relay.
    pub async fn run(&self, mut events: mpsc::Receiver<ServerEvent>) {
        while let Some(event) = events.recv().await {
            let name = event.name();
            if let Err(e) = self.handle_event(event).await {
                warn!("Handling '{}' failed: {}", name, e);
            }
        }
        info!("Relay connection closed; no further negotiation possible");
    }

    /// Handle one relay event
    pub async fn handle_event(&self, event: ServerEvent) -> Result<()> {
        match event {
            ServerEvent::Connected { peer_id } => {
                info!("Relay assigned peer id {}", peer_id);
                self.presence.lock().local_peer = Some(peer_id);
                Ok(())
            }
            ServerEvent::RoomJoined { room_id, peers } => {
                info!("Joined room {} with {} other peer(s)", room_id, peers.len());
                let mut presence = self.presence.lock();
                presence.room_id = Some(room_id);
                presence.remote_peer = peers.into_iter().next();
                Ok(())
            }
            ServerEvent::PeerConnected(peer_id) => {
                info!("Peer {} joined, offering", peer_id);
                self.presence.lock().remote_peer = Some(peer_id);
                self.negotiator.initialize().await?;
                self.negotiator.create_offer().await
            }
            ServerEvent::PeerDisconnected(peer_id) => {
                let mut presence = self.presence.lock();
                if presence.remote_peer.as_deref() == Some(peer_id.as_str()) {
                    info!("Remote peer {} left the room", peer_id);
                    presence.remote_peer = None;
                } else {
                    debug!("Peer {} left", peer_id);
                }
                Ok(())
            }
            ServerEvent::Offer(envelope) => {
                let Some(payload) = self.accept(envelope, "offer") else {
                    return Ok(());
                };
                let offer = SessionDescription::from_value(payload)?;
                if !self.negotiator.has_session() {
                    self.negotiator.initialize().await?;
                }
                self.negotiator.create_answer(offer).await
            }
            ServerEvent::Answer(envelope) => {
                let Some(payload) = self.accept(envelope, "answer") else {
                    return Ok(());
                };
                let answer = SessionDescription::from_value(payload)?;
                self.negotiator.set_remote_description(answer).await
            }
            ServerEvent::IceCandidate(envelope) => {
                let Some(payload) = self.accept(envelope, "ice-candidate") else {
                    return Ok(());
                };
                let candidate = IceCandidate::from_value(payload)?;
                if !self.negotiator.has_session() {
                    // A candidate can overtake the offer it belongs to, but must
                    // not revive a session that failed or was ended
                    if self.negotiator.state() != NegotiationState::Idle {
                        debug!(
                            "Dropping candidate; no session in state {:?}",
                            self.negotiator.state()
                        );
                        return Ok(());
                    }
                    self.negotiator.initialize().await?;
                }
                self.negotiator.add_ice_candidate(candidate).await
            }
            ServerEvent::Error(error) => {
                warn!("Relay reported {}: {}", error.code, error.message);
                if error.code == error_codes::ROOM_FULL {
                    return Err(Error::SignalingError(format!(
                        "room is full: {}",
                        error.message
                    )));
                }
                Err(Error::SignalingError(error.message))
            }
        }
    }

    /// Payload of an envelope from the current remote peer
    ///
    /// With no remote peer known yet the sender becomes it.
    fn accept(&self, envelope: RelayedEnvelope, kind: &str) -> Option<serde_json::Value> {
        let mut presence = self.presence.lock();
        match presence.remote_peer.as_deref() {
            Some(remote) if remote != envelope.from => {
                warn!(
                    "Ignoring {} from {}; talking to {}",
                    kind, envelope.from, remote
                );
                None
            }
            Some(_) => Some(envelope.payload),
            None => {
                presence.remote_peer = Some(envelope.from);
                Some(envelope.payload)
            }
        }
    }
}

//! In-process transport pairs
//!
//! Transports created from the same [`LoopbackFactory`] find each other
//! through a token embedded in their session descriptions. Once the offerer
//! applies the answer, both sides report `Connecting` then `Connected`, and
//! every data channel the offerer created shows up on the answerer as an
//! inbound channel. Like a browser, a transport rejects remote candidates
//! until its remote description is set. The factory keeps a log of every
//! remote candidate its transports applied.

use super::{
    IceCandidate, PeerTransport, SdpType, SessionDescription, TransportEvent, TransportFactory,
    TransportState,
};
use crate::channels::{channel_pair, FrameChannel, MemoryChannel};
use crate::config::{DataChannelMode, SessionConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

const TOKEN_PREFIX: &str = "a=loopback:";

type Registry = Arc<Mutex<HashMap<String, Weak<LoopbackTransport>>>>;

/// Creates transports that can connect to each other in-process
#[derive(Default, Clone)]
pub struct LoopbackFactory {
    registry: Registry,
    applied: Arc<Mutex<Vec<IceCandidate>>>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote candidates applied by this factory's transports, in application order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(
        &self,
        _config: &SessionConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = Arc::new(LoopbackTransport {
            id: Uuid::new_v4().to_string(),
            registry: Arc::clone(&self.registry),
            applied: Arc::clone(&self.applied),
            events,
            state: Mutex::new(LinkState::default()),
        });
        self.registry
            .lock()
            .insert(transport.id.clone(), Arc::downgrade(&transport));
        Ok(transport)
    }
}

#[derive(Default)]
struct LinkState {
    remote: Option<SessionDescription>,
    /// Channels this side created: (local end, end handed to the remote)
    channels: Vec<(Arc<MemoryChannel>, Arc<MemoryChannel>)>,
    peer: Weak<LoopbackTransport>,
    closed: bool,
}

/// One in-process transport
pub struct LoopbackTransport {
    id: String,
    registry: Registry,
    applied: Arc<Mutex<Vec<IceCandidate>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<LinkState>,
}

impl LoopbackTransport {
    fn description(&self, sdp_type: SdpType) -> SessionDescription {
        SessionDescription {
            sdp_type,
            sdp: format!(
                "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n{}{}\r\n",
                TOKEN_PREFIX, self.id
            ),
        }
    }

    fn lookup(&self, desc: &SessionDescription) -> Result<Arc<LoopbackTransport>> {
        let token = desc
            .sdp
            .lines()
            .find_map(|line| line.strip_prefix(TOKEN_PREFIX))
            .ok_or_else(|| Error::SdpError("description has no loopback token".to_string()))?;
        self.registry
            .lock()
            .get(token.trim())
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::SdpError(format!("no loopback transport {}", token)))
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.lock().closed {
            return Err(Error::PeerConnectionError("connection is closed".to_string()));
        }
        Ok(())
    }

    /// Link both sides once the offerer has applied the answer
    fn connect(offerer: &Arc<LoopbackTransport>, answerer: &Arc<LoopbackTransport>) {
        let channels = {
            let mut state = offerer.state.lock();
            state.peer = Arc::downgrade(answerer);
            state.channels.clone()
        };
        {
            let mut state = answerer.state.lock();
            state.peer = Arc::downgrade(offerer);
        }

        for side in [offerer, answerer] {
            side.emit(TransportEvent::StateChanged(TransportState::Connecting));
        }

        for (local, remote) in channels {
            answerer.emit(TransportEvent::DataChannel(remote.clone()));
            local.open();
            remote.open();
        }

        for side in [offerer, answerer] {
            side.emit(TransportEvent::StateChanged(TransportState::Connected));
        }
        debug!("Loopback {} <-> {} connected", offerer.id, answerer.id);
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        Ok(self.description(SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        match self.state.lock().remote.as_ref().map(|d| d.sdp_type) {
            Some(SdpType::Offer) => Ok(self.description(SdpType::Answer)),
            _ => Err(Error::SdpError("no remote offer to answer".to_string())),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        debug!("Loopback {} applied local {:?}", self.id, desc.sdp_type);
        self.emit(TransportEvent::IceCandidate(IceCandidate {
            candidate: format!("candidate:1 1 udp 2122260223 127.0.0.1 9 typ host ufrag {}", self.id),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let other = self.lookup(&desc)?;
        let sdp_type = desc.sdp_type;
        self.state.lock().remote = Some(desc);

        if sdp_type == SdpType::Answer {
            let me = self
                .registry
                .lock()
                .get(&self.id)
                .and_then(Weak::upgrade)
                .ok_or_else(|| Error::PeerConnectionError("transport dropped".to_string()))?;
            LoopbackTransport::connect(&me, &other);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        if self.state.lock().remote.is_none() {
            return Err(Error::IceCandidateError(
                "remote description not set".to_string(),
            ));
        }
        debug!("Loopback {} applied remote candidate {}", self.id, candidate.candidate);
        self.applied.lock().push(candidate);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _mode: DataChannelMode,
    ) -> Result<Arc<dyn FrameChannel>> {
        self.ensure_open()?;
        let (local, remote) = channel_pair(label);
        self.state.lock().channels.push((Arc::clone(&local), remote));
        Ok(local)
    }

    async fn close(&self) -> Result<()> {
        let (channels, peer) = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            (std::mem::take(&mut state.channels), state.peer.upgrade())
        };

        for (local, _) in channels {
            local.close().await?;
        }
        self.emit(TransportEvent::StateChanged(TransportState::Closed));
        if let Some(peer) = peer {
            if !peer.state.lock().closed {
                peer.emit(TransportEvent::StateChanged(TransportState::Disconnected));
            }
        }
        self.registry.lock().remove(&self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelEvent;

    async fn transport(
        factory: &LoopbackFactory,
    ) -> (Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = factory.create(&SessionConfig::default(), tx).await.unwrap();
        (transport, rx)
    }

    #[tokio::test]
    async fn test_offer_answer_connects_and_delivers_channel() {
        let factory = LoopbackFactory::new();
        let (a, mut a_events) = transport(&factory).await;
        let (b, mut b_events) = transport(&factory).await;

        let channel = a
            .create_data_channel("messages", DataChannelMode::Reliable)
            .await
            .unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert!(matches!(a_events.recv().await, Some(TransportEvent::IceCandidate(_))));
        assert!(matches!(
            a_events.recv().await,
            Some(TransportEvent::StateChanged(TransportState::Connecting))
        ));
        assert!(matches!(
            a_events.recv().await,
            Some(TransportEvent::StateChanged(TransportState::Connected))
        ));

        assert!(matches!(b_events.recv().await, Some(TransportEvent::IceCandidate(_))));
        assert!(matches!(
            b_events.recv().await,
            Some(TransportEvent::StateChanged(TransportState::Connecting))
        ));
        let inbound = match b_events.recv().await {
            Some(TransportEvent::DataChannel(inbound)) => inbound,
            other => panic!("expected data channel, got {:?}", other),
        };
        assert_eq!(inbound.label(), "messages");

        let (tx, mut rx) = mpsc::unbounded_channel();
        inbound.subscribe(tx);
        channel.send_text("hello").await.unwrap();
        assert_eq!(rx.recv().await, Some(ChannelEvent::Open));
        assert!(matches!(rx.recv().await, Some(ChannelEvent::Frame(_))));
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_rejected() {
        let factory = LoopbackFactory::new();
        let (a, _events) = transport(&factory).await;
        let err = a
            .add_ice_candidate(IceCandidate {
                candidate: "candidate:1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_peer_error());
        assert!(factory.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn test_answer_requires_offer() {
        let factory = LoopbackFactory::new();
        let (a, _events) = transport(&factory).await;
        assert!(a.create_answer().await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let factory = LoopbackFactory::new();
        let (a, mut events) = transport(&factory).await;
        a.close().await.unwrap();
        a.close().await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::StateChanged(TransportState::Closed))
        ));
        assert!(events.try_recv().is_err());
        assert!(a.create_offer().await.is_err());
    }
}

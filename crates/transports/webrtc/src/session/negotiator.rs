//! Per-call negotiation state machine
//!
//! A [`Negotiator`] owns at most one session: a platform connection, its
//! event pump, the multiplexed data channel, and the candidates queued before
//! the remote description arrived. Operations are serialized; every failure
//! is logged and folded into the published [`SessionSnapshot`].

use super::{NegotiationState, SessionSnapshot};
use crate::channels::{FrameChannel, Multiplexer};
use crate::config::SessionConfig;
use crate::peer::{
    IceCandidate, PeerTransport, SdpType, SessionDescription, TransportEvent, TransportFactory,
    TransportState,
};
use crate::signaling::SignalRelay;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// The live session owned by a negotiator
struct ActiveSession {
    generation: u64,
    transport: Arc<dyn PeerTransport>,
    channel: Option<Arc<dyn FrameChannel>>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    pump: JoinHandle<()>,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    factory: Arc<dyn TransportFactory>,
    relay: Arc<dyn SignalRelay>,
    mux: Arc<Multiplexer>,
    config: SessionConfig,
    session: Mutex<Option<ActiveSession>>,
    next_generation: AtomicU64,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    /// Held for the whole of each public operation
    op_lock: tokio::sync::Mutex<()>,
}

/// Drives offer/answer and trickle ICE for one call at a time
#[derive(Clone)]
pub struct Negotiator {
    inner: Arc<Inner>,
}

impl Negotiator {
    /// Create a negotiator in `Idle` with no session
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn TransportFactory>,
        relay: Arc<dyn SignalRelay>,
        mux: Arc<Multiplexer>,
    ) -> Result<Self> {
        config.validate()?;
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());

        Ok(Self {
            inner: Arc::new(Inner {
                factory,
                relay,
                mux,
                config,
                session: Mutex::new(None),
                next_generation: AtomicU64::new(1),
                snapshot_tx,
                op_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Multiplexer the session's data channel is attached to
    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.inner.mux
    }

    /// Current snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Current state
    pub fn state(&self) -> NegotiationState {
        self.inner.snapshot_tx.borrow().state
    }

    /// Observe snapshot changes
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Whether a session (platform connection) currently exists
    pub fn has_session(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    /// Create a fresh session, disposing of any existing one first
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        let _op = self.inner.op_lock.lock().await;

        // The guard must drop before teardown awaits
        let previous = self.inner.session.lock().take();
        if let Some(old) = previous {
            info!("Disposing previous session {}", old.generation);
            self.inner.teardown(old).await;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let transport = match self.inner.factory.create(&self.inner.config, events_tx).await {
            Ok(transport) => transport,
            Err(e) => {
                error!("Failed to create peer connection: {}", e);
                self.inner.publish(|s| {
                    *s = SessionSnapshot {
                        state: NegotiationState::Failed,
                        ..SessionSnapshot::default()
                    }
                });
                return Err(e);
            }
        };

        let pump = tokio::spawn(Inner::pump(Arc::downgrade(&self.inner), generation, events_rx));

        *self.inner.session.lock() = Some(ActiveSession {
            generation,
            transport,
            channel: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            pump,
            timer: None,
        });
        self.inner.publish(|s| *s = SessionSnapshot::default());

        info!("Session {} initialized", generation);
        Ok(())
    }

    /// Create the data channel, produce an offer, apply it and relay it
    #[instrument(skip(self))]
    pub async fn create_offer(&self) -> Result<()> {
        let _op = self.inner.op_lock.lock().await;
        let (generation, transport) = self.inner.current("create offer")?;
        self.inner.expect_state(generation, NegotiationState::Idle, "create offer")?;

        let result = async {
            let config = &self.inner.config;
            let channel = transport
                .create_data_channel(&config.data_channel_label, config.data_channel_mode)
                .await?;
            self.inner.adopt_channel(generation, channel);

            let offer = transport.create_offer().await?;
            transport.set_local_description(offer.clone()).await?;
            self.inner.enter_negotiating(generation, NegotiationState::Offering);
            self.inner.relay.send_offer(&offer).await
        }
        .await;

        if let Err(e) = &result {
            self.inner.fail(generation, &format!("creating offer failed: {}", e));
        } else {
            info!("Offer sent");
        }
        result
    }

    /// Apply a remote offer, produce an answer, apply it and relay it
    ///
    /// A session answers at most one offer; later offers are rejected with
    /// [`Error::InvalidState`] and leave the session untouched.
    #[instrument(skip_all)]
    pub async fn create_answer(&self, offer: SessionDescription) -> Result<()> {
        let _op = self.inner.op_lock.lock().await;
        let (generation, transport) = self.inner.current("create answer")?;

        if offer.sdp_type != SdpType::Offer {
            warn!("Refusing to answer a {:?} description", offer.sdp_type);
            return Err(Error::SdpError(format!(
                "expected an offer, got {:?}",
                offer.sdp_type
            )));
        }

        // Answering moves the session out of Idle, so a later offer lands here too
        if let Err(e) = self.inner.expect_state(generation, NegotiationState::Idle, "answer offer") {
            warn!("Ignoring additional offer; this session already negotiated");
            return Err(e);
        }

        let result = async {
            self.inner.apply_remote(generation, &transport, offer).await?;
            let answer = transport.create_answer().await?;
            transport.set_local_description(answer.clone()).await?;
            self.inner.enter_negotiating(generation, NegotiationState::AnswerPending);
            self.inner.relay.send_answer(&answer).await
        }
        .await;

        if let Err(e) = &result {
            self.inner.fail(generation, &format!("creating answer failed: {}", e));
        } else {
            info!("Answer sent");
        }
        result
    }

    /// Apply a remote description (normally the answer to our offer)
    #[instrument(skip_all, fields(sdp_type = ?desc.sdp_type))]
    pub async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let _op = self.inner.op_lock.lock().await;
        let (generation, transport) = self.inner.current("set remote description")?;

        if desc.sdp_type == SdpType::Answer {
            self.inner
                .expect_state(generation, NegotiationState::Offering, "apply answer")?;
        }

        let result = self.inner.apply_remote(generation, &transport, desc).await;
        if let Err(e) = &result {
            self.inner
                .fail(generation, &format!("applying remote description failed: {}", e));
        }
        result
    }

    /// Apply a remote candidate, or queue it until the remote description is set
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let _op = self.inner.op_lock.lock().await;
        let (generation, transport) = self.inner.current("add candidate")?;

        {
            let mut session = self.inner.session.lock();
            if let Some(active) = session.as_mut().filter(|s| s.generation == generation) {
                if !active.remote_description_set {
                    active.pending_candidates.push(candidate);
                    debug!(
                        "Queued remote candidate ({} pending)",
                        active.pending_candidates.len()
                    );
                    return Ok(());
                }
            }
        }

        let result = transport.add_ice_candidate(candidate).await;
        if let Err(e) = &result {
            self.inner
                .fail(generation, &format!("applying candidate failed: {}", e));
        }
        result
    }

    /// Close the data channel, then the connection, and publish `Closed`
    ///
    /// Safe in any state, with or without a session.
    #[instrument(skip(self))]
    pub async fn end_call(&self) -> Result<()> {
        let _op = self.inner.op_lock.lock().await;

        let active = self.inner.session.lock().take();
        if let Some(active) = active {
            info!("Ending session {}", active.generation);
            self.inner.teardown(active).await;
        }

        self.inner.publish(|s| {
            *s = SessionSnapshot {
                state: NegotiationState::Closed,
                ..SessionSnapshot::default()
            }
        });
        Ok(())
    }
}

impl Inner {
    fn publish(&self, update: impl FnOnce(&mut SessionSnapshot)) {
        self.snapshot_tx.send_if_modified(|snapshot| {
            let before = snapshot.clone();
            update(snapshot);
            if snapshot.state != before.state {
                info!("Negotiation state {:?} -> {:?}", before.state, snapshot.state);
            }
            *snapshot != before
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.generation == generation)
            .unwrap_or(false)
    }

    fn current(&self, operation: &str) -> Result<(u64, Arc<dyn PeerTransport>)> {
        match self.session.lock().as_ref() {
            Some(active) => Ok((active.generation, Arc::clone(&active.transport))),
            None => {
                warn!("Cannot {}: no active session", operation);
                Err(Error::InvalidState(format!("cannot {} without a session", operation)))
            }
        }
    }

    fn expect_state(&self, generation: u64, expected: NegotiationState, operation: &str) -> Result<()> {
        let state = self.snapshot_tx.borrow().state;
        if !self.is_current(generation) || state != expected {
            warn!("Cannot {} in state {:?}", operation, state);
            return Err(Error::InvalidState(format!(
                "cannot {} in state {:?}",
                operation, state
            )));
        }
        Ok(())
    }

    /// Set the remote description, then flush queued candidates in arrival order
    async fn apply_remote(
        &self,
        generation: u64,
        transport: &Arc<dyn PeerTransport>,
        desc: SessionDescription,
    ) -> Result<()> {
        transport.set_remote_description(desc).await?;

        let pending = {
            let mut session = self.session.lock();
            match session.as_mut().filter(|s| s.generation == generation) {
                Some(active) => {
                    active.remote_description_set = true;
                    std::mem::take(&mut active.pending_candidates)
                }
                None => return Err(Error::InvalidState("session ended".to_string())),
            }
        };

        if !pending.is_empty() {
            debug!("Applying {} queued remote candidates", pending.len());
        }
        for candidate in pending {
            transport.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Publish `state` and arm the negotiation timeout
    fn enter_negotiating(self: &Arc<Self>, generation: u64, state: NegotiationState) {
        let timeout = self.config.negotiation_timeout();
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                if inner.snapshot_tx.borrow().state.is_negotiating() {
                    inner.fail(
                        generation,
                        &format!("not connected within {:?}", timeout),
                    );
                }
            }
        });

        let mut session = self.session.lock();
        match session.as_mut().filter(|s| s.generation == generation) {
            Some(active) => {
                if let Some(old) = active.timer.replace(timer) {
                    old.abort();
                }
            }
            None => {
                timer.abort();
                return;
            }
        }
        drop(session);

        self.publish(|s| s.state = state);
    }

    /// Hold `channel` as the session's data channel and attach it to the multiplexer
    fn adopt_channel(&self, generation: u64, channel: Arc<dyn FrameChannel>) {
        let adopted = {
            let mut session = self.session.lock();
            match session.as_mut().filter(|s| s.generation == generation) {
                Some(active) if active.channel.is_none() => {
                    active.channel = Some(Arc::clone(&channel));
                    true
                }
                Some(_) => {
                    warn!(
                        "Session already holds a data channel, closing extra '{}'",
                        channel.label()
                    );
                    false
                }
                None => false,
            }
        };

        if adopted {
            self.mux.attach(channel);
        } else {
            tokio::spawn(async move {
                if let Err(e) = channel.close().await {
                    debug!("Closing extra channel failed: {}", e);
                }
            });
        }
    }

    /// Move the session to `Failed` and dispose of it
    fn fail(&self, generation: u64, reason: &str) {
        let active = {
            let mut session = self.session.lock();
            match session.as_ref() {
                Some(active) if active.generation == generation => session.take(),
                _ => None,
            }
        };
        let Some(active) = active else {
            debug!("Ignoring failure of stale session {}: {}", generation, reason);
            return;
        };

        error!("Session {} failed: {}", generation, reason);
        self.publish(|s| {
            s.state = NegotiationState::Failed;
            s.call_active = false;
        });

        let mux = Arc::clone(&self.mux);
        tokio::spawn(async move {
            Self::close_session(&mux, active).await;
        });
    }

    async fn teardown(&self, active: ActiveSession) {
        Self::close_session(&self.mux, active).await;
    }

    /// Channel first, then the connection
    async fn close_session(mux: &Multiplexer, active: ActiveSession) {
        if let Some(timer) = active.timer {
            timer.abort();
        }
        active.pump.abort();

        if let Some(channel) = active.channel {
            if mux
                .channel()
                .map(|attached| Arc::ptr_eq(&attached, &channel))
                .unwrap_or(false)
            {
                mux.detach();
            }
            if let Err(e) = channel.close().await {
                warn!("Failed to close data channel: {}", e);
            }
        }

        if let Err(e) = active.transport.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
        debug!("Session {} disposed", active.generation);
    }

    /// Fold platform events of one session into negotiator state
    async fn pump(
        weak: Weak<Inner>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(inner) = weak.upgrade() else { break };
            if !inner.is_current(generation) {
                break;
            }

            match event {
                TransportEvent::IceCandidate(candidate) => {
                    debug!("Relaying local candidate");
                    if let Err(e) = inner.relay.send_ice_candidate(&candidate).await {
                        warn!("Failed to relay local candidate: {}", e);
                    }
                }
                TransportEvent::StateChanged(state) => inner.on_transport_state(generation, state),
                TransportEvent::DataChannel(channel) => {
                    info!("Adopting inbound data channel '{}'", channel.label());
                    inner.adopt_channel(generation, channel);
                }
                TransportEvent::RemoteTrack(media) => {
                    inner.publish(|s| s.remote_media = Some(media));
                }
            }
        }
        debug!("Event pump for session {} stopped", generation);
    }

    fn on_transport_state(&self, generation: u64, state: TransportState) {
        debug!("Transport state {:?}", state);
        match state {
            TransportState::Connected => {
                if let Some(timer) = self
                    .session
                    .lock()
                    .as_mut()
                    .filter(|s| s.generation == generation)
                    .and_then(|s| s.timer.take())
                {
                    timer.abort();
                }
                self.publish(|s| {
                    s.state = NegotiationState::Connected;
                    s.call_active = true;
                });
            }
            TransportState::Disconnected | TransportState::Failed => {
                self.fail(generation, &format!("connection {:?}", state).to_lowercase());
            }
            TransportState::New | TransportState::Connecting | TransportState::Closed => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::DataChannelState;
    use crate::peer::LoopbackFactory;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingRelay {
        offers: Mutex<Vec<SessionDescription>>,
        answers: Mutex<Vec<SessionDescription>>,
        candidates: Mutex<Vec<IceCandidate>>,
    }

    #[async_trait]
    impl SignalRelay for RecordingRelay {
        async fn send_offer(&self, offer: &SessionDescription) -> Result<()> {
            self.offers.lock().push(offer.clone());
            Ok(())
        }

        async fn send_answer(&self, answer: &SessionDescription) -> Result<()> {
            self.answers.lock().push(answer.clone());
            Ok(())
        }

        async fn send_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
            self.candidates.lock().push(candidate.clone());
            Ok(())
        }
    }

    fn negotiator(factory: &LoopbackFactory, config: SessionConfig) -> (Negotiator, Arc<RecordingRelay>) {
        let relay = Arc::new(RecordingRelay::default());
        let negotiator = Negotiator::new(
            config,
            Arc::new(factory.clone()),
            relay.clone(),
            Multiplexer::new(),
        )
        .unwrap();
        (negotiator, relay)
    }

    async fn wait_state(negotiator: &Negotiator, state: NegotiationState) {
        let mut rx = negotiator.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.state == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_offer_requires_session() {
        let factory = LoopbackFactory::new();
        let (negotiator, relay) = negotiator(&factory, SessionConfig::default());
        let err = negotiator.create_offer().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(negotiator.state(), NegotiationState::Idle);
        assert!(relay.offers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_offer_answer_reaches_connected() {
        let factory = LoopbackFactory::new();
        let (alice, alice_relay) = negotiator(&factory, SessionConfig::default());
        let (bob, bob_relay) = negotiator(&factory, SessionConfig::default());

        alice.initialize().await.unwrap();
        bob.initialize().await.unwrap();

        alice.create_offer().await.unwrap();
        assert_eq!(alice.state(), NegotiationState::Offering);
        let offer = alice_relay.offers.lock()[0].clone();

        bob.create_answer(offer).await.unwrap();
        let answer = bob_relay.answers.lock()[0].clone();
        alice.set_remote_description(answer).await.unwrap();

        wait_state(&alice, NegotiationState::Connected).await;
        wait_state(&bob, NegotiationState::Connected).await;
        assert!(alice.snapshot().call_active);
        assert!(bob.multiplexer().channel().is_some());
    }

    fn candidate(name: &str) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{}", name),
            sdp_mid: Some("0".to_string()),
            ..Default::default()
        }
    }

    fn applied(factory: &LoopbackFactory) -> Vec<String> {
        factory
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect()
    }

    #[tokio::test]
    async fn test_early_candidates_are_queued_then_flushed() {
        let factory = LoopbackFactory::new();
        let (alice, alice_relay) = negotiator(&factory, SessionConfig::default());
        let (bob, _bob_relay) = negotiator(&factory, SessionConfig::default());
        alice.initialize().await.unwrap();
        bob.initialize().await.unwrap();

        // Loopback rejects candidates before a remote description, so these must wait
        bob.add_ice_candidate(candidate("early-1")).await.unwrap();
        bob.add_ice_candidate(candidate("early-2")).await.unwrap();
        assert_eq!(bob.state(), NegotiationState::Idle);
        assert!(applied(&factory).is_empty());

        alice.create_offer().await.unwrap();
        let offer = alice_relay.offers.lock()[0].clone();
        bob.create_answer(offer).await.unwrap();
        assert_eq!(bob.state(), NegotiationState::AnswerPending);
        assert_eq!(applied(&factory), vec!["candidate:early-1", "candidate:early-2"]);

        // With the remote description in place candidates go straight through
        bob.add_ice_candidate(candidate("late")).await.unwrap();
        assert_eq!(
            applied(&factory),
            vec!["candidate:early-1", "candidate:early-2", "candidate:late"]
        );
    }

    #[tokio::test]
    async fn test_second_offer_rejected() {
        let factory = LoopbackFactory::new();
        let (alice, alice_relay) = negotiator(&factory, SessionConfig::default());
        let (bob, _) = negotiator(&factory, SessionConfig::default());
        alice.initialize().await.unwrap();
        bob.initialize().await.unwrap();

        alice.create_offer().await.unwrap();
        let offer = alice_relay.offers.lock()[0].clone();
        bob.create_answer(offer.clone()).await.unwrap();

        let err = bob.create_answer(offer).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_ne!(bob.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn test_negotiation_timeout_fails_session() {
        let factory = LoopbackFactory::new();
        let (alice, _) = negotiator(
            &factory,
            SessionConfig::default().with_negotiation_timeout_ms(50),
        );
        alice.initialize().await.unwrap();
        alice.create_offer().await.unwrap();

        wait_state(&alice, NegotiationState::Failed).await;
        assert!(!alice.has_session());
        assert!(!alice.snapshot().call_active);
    }

    #[tokio::test]
    async fn test_end_call_from_any_state() {
        let factory = LoopbackFactory::new();
        let (alice, _) = negotiator(&factory, SessionConfig::default());

        alice.end_call().await.unwrap();
        assert_eq!(alice.state(), NegotiationState::Closed);

        alice.initialize().await.unwrap();
        assert_eq!(alice.state(), NegotiationState::Idle);
        alice.create_offer().await.unwrap();
        alice.end_call().await.unwrap();
        assert_eq!(alice.state(), NegotiationState::Closed);
        assert!(!alice.has_session());
        assert!(alice.multiplexer().channel().is_none());
    }

    #[tokio::test]
    async fn test_reinitialize_disposes_previous_session() {
        let factory = LoopbackFactory::new();
        let (alice, _) = negotiator(&factory, SessionConfig::default());
        alice.initialize().await.unwrap();
        alice.create_offer().await.unwrap();
        let first = alice.multiplexer().channel().unwrap();

        alice.initialize().await.unwrap();
        assert_eq!(alice.state(), NegotiationState::Idle);
        assert!(alice.multiplexer().channel().is_none());
        assert_eq!(first.state(), DataChannelState::Closed);
    }

    /// Loopback transport whose close takes a while
    struct SlowClose {
        inner: Arc<dyn PeerTransport>,
        delay: Duration,
    }

    #[async_trait]
    impl PeerTransport for SlowClose {
        async fn create_offer(&self) -> Result<SessionDescription> {
            self.inner.create_offer().await
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            self.inner.create_answer().await
        }

        async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
            self.inner.set_local_description(desc).await
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
            self.inner.set_remote_description(desc).await
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            self.inner.add_ice_candidate(candidate).await
        }

        async fn create_data_channel(
            &self,
            label: &str,
            mode: crate::config::DataChannelMode,
        ) -> Result<Arc<dyn FrameChannel>> {
            self.inner.create_data_channel(label, mode).await
        }

        async fn close(&self) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.close().await
        }
    }

    struct SlowCloseFactory(LoopbackFactory);

    #[async_trait]
    impl TransportFactory for SlowCloseFactory {
        async fn create(
            &self,
            config: &SessionConfig,
            events: mpsc::UnboundedSender<TransportEvent>,
        ) -> Result<Arc<dyn PeerTransport>> {
            let inner = self.0.create(config, events).await?;
            Ok(Arc::new(SlowClose {
                inner,
                delay: Duration::from_millis(300),
            }))
        }
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_session_readable_while_teardown_awaits() {
        let negotiator = Negotiator::new(
            SessionConfig::default(),
            Arc::new(SlowCloseFactory(LoopbackFactory::new())),
            Arc::new(RecordingRelay::default()),
            Multiplexer::new(),
        )
        .unwrap();
        negotiator.initialize().await.unwrap();
        negotiator.create_offer().await.unwrap();

        // Both operations must be spawnable on a multi-threaded runtime
        assert_send(&negotiator.initialize());
        assert_send(&negotiator.end_call());

        let ending = negotiator.clone();
        let task = tokio::spawn(async move { ending.end_call().await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!task.is_finished());
        assert!(negotiator.inner.session.try_lock().is_some());
        assert!(!negotiator.has_session());

        task.await.unwrap().unwrap();
        assert_eq!(negotiator.state(), NegotiationState::Closed);
    }

    #[tokio::test]
    async fn test_session_readable_while_reinitialize_disposes() {
        let negotiator = Negotiator::new(
            SessionConfig::default(),
            Arc::new(SlowCloseFactory(LoopbackFactory::new())),
            Arc::new(RecordingRelay::default()),
            Multiplexer::new(),
        )
        .unwrap();
        negotiator.initialize().await.unwrap();

        let restarting = negotiator.clone();
        let task = tokio::spawn(async move { restarting.initialize().await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(negotiator.inner.session.try_lock().is_some());
        task.await.unwrap().unwrap();
        assert!(negotiator.has_session());
        assert_eq!(negotiator.state(), NegotiationState::Idle);
    }
}

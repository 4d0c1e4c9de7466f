//! [`PeerTransport`] over the `webrtc` crate

use super::{
    IceCandidate, PeerTransport, RemoteMedia, SdpType, SessionDescription, TransportEvent,
    TransportFactory, TransportState,
};
use crate::channels::{DataChannel, FrameChannel};
use crate::config::{DataChannelMode, SessionConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

/// Builds `webrtc` peer connections
///
/// Local tracks registered here are attached to every connection created;
/// producing their samples is up to the caller.
#[derive(Default, Clone)]
pub struct RtcTransportFactory {
    local_tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl RtcTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `track` to connections created from now on
    pub fn with_local_track(mut self, track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        self.local_tracks.push(track);
        self
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    #[instrument(skip_all)]
    async fn create(
        &self,
        config: &SessionConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = RtcPeerTransport::new(config, &self.local_tracks, events).await?;
        Ok(Arc::new(transport))
    }
}

/// `webrtc` peer connection wrapper
pub struct RtcPeerTransport {
    peer_connection: Arc<RTCPeerConnection>,
    /// Retained so local tracks keep flowing
    _senders: Vec<Arc<RTCRtpSender>>,
    closed: AtomicBool,
}

impl RtcPeerTransport {
    /// Create a peer connection with the configured ICE servers
    pub async fn new(
        config: &SessionConfig,
        local_tracks: &[Arc<dyn TrackLocal + Send + Sync>],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self> {
        // Create MediaEngine with default codecs
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        // Configure ICE servers (STUN/TURN)
        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
            })?);

        let mut senders = Vec::with_capacity(local_tracks.len());
        for track in local_tracks {
            let sender = peer_connection
                .add_track(Arc::clone(track))
                .await
                .map_err(|e| Error::PeerConnectionError(format!("Failed to add track: {}", e)))?;
            senders.push(sender);
        }

        Self::install_handlers(&peer_connection, events);

        info!(
            "Created peer connection ({} ICE servers, {} local tracks)",
            config.stun_servers.len() + config.turn_servers.len(),
            senders.len()
        );

        Ok(Self {
            peer_connection,
            _senders: senders,
            closed: AtomicBool::new(false),
        })
    }

    fn install_handlers(
        peer_connection: &Arc<RTCPeerConnection>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) {
        let tx = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => TransportState::New,
                        RTCPeerConnectionState::Connecting => TransportState::Connecting,
                        RTCPeerConnectionState::Connected => TransportState::Connected,
                        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                        RTCPeerConnectionState::Failed => TransportState::Failed,
                        RTCPeerConnectionState::Closed => TransportState::Closed,
                        _ => return,
                    };
                    let _ = tx.send(TransportEvent::StateChanged(state));
                })
            },
        ));

        let tx = events.clone();
        peer_connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            Box::pin(async move {
                info!("Remote peer opened data channel '{}'", dc.label());
                let channel: Arc<dyn FrameChannel> =
                    DataChannel::from_rtc_channel(dc, DataChannelMode::Reliable);
                let _ = tx.send(TransportEvent::DataChannel(channel));
            })
        }));

        let tx = events;
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let media = RemoteMedia {
                    track_id: track.id(),
                    kind: track.kind().to_string(),
                    stream_id: track.stream_id(),
                };
                info!("Remote {} track {} arrived", media.kind, media.track_id);
                let _ = tx.send(TransportEvent::RemoteTrack(media));
            })
        }));
    }

    /// Get the underlying peer connection
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            return Err(Error::SdpError("rollback is not supported".to_string()));
        }
    };
    parsed.map_err(|e| Error::SdpError(format!("Failed to parse session description: {}", e)))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        other => {
            return Err(Error::SdpError(format!("Unexpected description type {}", other)));
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn create_data_channel(
        &self,
        label: &str,
        mode: DataChannelMode,
    ) -> Result<Arc<dyn FrameChannel>> {
        let channel = DataChannel::new(&self.peer_connection, label, mode).await?;
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.peer_connection.close().await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to close peer connection: {}", e))
        })
    }
}

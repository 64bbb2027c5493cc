//! Engine backed by the `webrtc` crate.
//!
//! The engine is a session factory plus a local track registry: hosts
//! register the actual outbound tracks under a stream id, and sessions attach
//! them when asked to carry that stream. Peer-connection callbacks are
//! converted into [`SessionEvent`]s on the session's channel; a remote track
//! is drained until it ends so its removal can be reported.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use super::{
    ConnectivityState, EngineError, IceCandidate, MediaStream, NegotiationRole, SdpKind,
    SessionDescription, SessionEvent, SessionEvents, SessionHandle, SessionInit, TransportEngine,
};
use crate::engine::RtcConfig;
use crate::ids::StreamId;

type TrackRegistry = Mutex<HashMap<StreamId, Vec<Arc<dyn TrackLocal + Send + Sync>>>>;

pub struct WebRtcEngine {
    config: RtcConfig,
    tracks: Arc<TrackRegistry>,
}

impl WebRtcEngine {
    pub fn new(config: RtcConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            tracks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Registers the outbound tracks carried under a stream id. Sessions
    /// asked to attach that stream pick them up from here.
    pub fn register_stream(
        &self,
        id: StreamId,
        tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    ) {
        self.tracks.lock().insert(id, tracks);
    }

    pub fn unregister_stream(&self, id: &StreamId) {
        self.tracks.lock().remove(id);
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl TransportEngine for WebRtcEngine {
    async fn open_session(
        &self,
        init: SessionInit,
    ) -> Result<(Arc<dyn SessionHandle>, SessionEvents), EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| EngineError::Setup(e.to_string()))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| EngineError::Setup(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(|e| EngineError::Setup(e.to_string()))?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Arc::new(WebRtcSession {
            pc: pc.clone(),
            tracks: self.tracks.clone(),
            senders: Mutex::new(HashMap::new()),
            data_channel: tokio::sync::RwLock::new(None),
            events_tx: events_tx.clone(),
            closed: AtomicBool::new(false),
        });

        wire_callbacks(&pc, &session, events_tx);

        if let Some(stream) = &init.media_stream {
            session.add_stream(stream.clone()).await?;
        }
        if let Some(channel) = &init.data_channel {
            if init.role == NegotiationRole::Originator {
                let dc = pc
                    .create_data_channel(
                        &channel.label,
                        Some(RTCDataChannelInit {
                            ordered: Some(channel.ordered),
                            ..Default::default()
                        }),
                    )
                    .await
                    .map_err(|e| EngineError::Data(e.to_string()))?;
                session.adopt_data_channel(dc).await;
            }
            // The answerer picks the remote channel up via on_data_channel.
        }

        Ok((session, events_rx))
    }
}

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    tracks: Arc<TrackRegistry>,
    senders: Mutex<HashMap<StreamId, Vec<Arc<RTCRtpSender>>>>,
    data_channel: tokio::sync::RwLock<Option<Arc<RTCDataChannel>>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    closed: AtomicBool,
}

impl WebRtcSession {
    fn emit(&self, event: SessionEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events_tx.send(event);
    }

    async fn adopt_data_channel(&self, dc: Arc<RTCDataChannel>) {
        let events_tx = self.events_tx.clone();
        dc.on_open(Box::new({
            let events_tx = events_tx.clone();
            move || {
                let _ = events_tx.send(SessionEvent::DataChannelOpen);
                Box::pin(async {})
            }
        }));
        dc.on_message(Box::new({
            let events_tx = events_tx.clone();
            move |msg: DataChannelMessage| {
                let _ = events_tx.send(SessionEvent::DataReceived(msg.data));
                Box::pin(async {})
            }
        }));
        dc.on_close(Box::new(|| {
            debug!(target = "cove::engine", "data channel closed");
            Box::pin(async {})
        }));
        *self.data_channel.write().await = Some(dc);
    }

    fn registered_tracks(
        &self,
        id: &StreamId,
    ) -> Result<Vec<Arc<dyn TrackLocal + Send + Sync>>, EngineError> {
        self.tracks
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::Media(format!("no tracks registered for stream {id}")))
    }
}

#[async_trait]
impl SessionHandle for WebRtcSession {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| EngineError::Ice(e.to_string()))
    }

    async fn add_stream(&self, stream: MediaStream) -> Result<(), EngineError> {
        let tracks = self.registered_tracks(&stream.id)?;
        let mut senders = Vec::with_capacity(tracks.len());
        for track in tracks {
            let sender = self
                .pc
                .add_track(track)
                .await
                .map_err(|e| EngineError::Media(e.to_string()))?;
            senders.push(sender);
        }
        self.senders.lock().insert(stream.id, senders);
        Ok(())
    }

    async fn remove_stream(&self, stream: &StreamId) -> Result<(), EngineError> {
        let senders = self.senders.lock().remove(stream).unwrap_or_default();
        for sender in senders {
            self.pc
                .remove_track(&sender)
                .await
                .map_err(|e| EngineError::Media(e.to_string()))?;
        }
        Ok(())
    }

    async fn replace_stream(
        &self,
        old: Option<&StreamId>,
        new: MediaStream,
    ) -> Result<bool, EngineError> {
        // In-place substitution only works track-for-track on the senders of
        // an already-attached stream.
        let Some(old) = old else { return Ok(false) };
        let old_senders = match self.senders.lock().get(old) {
            Some(senders) => senders.clone(),
            None => return Ok(false),
        };
        let new_tracks = self.registered_tracks(&new.id)?;
        if old_senders.len() != new_tracks.len() {
            return Ok(false);
        }
        for (sender, track) in old_senders.iter().zip(new_tracks) {
            sender
                .replace_track(Some(track))
                .await
                .map_err(|e| EngineError::Media(e.to_string()))?;
        }
        let mut senders = self.senders.lock();
        senders.remove(old);
        senders.insert(new.id, old_senders);
        Ok(true)
    }

    async fn try_send_data(&self, payload: Bytes) -> Result<bool, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        let dc = self.data_channel.read().await.clone();
        let Some(dc) = dc else { return Ok(false) };
        if dc.ready_state() != RTCDataChannelState::Open {
            return Ok(false);
        }
        dc.send(&payload)
            .await
            .map_err(|e| EngineError::Data(e.to_string()))?;
        Ok(true)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.pc.close().await {
            warn!(target = "cove::engine", error = %err, "peer connection close failed");
        }
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|e| EngineError::Negotiation(e.to_string()))
}

fn wire_callbacks(
    pc: &Arc<RTCPeerConnection>,
    session: &Arc<WebRtcSession>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
) {
    pc.on_ice_candidate(Box::new({
        let events_tx = events_tx.clone();
        move |candidate: Option<RTCIceCandidate>| {
            let events_tx = events_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(json) => {
                        let _ = events_tx.send(SessionEvent::CandidateReady(IceCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        }));
                    }
                    Err(err) => {
                        warn!(
                            target = "cove::engine",
                            error = %err,
                            "failed to serialize local candidate"
                        );
                    }
                }
            })
        }
    }));

    pc.on_track(Box::new({
        let events_tx = events_tx.clone();
        move |track, _receiver, _transceiver| {
            let events_tx = events_tx.clone();
            Box::pin(async move {
                let stream = MediaStream::new(track.stream_id());
                let _ = events_tx.send(SessionEvent::StreamAdded(stream.clone()));
                // Drain the track until it ends so the removal is observable.
                tokio::spawn(async move {
                    while track.read_rtp().await.is_ok() {}
                    let _ = events_tx.send(SessionEvent::StreamRemoved(stream));
                });
            })
        }
    }));

    pc.on_data_channel(Box::new({
        let session = session.clone();
        move |dc: Arc<RTCDataChannel>| {
            let session = session.clone();
            Box::pin(async move {
                debug!(
                    target = "cove::engine",
                    label = dc.label(),
                    "remote data channel received"
                );
                session.adopt_data_channel(dc).await;
            })
        }
    }));

    pc.on_peer_connection_state_change(Box::new({
        let events_tx = events_tx.clone();
        move |state: RTCPeerConnectionState| {
            let connectivity = match state {
                RTCPeerConnectionState::New => ConnectivityState::New,
                RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
                RTCPeerConnectionState::Connected => ConnectivityState::Connected,
                RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
                RTCPeerConnectionState::Failed => ConnectivityState::Failed,
                RTCPeerConnectionState::Closed | RTCPeerConnectionState::Unspecified => {
                    ConnectivityState::Closed
                }
            };
            let _ = events_tx.send(SessionEvent::ConnectivityChanged(connectivity));
            Box::pin(async {})
        }
    }));

    pc.on_negotiation_needed(Box::new({
        let events_tx = events_tx.clone();
        move || {
            let _ = events_tx.send(SessionEvent::NegotiationNeeded);
            Box::pin(async {})
        }
    }));

    pc.on_signaling_state_change(Box::new(move |state| {
        let _ = events_tx.send(SessionEvent::SignalingStateChanged(state.to_string()));
        Box::pin(async {})
    }));
}

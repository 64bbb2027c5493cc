//! Seam between the orchestration layer and the transport engine.
//!
//! The engine is the collaborator that actually builds session descriptions,
//! gathers candidates and moves encrypted media/data. This crate only decides
//! *when* those operations run and *how* their results are sequenced, so the
//! engine is behind a trait: [`TransportEngine`] opens sessions, each session
//! is driven through a [`SessionHandle`] and reports back on a channel of
//! [`SessionEvent`]s.
//!
//! Two implementations ship with the crate: [`mock::MockEngine`] for tests and
//! hosts that script engine behavior, and [`webrtc::WebRtcEngine`] backed by
//! the `webrtc` crate.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::ids::StreamId;

pub mod mock;
pub mod webrtc;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("negotiation operation failed: {0}")]
    Negotiation(String),
    #[error("candidate rejected: {0}")]
    Ice(String),
    #[error("media operation failed: {0}")]
    Media(String),
    #[error("data channel operation failed: {0}")]
    Data(String),
    #[error("session is closed")]
    Closed,
}

/// Which side of the offer/answer exchange a session takes. Fixed at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    /// Proactively creates offers.
    Originator,
    /// Only reacts to remote offers.
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// One session description, exchanged over signaling as offer or answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One discovered network path endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Opaque handle to one media stream. The orchestration layer never inspects
/// media; equality is by identifier, and engine implementations resolve the
/// identifier to real tracks on their side of the seam.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    pub id: StreamId,
}

impl MediaStream {
    pub fn new(id: impl Into<StreamId>) -> Self {
        Self { id: id.into() }
    }
}

/// STUN/TURN server entry for engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone)]
pub struct DataChannelInit {
    pub label: String,
    pub ordered: bool,
}

impl Default for DataChannelInit {
    fn default() -> Self {
        Self {
            label: "cove-data".to_string(),
            ordered: true,
        }
    }
}

/// Everything a session needs at creation time.
#[derive(Debug, Clone)]
pub struct SessionInit {
    pub role: NegotiationRole,
    /// Outbound media stream to attach before the first negotiation.
    pub media_stream: Option<MediaStream>,
    /// Declares data-channel intent; the originator creates the channel, the
    /// answerer accepts the remote one.
    pub data_channel: Option<DataChannelInit>,
}

impl SessionInit {
    pub fn media(role: NegotiationRole, stream: Option<MediaStream>) -> Self {
        Self {
            role,
            media_stream: stream,
            data_channel: None,
        }
    }

    pub fn data(role: NegotiationRole, channel: DataChannelInit) -> Self {
        Self {
            role,
            media_stream: None,
            data_channel: Some(channel),
        }
    }
}

/// Coarse connectivity state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous callbacks from one engine session, converted to values.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    CandidateReady(IceCandidate),
    StreamAdded(MediaStream),
    StreamRemoved(MediaStream),
    DataChannelOpen,
    DataReceived(Bytes),
    ConnectivityChanged(ConnectivityState),
    NegotiationNeeded,
    SignalingStateChanged(String),
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Factory for engine sessions. One session per point-to-point link (mesh) or
/// per relay link (SFU).
#[async_trait]
pub trait TransportEngine: Send + Sync {
    async fn open_session(
        &self,
        init: SessionInit,
    ) -> Result<(Arc<dyn SessionHandle>, SessionEvents), EngineError>;
}

/// Operations on one live engine session. Every method may be called after
/// `close`; implementations must absorb that as an error or no-op, never a
/// fault.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    async fn add_stream(&self, stream: MediaStream) -> Result<(), EngineError>;

    async fn remove_stream(&self, stream: &StreamId) -> Result<(), EngineError>;

    /// In-place outbound track substitution. `Ok(false)` means the engine
    /// cannot replace without renegotiation and the caller should fall back to
    /// remove + re-add.
    async fn replace_stream(
        &self,
        old: Option<&StreamId>,
        new: MediaStream,
    ) -> Result<bool, EngineError>;

    /// Hands one frame to the data channel. `Ok(false)` means the channel
    /// cannot accept it right now (back-pressure); the frame was not taken.
    async fn try_send_data(&self, payload: Bytes) -> Result<bool, EngineError>;

    /// Idempotent teardown.
    async fn close(&self);
}

//! Multi-party rooms.
//!
//! A room tracks membership announced by signaling and owns the connections
//! that carry media and data between members. The mesh flavor keeps one
//! connection per remote member; the SFU flavor keeps a single relay link and
//! demultiplexes remote streams back to their owners. Both surface the same
//! [`RoomEvent`] vocabulary.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::connection::ConnectionKind;
use crate::connection::data::{DataConnection, Payload};
use crate::connection::media::MediaConnection;
use crate::engine::{IceCandidate, MediaStream, SessionDescription};
use crate::error::PeerError;
use crate::ids::{ConnectionId, PeerId, RoomName, StreamId};
use crate::signaling::ClientMessage;

pub mod mesh;
pub mod sfu;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    Mesh,
    Sfu,
}

/// Notifications surfaced to the owner of a room, either flavor.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// The local join round-trip completed.
    Open,
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    /// A remote member's stream became available. The owner is known for mesh
    /// connections and for relay streams with a resolved owner mapping.
    Stream {
        stream: MediaStream,
        owner: Option<PeerId>,
    },
    StreamRemoved {
        stream_id: StreamId,
        owner: Option<PeerId>,
    },
    /// Broadcast data from another member.
    Data { src: PeerId, payload: Payload },
    Closed,
    Error(PeerError),
}

/// Membership, lifecycle flags and the outbound channels every room needs.
pub(crate) struct RoomCore {
    name: RoomName,
    local_id: PeerId,
    members: Mutex<HashSet<PeerId>>,
    local_stream: Mutex<Option<MediaStream>>,
    open: AtomicBool,
    closed: AtomicBool,
    signaling_tx: mpsc::UnboundedSender<ClientMessage>,
    events_tx: mpsc::UnboundedSender<RoomEvent>,
}

impl RoomCore {
    pub(crate) fn new(
        name: RoomName,
        local_id: PeerId,
        signaling_tx: mpsc::UnboundedSender<ClientMessage>,
        events_tx: mpsc::UnboundedSender<RoomEvent>,
    ) -> Self {
        Self {
            name,
            local_id,
            members: Mutex::new(HashSet::new()),
            local_stream: Mutex::new(None),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            signaling_tx,
            events_tx,
        }
    }

    pub(crate) fn name(&self) -> &RoomName {
        &self.name
    }

    pub(crate) fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_open(&self) {
        if !self.is_closed() {
            self.open.store(true, Ordering::SeqCst);
        }
    }

    /// First close wins; announces the departure to the room service.
    pub(crate) fn begin_close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.open.store(false, Ordering::SeqCst);
        self.send(ClientMessage::RoomLeave {
            room_name: self.name.clone(),
        });
        true
    }

    pub(crate) fn insert_member(&self, member: PeerId) -> bool {
        self.members.lock().insert(member)
    }

    pub(crate) fn remove_member(&self, member: &PeerId) -> bool {
        self.members.lock().remove(member)
    }

    pub(crate) fn members(&self) -> Vec<PeerId> {
        self.members.lock().iter().cloned().collect()
    }

    pub(crate) fn local_stream(&self) -> Option<MediaStream> {
        self.local_stream.lock().clone()
    }

    pub(crate) fn set_local_stream(&self, stream: MediaStream) {
        *self.local_stream.lock() = Some(stream);
    }

    pub(crate) fn send(&self, message: ClientMessage) {
        let _ = self.signaling_tx.send(message);
    }

    pub(crate) fn emit(&self, event: RoomEvent) {
        if self.is_closed() && !matches!(event, RoomEvent::Closed) {
            return;
        }
        let _ = self.events_tx.send(event);
    }
}

/// One member-facing connection owned by a room.
pub(crate) enum MemberConnection {
    Media(MediaConnection),
    Data(DataConnection),
}

impl MemberConnection {
    pub(crate) fn id(&self) -> &ConnectionId {
        match self {
            MemberConnection::Media(c) => c.id(),
            MemberConnection::Data(c) => c.id(),
        }
    }

    pub(crate) fn kind(&self) -> ConnectionKind {
        match self {
            MemberConnection::Media(_) => ConnectionKind::Media,
            MemberConnection::Data(_) => ConnectionKind::Data,
        }
    }

    pub(crate) async fn handle_answer(&self, answer: SessionDescription) {
        match self {
            MemberConnection::Media(c) => c.handle_answer(answer).await,
            MemberConnection::Data(c) => c.handle_answer(answer).await,
        }
    }

    pub(crate) async fn handle_candidate(&self, candidate: IceCandidate) {
        match self {
            MemberConnection::Media(c) => c.handle_candidate(candidate).await,
            MemberConnection::Data(c) => c.handle_candidate(candidate).await,
        }
    }

    pub(crate) async fn update_offer(&self, offer: SessionDescription) {
        match self {
            MemberConnection::Media(c) => c.update_offer(offer).await,
            MemberConnection::Data(c) => c.update_offer(offer).await,
        }
    }

    pub(crate) async fn close(&self) {
        match self {
            MemberConnection::Media(c) => c.close().await,
            MemberConnection::Data(c) => c.close().await,
        }
    }
}

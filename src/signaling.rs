//! Signaling wire model and inbound dispatch.
//!
//! Outbound intents ([`ClientMessage`]) and inbound notifications
//! ([`ServerMessage`]) are serde-tagged enums; putting them on an actual
//! transport (websocket or otherwise) is the host's concern. The
//! [`SignalingRouter`] dispatches inbound messages to registered rooms (by
//! room name) and standalone connections (by connection id). Unroutable
//! answers and candidates are logged and dropped; an unroutable offer is
//! handed back to the caller, since it announces a connection that does not
//! exist yet.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::connection::ConnectionKind;
use crate::connection::data::DataConnection;
use crate::connection::media::MediaConnection;
use crate::engine::{IceCandidate, SessionDescription};
use crate::ids::{ConnectionId, PeerId, RoomName, StreamId};
use crate::room::RoomType;
use crate::room::mesh::MeshRoom;
use crate::room::sfu::SfuRoom;

/// Outbound signaling intents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    SendOffer {
        dst: PeerId,
        connection_id: ConnectionId,
        connection_kind: ConnectionKind,
        offer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_name: Option<RoomName>,
    },
    SendAnswer {
        dst: PeerId,
        connection_id: ConnectionId,
        answer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_name: Option<RoomName>,
    },
    SendCandidate {
        dst: PeerId,
        connection_id: ConnectionId,
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_name: Option<RoomName>,
    },
    SendLeave {
        dst: PeerId,
        connection_id: ConnectionId,
    },
    RoomJoin {
        room_name: RoomName,
        room_type: RoomType,
    },
    RoomLeave {
        room_name: RoomName,
    },
    RoomSendData {
        room_name: RoomName,
        payload: Value,
    },
    RoomGetUsers {
        room_name: RoomName,
        connection_kind: ConnectionKind,
    },
    SfuGetOffer {
        room_name: RoomName,
    },
    SfuAnswer {
        room_name: RoomName,
        answer: SessionDescription,
    },
    SfuCandidate {
        room_name: RoomName,
        candidate: IceCandidate,
    },
}

/// Inbound signaling notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Offer {
        src: PeerId,
        connection_id: ConnectionId,
        connection_kind: ConnectionKind,
        offer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_name: Option<RoomName>,
    },
    Answer {
        src: PeerId,
        connection_id: ConnectionId,
        answer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_name: Option<RoomName>,
    },
    Candidate {
        src: PeerId,
        connection_id: ConnectionId,
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_name: Option<RoomName>,
    },
    Leave {
        src: PeerId,
    },
    RoomUserJoin {
        room_name: RoomName,
        src: PeerId,
    },
    RoomUserLeave {
        room_name: RoomName,
        src: PeerId,
    },
    RoomData {
        room_name: RoomName,
        src: PeerId,
        payload: Value,
    },
    RoomUsers {
        room_name: RoomName,
        connection_kind: ConnectionKind,
        users: Vec<PeerId>,
    },
    SfuOffer {
        room_name: RoomName,
        src: PeerId,
        offer: SessionDescription,
        /// Remote stream id to owning peer, as known by the relay.
        stream_owners: HashMap<StreamId, PeerId>,
    },
}

/// A registered room, dispatched to by name.
#[derive(Clone)]
pub enum RoomHandle {
    Mesh(MeshRoom),
    Sfu(SfuRoom),
}

/// A registered standalone connection, dispatched to by id.
#[derive(Clone)]
pub enum ConnectionHandle {
    Media(MediaConnection),
    Data(DataConnection),
}

impl ConnectionHandle {
    fn remote_id(&self) -> &PeerId {
        match self {
            ConnectionHandle::Media(c) => c.remote_id(),
            ConnectionHandle::Data(c) => c.remote_id(),
        }
    }

    async fn handle_answer(&self, answer: SessionDescription) {
        match self {
            ConnectionHandle::Media(c) => c.handle_answer(answer).await,
            ConnectionHandle::Data(c) => c.handle_answer(answer).await,
        }
    }

    async fn handle_candidate(&self, candidate: IceCandidate) {
        match self {
            ConnectionHandle::Media(c) => c.handle_candidate(candidate).await,
            ConnectionHandle::Data(c) => c.handle_candidate(candidate).await,
        }
    }

    async fn update_offer(&self, offer: SessionDescription) {
        match self {
            ConnectionHandle::Media(c) => c.update_offer(offer).await,
            ConnectionHandle::Data(c) => c.update_offer(offer).await,
        }
    }

    async fn close(&self) {
        match self {
            ConnectionHandle::Media(c) => c.close().await,
            ConnectionHandle::Data(c) => c.close().await,
        }
    }
}

#[derive(Default)]
pub struct SignalingRouter {
    rooms: RwLock<HashMap<RoomName, RoomHandle>>,
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
}

impl SignalingRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_mesh_room(&self, room: MeshRoom) {
        self.rooms
            .write()
            .insert(room.name().clone(), RoomHandle::Mesh(room));
    }

    pub fn register_sfu_room(&self, room: SfuRoom) {
        self.rooms
            .write()
            .insert(room.name().clone(), RoomHandle::Sfu(room));
    }

    pub fn unregister_room(&self, name: &RoomName) {
        self.rooms.write().remove(name);
    }

    pub fn register_media_connection(&self, connection: MediaConnection) {
        self.connections
            .write()
            .insert(connection.id().clone(), ConnectionHandle::Media(connection));
    }

    pub fn register_data_connection(&self, connection: DataConnection) {
        self.connections
            .write()
            .insert(connection.id().clone(), ConnectionHandle::Data(connection));
    }

    pub fn unregister_connection(&self, id: &ConnectionId) {
        self.connections.write().remove(id);
    }

    fn room(&self, name: &RoomName) -> Option<RoomHandle> {
        self.rooms.read().get(name).cloned()
    }

    fn connection(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.read().get(id).cloned()
    }

    /// Dispatches one inbound message. Returns `None` when the message was
    /// consumed; an `OFFER` with no destination is handed back so the caller
    /// can construct the announced connection.
    pub async fn route(&self, message: ServerMessage) -> Option<ServerMessage> {
        match message {
            ServerMessage::Offer {
                src,
                connection_id,
                connection_kind,
                offer,
                room_name: Some(room_name),
            } => {
                match self.room(&room_name) {
                    Some(RoomHandle::Mesh(room)) => {
                        room.handle_offer(src, connection_id, connection_kind, offer)
                            .await;
                    }
                    Some(RoomHandle::Sfu(_)) => {
                        warn!(
                            target = "cove::signaling",
                            room = %room_name,
                            "peer offer addressed to an SFU room; dropping"
                        );
                    }
                    None => {
                        warn!(
                            target = "cove::signaling",
                            room = %room_name,
                            "offer for unknown room; dropping"
                        );
                    }
                }
                None
            }
            ServerMessage::Offer { ref connection_id, .. } => {
                if let Some(connection) = self.connection(connection_id) {
                    let ServerMessage::Offer { offer, .. } = message else {
                        unreachable!()
                    };
                    connection.update_offer(offer).await;
                    return None;
                }
                // A brand-new incoming connection; the caller owns acceptance.
                Some(message)
            }
            ServerMessage::Answer {
                src,
                connection_id,
                answer,
                room_name,
            } => {
                match room_name {
                    Some(room_name) => match self.room(&room_name) {
                        Some(RoomHandle::Mesh(room)) => {
                            room.handle_answer(src, connection_id, answer).await;
                        }
                        other => {
                            warn!(
                                target = "cove::signaling",
                                room = %room_name,
                                registered = other.is_some(),
                                "unroutable room answer; dropping"
                            );
                        }
                    },
                    None => match self.connection(&connection_id) {
                        Some(connection) => connection.handle_answer(answer).await,
                        None => {
                            warn!(
                                target = "cove::signaling",
                                connection_id = %connection_id,
                                "answer for unknown connection; dropping"
                            );
                        }
                    },
                }
                None
            }
            ServerMessage::Candidate {
                src,
                connection_id,
                candidate,
                room_name,
            } => {
                match room_name {
                    Some(room_name) => match self.room(&room_name) {
                        Some(RoomHandle::Mesh(room)) => {
                            room.handle_candidate(src, connection_id, candidate).await;
                        }
                        Some(RoomHandle::Sfu(room)) => {
                            room.handle_candidate(candidate).await;
                        }
                        None => {
                            warn!(
                                target = "cove::signaling",
                                room = %room_name,
                                "candidate for unknown room; dropping"
                            );
                        }
                    },
                    None => match self.connection(&connection_id) {
                        Some(connection) => connection.handle_candidate(candidate).await,
                        None => {
                            warn!(
                                target = "cove::signaling",
                                connection_id = %connection_id,
                                "candidate for unknown connection; dropping"
                            );
                        }
                    },
                }
                None
            }
            ServerMessage::Leave { src } => {
                let departed: Vec<ConnectionHandle> = self
                    .connections
                    .read()
                    .values()
                    .filter(|c| *c.remote_id() == src)
                    .cloned()
                    .collect();
                debug!(
                    target = "cove::signaling",
                    src = %src,
                    connections = departed.len(),
                    "remote peer left; closing its connections"
                );
                for connection in departed {
                    connection.close().await;
                }
                None
            }
            ServerMessage::RoomUserJoin { room_name, src } => {
                match self.room(&room_name) {
                    Some(RoomHandle::Mesh(room)) => room.handle_join(src).await,
                    Some(RoomHandle::Sfu(room)) => room.handle_join(src).await,
                    None => self.warn_unknown_room(&room_name, "user join"),
                }
                None
            }
            ServerMessage::RoomUserLeave { room_name, src } => {
                match self.room(&room_name) {
                    Some(RoomHandle::Mesh(room)) => room.handle_leave(src).await,
                    Some(RoomHandle::Sfu(room)) => room.handle_leave(src).await,
                    None => self.warn_unknown_room(&room_name, "user leave"),
                }
                None
            }
            ServerMessage::RoomData {
                room_name,
                src,
                payload,
            } => {
                match self.room(&room_name) {
                    Some(RoomHandle::Mesh(room)) => room.handle_data(src, payload),
                    Some(RoomHandle::Sfu(room)) => room.handle_data(src, payload),
                    None => self.warn_unknown_room(&room_name, "broadcast data"),
                }
                None
            }
            ServerMessage::RoomUsers {
                room_name,
                connection_kind,
                users,
            } => {
                match self.room(&room_name) {
                    Some(RoomHandle::Mesh(room)) => {
                        room.handle_users(connection_kind, users).await;
                    }
                    other => {
                        warn!(
                            target = "cove::signaling",
                            room = %room_name,
                            registered = other.is_some(),
                            "unroutable member roster; dropping"
                        );
                    }
                }
                None
            }
            ServerMessage::SfuOffer {
                room_name,
                src,
                offer,
                stream_owners,
            } => {
                match self.room(&room_name) {
                    Some(RoomHandle::Sfu(room)) => {
                        room.handle_offer(src, offer, stream_owners).await;
                    }
                    other => {
                        warn!(
                            target = "cove::signaling",
                            room = %room_name,
                            registered = other.is_some(),
                            "unroutable relay offer; dropping"
                        );
                    }
                }
                None
            }
        }
    }

    fn warn_unknown_room(&self, room_name: &RoomName, what: &str) {
        warn!(
            target = "cove::signaling",
            room = %room_name,
            "{what} for unknown room; dropping"
        );
    }
}

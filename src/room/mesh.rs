//! Full-mesh rooms: one connection per remote member.
//!
//! Joining is a signaling round-trip: the join intent goes out, and the room
//! opens when the service echoes the local member back. Dialing is
//! roster-driven: a media or data intent asks the service for the current
//! member list, and the answering roster fans out into one outgoing
//! connection per remote member. Inbound offers from members create the
//! answering side symmetrically.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{MemberConnection, RoomCore, RoomEvent, RoomType};
use crate::connection::data::{
    DataConnection, DataConnectionEvent, DataConnectionOptions, Payload,
};
use crate::connection::media::{MediaConnection, MediaConnectionEvent, MediaConnectionOptions};
use crate::connection::{ConnectionKind, SignalScope};
use crate::engine::{IceCandidate, MediaStream, SessionDescription, TransportEngine};
use crate::ids::{ConnectionId, PeerId, RoomName};
use crate::signaling::ClientMessage;

struct MeshInner {
    core: RoomCore,
    engine: Arc<dyn TransportEngine>,
    connections: tokio::sync::Mutex<HashMap<PeerId, Vec<MemberConnection>>>,
    /// Dial intent recorded before the join round-trip completed.
    pending_kind: Mutex<Option<ConnectionKind>>,
    forwards: Mutex<Vec<JoinHandle<()>>>,
}

/// A full-mesh room.
#[derive(Clone)]
pub struct MeshRoom {
    inner: Arc<MeshInner>,
}

impl MeshRoom {
    pub fn new(
        engine: Arc<dyn TransportEngine>,
        local_id: PeerId,
        name: RoomName,
        signaling_tx: mpsc::UnboundedSender<ClientMessage>,
    ) -> (Self, mpsc::UnboundedReceiver<RoomEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(MeshInner {
            core: RoomCore::new(name, local_id, signaling_tx, events_tx),
            engine,
            connections: tokio::sync::Mutex::new(HashMap::new()),
            pending_kind: Mutex::new(None),
            forwards: Mutex::new(Vec::new()),
        });
        (Self { inner }, events_rx)
    }

    pub fn name(&self) -> &RoomName {
        self.inner.core.name()
    }

    pub fn local_id(&self) -> &PeerId {
        self.inner.core.local_id()
    }

    pub fn is_open(&self) -> bool {
        self.inner.core.is_open()
    }

    pub fn members(&self) -> Vec<PeerId> {
        self.inner.core.members()
    }

    /// Announces the join intent; the room opens when the service echoes the
    /// local member back through [`handle_join`](Self::handle_join).
    pub fn join(&self) {
        self.inner.core.send(ClientMessage::RoomJoin {
            room_name: self.name().clone(),
            room_type: RoomType::Mesh,
        });
    }

    /// Dials media to every current member (via the roster round-trip).
    pub fn call(&self, local_stream: MediaStream) {
        self.inner.core.set_local_stream(local_stream);
        self.request_roster(ConnectionKind::Media);
    }

    /// Dials a data channel to every current member.
    pub fn connect(&self) {
        self.request_roster(ConnectionKind::Data);
    }

    fn request_roster(&self, kind: ConnectionKind) {
        if self.is_open() {
            self.inner.core.send(ClientMessage::RoomGetUsers {
                room_name: self.name().clone(),
                connection_kind: kind,
            });
        } else {
            *self.inner.pending_kind.lock() = Some(kind);
        }
    }

    /// Broadcasts one payload to the whole room through the service.
    pub fn send(&self, payload: Value) {
        self.inner.core.send(ClientMessage::RoomSendData {
            room_name: self.name().clone(),
            payload,
        });
    }

    /// Substitutes the outbound stream on every media connection.
    pub async fn replace_stream(&self, new: MediaStream) {
        self.inner.core.set_local_stream(new.clone());
        let connections = self.inner.connections.lock().await;
        for member in connections.values().flatten() {
            if let MemberConnection::Media(connection) = member {
                connection.replace_stream(new.clone()).await;
            }
        }
    }

    /// A member joined; the echo of the local member completes the join
    /// round-trip and flushes the recorded dial intent.
    pub async fn handle_join(&self, src: PeerId) {
        if src == *self.local_id() {
            let pending = self.inner.pending_kind.lock().take();
            if let Some(kind) = pending {
                self.inner.core.send(ClientMessage::RoomGetUsers {
                    room_name: self.name().clone(),
                    connection_kind: kind,
                });
            }
            self.inner.core.set_open();
            self.inner.core.emit(RoomEvent::Open);
            return;
        }
        if self.inner.core.insert_member(src.clone()) {
            self.inner.core.emit(RoomEvent::PeerJoined(src));
        }
    }

    /// A member left: its connections are dropped in bulk, not individually
    /// closed. The remote side is gone; the engine's failure path tears the
    /// sessions down.
    pub async fn handle_leave(&self, src: PeerId) {
        let removed = self.inner.connections.lock().await.remove(&src);
        if let Some(connections) = removed {
            debug!(
                target = "cove::room",
                room = %self.name(),
                member = %src,
                connections = connections.len(),
                "dropping connections of departed member"
            );
        }
        if self.inner.core.remove_member(&src) {
            self.inner.core.emit(RoomEvent::PeerLeft(src));
        }
    }

    /// The roster answering a dial intent: one outgoing connection of the
    /// requested kind per remote member that does not have one yet. A member
    /// may carry one media and one data connection at the same time.
    pub async fn handle_users(&self, kind: ConnectionKind, users: Vec<PeerId>) {
        for user in users {
            if user == *self.local_id() {
                continue;
            }
            self.inner.core.insert_member(user.clone());
            let mut connections = self.inner.connections.lock().await;
            let already_dialed = connections
                .get(&user)
                .is_some_and(|existing| existing.iter().any(|c| c.kind() == kind));
            if already_dialed {
                continue;
            }
            match self.dial(kind, user.clone()).await {
                Ok(connection) => {
                    connections.entry(user).or_default().push(connection);
                }
                Err(err) => {
                    warn!(
                        target = "cove::room",
                        room = %self.name(),
                        member = %user,
                        error = %err,
                        "failed to dial room member"
                    );
                    self.inner.core.emit(RoomEvent::Error(err));
                }
            }
        }
    }

    async fn dial(
        &self,
        kind: ConnectionKind,
        user: PeerId,
    ) -> Result<MemberConnection, crate::error::PeerError> {
        let scope = SignalScope::Peer {
            room_name: Some(self.name().clone()),
        };
        match kind {
            ConnectionKind::Media => {
                let Some(local_stream) = self.inner.core.local_stream() else {
                    return Err(crate::error::PeerError::NoLocalStream);
                };
                let (connection, events_rx) = MediaConnection::offer(
                    self.inner.engine.clone(),
                    user.clone(),
                    local_stream,
                    self.signaling_tx(),
                    MediaConnectionOptions {
                        scope,
                        ..Default::default()
                    },
                )
                .await?;
                self.spawn_media_forward(user, events_rx);
                Ok(MemberConnection::Media(connection))
            }
            ConnectionKind::Data => {
                let (connection, events_rx) = DataConnection::open(
                    self.inner.engine.clone(),
                    user.clone(),
                    self.signaling_tx(),
                    DataConnectionOptions {
                        scope,
                        ..Default::default()
                    },
                )
                .await?;
                self.spawn_data_forward(user, events_rx);
                Ok(MemberConnection::Data(connection))
            }
        }
    }

    /// An offer from a member: renegotiation when the connection exists,
    /// otherwise the answering side of a new one.
    pub async fn handle_offer(
        &self,
        src: PeerId,
        connection_id: ConnectionId,
        kind: ConnectionKind,
        offer: SessionDescription,
    ) {
        let mut connections = self.inner.connections.lock().await;
        if let Some(existing) = Self::find(&connections, &src, &connection_id) {
            existing.update_offer(offer).await;
            return;
        }
        self.inner.core.insert_member(src.clone());
        let scope = SignalScope::Peer {
            room_name: Some(self.name().clone()),
        };
        let accepted = match kind {
            ConnectionKind::Media => {
                let (connection, events_rx) = MediaConnection::from_offer(
                    self.inner.engine.clone(),
                    src.clone(),
                    offer,
                    self.signaling_tx(),
                    MediaConnectionOptions {
                        connection_id: Some(connection_id),
                        scope,
                        ..Default::default()
                    },
                );
                match connection.answer(self.inner.core.local_stream()).await {
                    Ok(()) => {
                        self.spawn_media_forward(src.clone(), events_rx);
                        Some(MemberConnection::Media(connection))
                    }
                    Err(err) => {
                        self.inner.core.emit(RoomEvent::Error(err));
                        None
                    }
                }
            }
            ConnectionKind::Data => {
                let result = DataConnection::from_offer(
                    self.inner.engine.clone(),
                    src.clone(),
                    offer,
                    self.signaling_tx(),
                    DataConnectionOptions {
                        connection_id: Some(connection_id),
                        scope,
                        ..Default::default()
                    },
                )
                .await;
                match result {
                    Ok((connection, events_rx)) => {
                        self.spawn_data_forward(src.clone(), events_rx);
                        Some(MemberConnection::Data(connection))
                    }
                    Err(err) => {
                        self.inner.core.emit(RoomEvent::Error(err));
                        None
                    }
                }
            }
        };
        if let Some(connection) = accepted {
            connections.entry(src).or_default().push(connection);
        }
    }

    pub async fn handle_answer(
        &self,
        src: PeerId,
        connection_id: ConnectionId,
        answer: SessionDescription,
    ) {
        let connections = self.inner.connections.lock().await;
        match Self::find(&connections, &src, &connection_id) {
            Some(connection) => connection.handle_answer(answer).await,
            None => {
                warn!(
                    target = "cove::room",
                    room = %self.name(),
                    member = %src,
                    connection_id = %connection_id,
                    "answer for unknown member connection; dropping"
                );
            }
        }
    }

    pub async fn handle_candidate(
        &self,
        src: PeerId,
        connection_id: ConnectionId,
        candidate: IceCandidate,
    ) {
        let connections = self.inner.connections.lock().await;
        match Self::find(&connections, &src, &connection_id) {
            Some(connection) => connection.handle_candidate(candidate).await,
            None => {
                warn!(
                    target = "cove::room",
                    room = %self.name(),
                    member = %src,
                    connection_id = %connection_id,
                    "candidate for unknown member connection; dropping"
                );
            }
        }
    }

    /// Broadcast data relayed by the service.
    pub fn handle_data(&self, src: PeerId, payload: Value) {
        self.inner.core.emit(RoomEvent::Data {
            src,
            payload: Payload::Json(payload),
        });
    }

    /// Idempotent close: tears down every member connection and announces the
    /// departure once.
    pub async fn close(&self) {
        if !self.inner.core.begin_close() {
            return;
        }
        let drained: Vec<MemberConnection> = {
            let mut connections = self.inner.connections.lock().await;
            connections.drain().flat_map(|(_, v)| v).collect()
        };
        for connection in drained {
            connection.close().await;
        }
        self.inner.core.emit(RoomEvent::Closed);
        for task in self.inner.forwards.lock().drain(..) {
            task.abort();
        }
    }

    fn find<'a>(
        connections: &'a HashMap<PeerId, Vec<MemberConnection>>,
        src: &PeerId,
        connection_id: &ConnectionId,
    ) -> Option<&'a MemberConnection> {
        connections
            .get(src)?
            .iter()
            .find(|c| c.id() == connection_id)
    }

    fn signaling_tx(&self) -> mpsc::UnboundedSender<ClientMessage> {
        // RoomCore owns the sender; connections get their own clone.
        self.inner.core.signaling_tx.clone()
    }

    fn spawn_media_forward(
        &self,
        owner: PeerId,
        mut events_rx: mpsc::UnboundedReceiver<MediaConnectionEvent>,
    ) {
        let this = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    MediaConnectionEvent::Stream(stream) => {
                        this.inner.core.emit(RoomEvent::Stream {
                            stream,
                            owner: Some(owner.clone()),
                        });
                    }
                    MediaConnectionEvent::StreamRemoved(stream) => {
                        this.inner.core.emit(RoomEvent::StreamRemoved {
                            stream_id: stream.id,
                            owner: Some(owner.clone()),
                        });
                    }
                    MediaConnectionEvent::Error(err) => {
                        this.inner.core.emit(RoomEvent::Error(err));
                    }
                    MediaConnectionEvent::RenegotiationNeeded => {
                        debug!(
                            target = "cove::room",
                            member = %owner,
                            "member connection requested renegotiation"
                        );
                    }
                    MediaConnectionEvent::Closed => {}
                }
            }
        });
        self.inner.forwards.lock().push(task);
    }

    fn spawn_data_forward(
        &self,
        owner: PeerId,
        mut events_rx: mpsc::UnboundedReceiver<DataConnectionEvent>,
    ) {
        let this = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    DataConnectionEvent::Data(payload) => {
                        this.inner.core.emit(RoomEvent::Data {
                            src: owner.clone(),
                            payload,
                        });
                    }
                    DataConnectionEvent::Error(err) => {
                        this.inner.core.emit(RoomEvent::Error(err));
                    }
                    DataConnectionEvent::Open | DataConnectionEvent::Closed => {}
                }
            }
        });
        self.inner.forwards.lock().push(task);
    }
}

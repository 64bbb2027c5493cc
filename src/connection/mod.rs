//! Point-to-point connections.
//!
//! A connection is a named, directed relationship to exactly one remote
//! identity, wrapping one [`Negotiator`](crate::negotiator::Negotiator). The
//! shared core here correlates inbound signaling to the negotiation session
//! and buffers messages that outrun session readiness; the media and data
//! variants layer their own semantics on top.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::{IceCandidate, SessionDescription};
use crate::ids::{ConnectionId, PeerId, RoomName};
use crate::negotiator::Negotiator;
use crate::signaling::ClientMessage;

pub mod chunk;
pub mod data;
pub mod media;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Media,
    Data,
}

impl ConnectionKind {
    /// Role prefix used when generating connection ids.
    pub(crate) fn id_prefix(self) -> &'static str {
        match self {
            ConnectionKind::Media => "mc",
            ConnectionKind::Data => "dc",
        }
    }
}

/// A signaling message accepted before the negotiation session existed.
/// Queued FIFO and drained exactly once when the session becomes available.
#[derive(Debug, Clone)]
pub enum QueuedSignal {
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

/// Where a connection's outbound signaling goes: to the remote peer directly
/// (optionally tagged with a room name) or to an SFU relay, which speaks its
/// own message family.
#[derive(Debug, Clone)]
pub enum SignalScope {
    Peer { room_name: Option<RoomName> },
    SfuRelay { room_name: RoomName },
}

impl Default for SignalScope {
    fn default() -> Self {
        SignalScope::Peer { room_name: None }
    }
}

/// State shared by both connection kinds.
pub(crate) struct ConnectionShared {
    remote_id: PeerId,
    id: ConnectionId,
    kind: ConnectionKind,
    scope: SignalScope,
    negotiator: Negotiator,
    open: AtomicBool,
    closed: AtomicBool,
    drained: AtomicBool,
    queue: Mutex<VecDeque<QueuedSignal>>,
    signaling_tx: mpsc::UnboundedSender<ClientMessage>,
}

impl ConnectionShared {
    pub(crate) fn new(
        remote_id: PeerId,
        id: Option<ConnectionId>,
        kind: ConnectionKind,
        scope: SignalScope,
        negotiator: Negotiator,
        signaling_tx: mpsc::UnboundedSender<ClientMessage>,
        pending: Vec<QueuedSignal>,
    ) -> Self {
        Self {
            remote_id,
            id: id.unwrap_or_else(|| ConnectionId::generate(kind.id_prefix())),
            kind,
            scope,
            negotiator,
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            drained: AtomicBool::new(false),
            queue: Mutex::new(pending.into()),
            signaling_tx,
        }
    }

    pub(crate) fn remote_id(&self) -> &PeerId {
        &self.remote_id
    }

    pub(crate) fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub(crate) fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Open is monotonic: never set again once the connection closed.
    pub(crate) fn set_open(&self) {
        if !self.is_closed() {
            self.open.store(true, Ordering::SeqCst);
        }
    }

    /// First close wins; returns whether this call should run the side
    /// effects (cleanup, closed notification, leave signal).
    pub(crate) fn begin_close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.open.store(false, Ordering::SeqCst);
        if let SignalScope::Peer { room_name: None } = self.scope {
            self.send(ClientMessage::SendLeave {
                dst: self.remote_id.clone(),
                connection_id: self.id.clone(),
            });
        }
        true
    }

    /// Forwards an answer once the session exists (completing the
    /// description pair, so the connection opens); queues it otherwise.
    pub(crate) async fn handle_answer(&self, answer: SessionDescription) {
        if self.is_closed() {
            return;
        }
        if self.negotiator.has_session() {
            self.negotiator.handle_answer(answer).await;
            self.set_open();
        } else {
            self.queue.lock().push_back(QueuedSignal::Answer(answer));
        }
    }

    /// Same queuing rule as answers, without affecting `open`.
    pub(crate) async fn handle_candidate(&self, candidate: IceCandidate) {
        if self.is_closed() {
            return;
        }
        if self.negotiator.has_session() {
            self.negotiator.handle_candidate(candidate).await;
        } else {
            self.queue.lock().push_back(QueuedSignal::Candidate(candidate));
        }
    }

    /// Processes queued messages strictly in arrival order, once.
    pub(crate) async fn drain_queue(&self) {
        if self.drained.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            let next = self.queue.lock().pop_front();
            let Some(signal) = next else { break };
            match signal {
                QueuedSignal::Answer(answer) => {
                    self.negotiator.handle_answer(answer).await;
                    self.set_open();
                }
                QueuedSignal::Candidate(candidate) => {
                    self.negotiator.handle_candidate(candidate).await;
                }
            }
        }
        debug!(
            target = "cove::connection",
            connection_id = %self.id,
            "pending signaling queue drained"
        );
    }

    pub(crate) fn send(&self, message: ClientMessage) {
        let _ = self.signaling_tx.send(message);
    }

    pub(crate) fn send_offer(&self, offer: SessionDescription) {
        match &self.scope {
            SignalScope::Peer { room_name } => self.send(ClientMessage::SendOffer {
                dst: self.remote_id.clone(),
                connection_id: self.id.clone(),
                connection_kind: self.kind,
                offer,
                room_name: room_name.clone(),
            }),
            SignalScope::SfuRelay { room_name } => {
                // The relay is authoritative for offers; a locally created one
                // means the owner misconfigured the connection.
                warn!(
                    target = "cove::connection",
                    room = %room_name,
                    "dropping locally created offer on an SFU relay link"
                );
            }
        }
    }

    pub(crate) fn send_answer(&self, answer: SessionDescription) {
        match &self.scope {
            SignalScope::Peer { room_name } => self.send(ClientMessage::SendAnswer {
                dst: self.remote_id.clone(),
                connection_id: self.id.clone(),
                answer,
                room_name: room_name.clone(),
            }),
            SignalScope::SfuRelay { room_name } => self.send(ClientMessage::SfuAnswer {
                room_name: room_name.clone(),
                answer,
            }),
        }
    }

    pub(crate) fn send_candidate(&self, candidate: IceCandidate) {
        match &self.scope {
            SignalScope::Peer { room_name } => self.send(ClientMessage::SendCandidate {
                dst: self.remote_id.clone(),
                connection_id: self.id.clone(),
                candidate,
                room_name: room_name.clone(),
            }),
            SignalScope::SfuRelay { room_name } => self.send(ClientMessage::SfuCandidate {
                room_name: room_name.clone(),
                candidate,
            }),
        }
    }
}

//! SFU rooms: one relay link, many members.
//!
//! All media flows over a single connection to the forwarding relay, which is
//! authoritative for offers: the local side only ever answers, and asks for a
//! fresh relay offer when it wants to change what it publishes. Remote
//! streams arrive multiplexed on that one link and are demultiplexed back to
//! their owning member through the stream-owner mapping carried on relay
//! offers; a stream whose owner is not yet known parks until a later mapping
//! resolves it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{RoomCore, RoomEvent, RoomType};
use crate::connection::SignalScope;
use crate::connection::data::Payload;
use crate::connection::media::{MediaConnection, MediaConnectionEvent, MediaConnectionOptions};
use crate::engine::{IceCandidate, MediaStream, SessionDescription, TransportEngine};
use crate::ids::{PeerId, RoomName, StreamId};
use crate::signaling::ClientMessage;

struct SfuInner {
    core: RoomCore,
    engine: Arc<dyn TransportEngine>,
    relay: tokio::sync::Mutex<Option<MediaConnection>>,
    /// Owner of every stream surfaced so far, keyed by stream id.
    surfaced: Mutex<HashMap<StreamId, PeerId>>,
    /// Streams that arrived before their owner mapping.
    unresolved: Mutex<Vec<MediaStream>>,
    /// Stream id to owning member, accumulated from relay offers.
    owner_map: Mutex<HashMap<StreamId, PeerId>>,
    /// Publish intent recorded before the join round-trip completed.
    pending_publish: Mutex<bool>,
    forwards: Mutex<Vec<JoinHandle<()>>>,
}

/// A relay-backed room.
#[derive(Clone)]
pub struct SfuRoom {
    inner: Arc<SfuInner>,
}

impl SfuRoom {
    pub fn new(
        engine: Arc<dyn TransportEngine>,
        local_id: PeerId,
        name: RoomName,
        signaling_tx: mpsc::UnboundedSender<ClientMessage>,
    ) -> (Self, mpsc::UnboundedReceiver<RoomEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SfuInner {
            core: RoomCore::new(name, local_id, signaling_tx, events_tx),
            engine,
            relay: tokio::sync::Mutex::new(None),
            surfaced: Mutex::new(HashMap::new()),
            unresolved: Mutex::new(Vec::new()),
            owner_map: Mutex::new(HashMap::new()),
            pending_publish: Mutex::new(false),
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
    /// local member back.
    pub fn join(&self) {
        self.inner.core.send(ClientMessage::RoomJoin {
            room_name: self.name().clone(),
            room_type: RoomType::Sfu,
        });
    }

    /// Publishes a stream through the relay. On an established relay link the
    /// stream is substituted in place; otherwise a fresh relay offer that
    /// includes the publication is requested.
    pub async fn call(&self, local_stream: MediaStream) {
        self.inner.core.set_local_stream(local_stream.clone());
        if !self.is_open() {
            *self.inner.pending_publish.lock() = true;
            return;
        }
        let relay = self.inner.relay.lock().await.clone();
        match relay {
            Some(relay) => relay.replace_stream(local_stream).await,
            None => self.request_relay_offer(),
        }
    }

    /// Broadcasts one payload to the whole room through the service.
    pub fn send(&self, payload: Value) {
        self.inner.core.send(ClientMessage::RoomSendData {
            room_name: self.name().clone(),
            payload,
        });
    }

    pub async fn handle_join(&self, src: PeerId) {
        if src == *self.local_id() {
            let publish = std::mem::take(&mut *self.inner.pending_publish.lock());
            if publish {
                self.request_relay_offer();
            }
            self.inner.core.set_open();
            self.inner.core.emit(RoomEvent::Open);
            return;
        }
        if self.inner.core.insert_member(src.clone()) {
            self.inner.core.emit(RoomEvent::PeerJoined(src));
        }
    }

    /// A member left: its streams are withdrawn before the membership event.
    pub async fn handle_leave(&self, src: PeerId) {
        let withdrawn: Vec<StreamId> = {
            let mut surfaced = self.inner.surfaced.lock();
            let ids: Vec<StreamId> = surfaced
                .iter()
                .filter(|(_, owner)| **owner == src)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                surfaced.remove(id);
            }
            ids
        };
        self.inner.owner_map.lock().retain(|_, owner| *owner != src);
        for stream_id in withdrawn {
            self.inner.core.emit(RoomEvent::StreamRemoved {
                stream_id,
                owner: Some(src.clone()),
            });
        }
        if self.inner.core.remove_member(&src) {
            self.inner.core.emit(RoomEvent::PeerLeft(src));
        }
    }

    /// A relay offer: first one creates and answers the relay link, later
    /// ones renegotiate it. The carried owner mapping resolves any parked
    /// streams.
    pub async fn handle_offer(
        &self,
        src: PeerId,
        offer: SessionDescription,
        stream_owners: HashMap<StreamId, PeerId>,
    ) {
        self.absorb_owner_map(stream_owners);
        let mut relay = self.inner.relay.lock().await;
        match relay.as_ref() {
            Some(existing) => existing.update_offer(offer).await,
            None => {
                let (connection, events_rx) = MediaConnection::from_offer(
                    self.inner.engine.clone(),
                    src,
                    offer,
                    self.signaling_tx(),
                    MediaConnectionOptions {
                        scope: SignalScope::SfuRelay {
                            room_name: self.name().clone(),
                        },
                        renegotiate_locally: false,
                        ..Default::default()
                    },
                );
                match connection.answer(self.inner.core.local_stream()).await {
                    Ok(()) => {
                        self.spawn_relay_forward(events_rx);
                        *relay = Some(connection);
                    }
                    Err(err) => self.inner.core.emit(RoomEvent::Error(err)),
                }
            }
        }
    }

    /// Relay ICE, best effort before the relay link exists.
    pub async fn handle_candidate(&self, candidate: IceCandidate) {
        let relay = self.inner.relay.lock().await.clone();
        match relay {
            Some(relay) => relay.handle_candidate(candidate).await,
            None => {
                warn!(
                    target = "cove::room",
                    room = %self.name(),
                    "relay candidate before relay link; dropping"
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

    /// Idempotent close: tears down the relay link and announces the
    /// departure once.
    pub async fn close(&self) {
        if !self.inner.core.begin_close() {
            return;
        }
        let relay = self.inner.relay.lock().await.take();
        if let Some(relay) = relay {
            relay.close().await;
        }
        self.inner.core.emit(RoomEvent::Closed);
        for task in self.inner.forwards.lock().drain(..) {
            task.abort();
        }
    }

    fn request_relay_offer(&self) {
        self.inner.core.send(ClientMessage::SfuGetOffer {
            room_name: self.name().clone(),
        });
    }

    fn signaling_tx(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.inner.core.signaling_tx.clone()
    }

    /// The relay is authoritative: each offer's mapping replaces the previous
    /// one. Surfaced streams the new mapping attributes to a different member
    /// resurface under the fresh owner, then any parked streams it resolves
    /// are retried.
    fn absorb_owner_map(&self, stream_owners: HashMap<StreamId, PeerId>) {
        *self.inner.owner_map.lock() = stream_owners;
        let remapped: Vec<MediaStream> = {
            let owner_map = self.inner.owner_map.lock();
            self.inner
                .surfaced
                .lock()
                .iter()
                .filter(|(id, owner)| {
                    owner_map
                        .get(*id)
                        .is_some_and(|now| now != *owner && now != self.local_id())
                })
                .map(|(id, _)| MediaStream::new(id.clone()))
                .collect()
        };
        for stream in remapped {
            self.surface_stream(stream);
        }
        let parked = std::mem::take(&mut *self.inner.unresolved.lock());
        for stream in parked {
            self.surface_stream(stream);
        }
    }

    /// Resolves a multiplexed stream to its owner. Self-owned streams are the
    /// local publication echoed back and are discarded; a stream already
    /// surfaced under the same identity is a renegotiation artifact and is
    /// absorbed, while the same id under a new owner resurfaces with the
    /// fresh attribution; an unmapped stream parks until a mapping arrives.
    fn surface_stream(&self, stream: MediaStream) {
        let owner = self.inner.owner_map.lock().get(&stream.id).cloned();
        match owner {
            Some(owner) if owner == *self.local_id() => {
                debug!(
                    target = "cove::room",
                    room = %self.name(),
                    stream = %stream.id,
                    "discarding echo of the local publication"
                );
            }
            Some(owner) => {
                let mut surfaced = self.inner.surfaced.lock();
                if surfaced.get(&stream.id) == Some(&owner) {
                    return;
                }
                surfaced.insert(stream.id.clone(), owner.clone());
                drop(surfaced);
                self.inner.core.emit(RoomEvent::Stream {
                    stream,
                    owner: Some(owner),
                });
            }
            None => {
                let mut unresolved = self.inner.unresolved.lock();
                if unresolved.iter().all(|s| s.id != stream.id) {
                    unresolved.push(stream);
                }
            }
        }
    }

    /// Purges the stream from every index, then reports the removal — also
    /// for streams that never resolved an owner. The echo of the local
    /// publication stays silent, matching how it surfaced.
    fn withdraw_stream(&self, stream: MediaStream) {
        let surfaced = self.inner.surfaced.lock().remove(&stream.id);
        let mapped = self.inner.owner_map.lock().remove(&stream.id);
        self.inner.unresolved.lock().retain(|s| s.id != stream.id);
        let owner = surfaced.or(mapped);
        if owner.as_ref() == Some(self.local_id()) {
            debug!(
                target = "cove::room",
                room = %self.name(),
                stream = %stream.id,
                "discarding removal echo of the local publication"
            );
            return;
        }
        self.inner.core.emit(RoomEvent::StreamRemoved {
            stream_id: stream.id,
            owner,
        });
    }

    fn spawn_relay_forward(&self, mut events_rx: mpsc::UnboundedReceiver<MediaConnectionEvent>) {
        let this = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    MediaConnectionEvent::Stream(stream) => this.surface_stream(stream),
                    MediaConnectionEvent::StreamRemoved(stream) => this.withdraw_stream(stream),
                    MediaConnectionEvent::RenegotiationNeeded => this.request_relay_offer(),
                    MediaConnectionEvent::Error(err) => {
                        this.inner.core.emit(RoomEvent::Error(err));
                    }
                    MediaConnectionEvent::Closed => {}
                }
            }
        });
        self.inner.forwards.lock().push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SessionEvent;
    use crate::engine::mock::{MockCall, MockEngine};
    use std::time::Duration;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<RoomEvent>) -> RoomEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open")
    }

    async fn next_signal(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> ClientMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("signal within timeout")
            .expect("channel open")
    }

    async fn no_event(rx: &mut mpsc::UnboundedReceiver<RoomEvent>) {
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
    }

    fn room(
        engine: Arc<MockEngine>,
    ) -> (
        SfuRoom,
        mpsc::UnboundedReceiver<RoomEvent>,
        mpsc::UnboundedReceiver<ClientMessage>,
    ) {
        crate::init_test_tracing();
        let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();
        let (room, events_rx) = SfuRoom::new(engine, "peer-a".into(), "studio".into(), signaling_tx);
        (room, events_rx, signaling_rx)
    }

    fn owners(pairs: &[(&str, &str)]) -> HashMap<StreamId, PeerId> {
        pairs
            .iter()
            .map(|(id, owner)| (StreamId::from(*id), PeerId::from(*owner)))
            .collect()
    }

    #[tokio::test]
    async fn relay_offer_is_answered_on_the_relay_family() {
        let engine = MockEngine::new();
        let (room, _events_rx, mut signaling_rx) = room(engine.clone());

        room.handle_offer(
            "relay".into(),
            SessionDescription::offer("v=0 relay"),
            owners(&[]),
        )
        .await;

        let answer = loop {
            match next_signal(&mut signaling_rx).await {
                ClientMessage::SfuAnswer { room_name, .. } => break room_name,
                _ => continue,
            }
        };
        assert_eq!(answer, RoomName::from("studio"));
        assert_eq!(engine.session_count(), 1);
    }

    #[tokio::test]
    async fn map_before_stream_resolves_owner() {
        let engine = MockEngine::new();
        let (room, mut events_rx, _signaling_rx) = room(engine.clone());
        room.handle_offer(
            "relay".into(),
            SessionDescription::offer("v=0 relay"),
            owners(&[("st-b", "peer-b")]),
        )
        .await;

        engine
            .last_session()
            .unwrap()
            .emit(SessionEvent::StreamAdded(MediaStream::new("st-b")));

        assert!(matches!(
            next_event(&mut events_rx).await,
            RoomEvent::Stream { stream, owner: Some(owner) }
                if stream.id.as_str() == "st-b" && owner.as_str() == "peer-b"
        ));
    }

    #[tokio::test]
    async fn stream_before_map_parks_until_resolved() {
        let engine = MockEngine::new();
        let (room, mut events_rx, _signaling_rx) = room(engine.clone());
        room.handle_offer(
            "relay".into(),
            SessionDescription::offer("v=0 relay"),
            owners(&[]),
        )
        .await;

        engine
            .last_session()
            .unwrap()
            .emit(SessionEvent::StreamAdded(MediaStream::new("st-b")));
        no_event(&mut events_rx).await;

        // A later relay offer carries the mapping; exactly one event results.
        room.handle_offer(
            "relay".into(),
            SessionDescription::offer("v=0 relay renegotiated"),
            owners(&[("st-b", "peer-b")]),
        )
        .await;
        assert!(matches!(
            next_event(&mut events_rx).await,
            RoomEvent::Stream { stream, owner: Some(owner) }
                if stream.id.as_str() == "st-b" && owner.as_str() == "peer-b"
        ));
        no_event(&mut events_rx).await;
    }

    #[tokio::test]
    async fn self_owned_and_duplicate_streams_are_absorbed() {
        let engine = MockEngine::new();
        let (room, mut events_rx, _signaling_rx) = room(engine.clone());
        room.handle_offer(
            "relay".into(),
            SessionDescription::offer("v=0 relay"),
            owners(&[("st-a", "peer-a"), ("st-b", "peer-b")]),
        )
        .await;
        let session = engine.last_session().unwrap();

        // Echo of the local publication: discarded.
        session.emit(SessionEvent::StreamAdded(MediaStream::new("st-a")));
        // Same remote stream twice across a renegotiation: surfaced once.
        session.emit(SessionEvent::StreamAdded(MediaStream::new("st-b")));
        session.emit(SessionEvent::StreamAdded(MediaStream::new("st-b")));

        assert!(matches!(
            next_event(&mut events_rx).await,
            RoomEvent::Stream { stream, .. } if stream.id.as_str() == "st-b"
        ));
        no_event(&mut events_rx).await;
    }

    #[tokio::test]
    async fn withdrawal_purges_and_allows_resurfacing() {
        let engine = MockEngine::new();
        let (room, mut events_rx, _signaling_rx) = room(engine.clone());
        room.handle_offer(
            "relay".into(),
            SessionDescription::offer("v=0 relay"),
            owners(&[("st-b", "peer-b")]),
        )
        .await;
        let session = engine.last_session().unwrap();

        session.emit(SessionEvent::StreamAdded(MediaStream::new("st-b")));
        let _ = next_event(&mut events_rx).await;
        session.emit(SessionEvent::StreamRemoved(MediaStream::new("st-b")));
        assert!(matches!(
            next_event(&mut events_rx).await,
            RoomEvent::StreamRemoved { stream_id, owner: Some(owner) }
                if stream_id.as_str() == "st-b" && owner.as_str() == "peer-b"
        ));

        // Re-published under a fresh mapping: surfaces again.
        room.handle_offer(
            "relay".into(),
            SessionDescription::offer("v=0 relay again"),
            owners(&[("st-b", "peer-b")]),
        )
        .await;
        session.emit(SessionEvent::StreamAdded(MediaStream::new("st-b")));
        assert!(matches!(
            next_event(&mut events_rx).await,
            RoomEvent::Stream { stream, .. } if stream.id.as_str() == "st-b"
        ));
    }

    #[tokio::test]
    async fn parked_stream_removal_is_still_reported() {
        let engine = MockEngine::new();
        let (room, mut events_rx, _signaling_rx) = room(engine.clone());
        room.handle_offer(
            "relay".into(),
            SessionDescription::offer("v=0 relay"),
            owners(&[]),
        )
        .await;
        let session = engine.last_session().unwrap();

        // Arrives before any owner mapping: parked, nothing surfaces.
        session.emit(SessionEvent::StreamAdded(MediaStream::new("st-b")));
        no_event(&mut events_rx).await;

        session.emit(SessionEvent::StreamRemoved(MediaStream::new("st-b")));
        assert!(matches!(
            next_event(&mut events_rx).await,
            RoomEvent::StreamRemoved { stream_id, owner: None }
                if stream_id.as_str() == "st-b"
        ));

        // The parked entry is gone; a late mapping resolves nothing.
        room.handle_offer(
            "relay".into(),
            SessionDescription::offer("v=0 relay renegotiated"),
            owners(&[("st-b", "peer-b")]),
        )
        .await;
        no_event(&mut events_rx).await;
    }

    #[tokio::test]
    async fn remapped_stream_resurfaces_under_the_new_owner() {
        let engine = MockEngine::new();
        let (room, mut events_rx, _signaling_rx) = room(engine.clone());
        room.handle_offer(
            "relay".into(),
            SessionDescription::offer("v=0 relay"),
            owners(&[("st-b", "peer-b")]),
        )
        .await;
        let session = engine.last_session().unwrap();

        session.emit(SessionEvent::StreamAdded(MediaStream::new("st-b")));
        assert!(matches!(
            next_event(&mut events_rx).await,
            RoomEvent::Stream { owner: Some(owner), .. } if owner.as_str() == "peer-b"
        ));

        // The relay reattributes the id; the stream resurfaces with the new
        // owner, and an unchanged mapping later stays quiet.
        room.handle_offer(
            "relay".into(),
            SessionDescription::offer("v=0 relay renegotiated"),
            owners(&[("st-b", "peer-c")]),
        )
        .await;
        assert!(matches!(
            next_event(&mut events_rx).await,
            RoomEvent::Stream { owner: Some(owner), .. } if owner.as_str() == "peer-c"
        ));
        room.handle_offer(
            "relay".into(),
            SessionDescription::offer("v=0 relay again"),
            owners(&[("st-b", "peer-c")]),
        )
        .await;
        no_event(&mut events_rx).await;
    }

    #[tokio::test]
    async fn renegotiation_signal_requests_a_fresh_relay_offer() {
        let engine = MockEngine::new();
        let (room, _events_rx, mut signaling_rx) = room(engine.clone());
        room.handle_offer(
            "relay".into(),
            SessionDescription::offer("v=0 relay"),
            owners(&[]),
        )
        .await;

        engine.last_session().unwrap().emit(SessionEvent::NegotiationNeeded);

        loop {
            match next_signal(&mut signaling_rx).await {
                ClientMessage::SfuGetOffer { room_name } => {
                    assert_eq!(room_name, RoomName::from("studio"));
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn publish_requests_offer_without_relay_and_replaces_with_one() {
        let engine = MockEngine::new();
        let (room, mut events_rx, mut signaling_rx) = room(engine.clone());
        room.handle_join("peer-a".into()).await;
        let _ = next_event(&mut events_rx).await; // Open

        room.call(MediaStream::new("cam")).await;
        assert!(matches!(
            next_signal(&mut signaling_rx).await,
            ClientMessage::SfuGetOffer { .. }
        ));

        room.handle_offer(
            "relay".into(),
            SessionDescription::offer("v=0 relay"),
            owners(&[]),
        )
        .await;
        room.call(MediaStream::new("cam-2")).await;
        let session = engine.last_session().unwrap();
        assert_eq!(
            session.call_count(|c| matches!(c, MockCall::ReplaceStream { .. })),
            1
        );
    }

    #[tokio::test]
    async fn pending_publish_flushes_on_join_echo() {
        let engine = MockEngine::new();
        let (room, mut events_rx, mut signaling_rx) = room(engine);

        room.call(MediaStream::new("cam")).await;
        room.join();
        assert!(matches!(
            next_signal(&mut signaling_rx).await,
            ClientMessage::RoomJoin {
                room_type: RoomType::Sfu,
                ..
            }
        ));

        room.handle_join("peer-a".into()).await;
        assert!(matches!(
            next_signal(&mut signaling_rx).await,
            ClientMessage::SfuGetOffer { .. }
        ));
        assert!(matches!(next_event(&mut events_rx).await, RoomEvent::Open));
    }

    #[tokio::test]
    async fn member_leave_withdraws_their_streams_first() {
        let engine = MockEngine::new();
        let (room, mut events_rx, _signaling_rx) = room(engine.clone());
        room.handle_join("peer-b".into()).await;
        let _ = next_event(&mut events_rx).await; // PeerJoined
        room.handle_offer(
            "relay".into(),
            SessionDescription::offer("v=0 relay"),
            owners(&[("st-b", "peer-b")]),
        )
        .await;
        engine
            .last_session()
            .unwrap()
            .emit(SessionEvent::StreamAdded(MediaStream::new("st-b")));
        let _ = next_event(&mut events_rx).await; // Stream

        room.handle_leave("peer-b".into()).await;
        assert!(matches!(
            next_event(&mut events_rx).await,
            RoomEvent::StreamRemoved { stream_id, owner: Some(owner) }
                if stream_id.as_str() == "st-b" && owner.as_str() == "peer-b"
        ));
        assert!(matches!(
            next_event(&mut events_rx).await,
            RoomEvent::PeerLeft(p) if p.as_str() == "peer-b"
        ));
        assert!(room.members().is_empty());
    }

    #[tokio::test]
    async fn close_twice_announces_departure_once() {
        let engine = MockEngine::new();
        let (room, mut events_rx, mut signaling_rx) = room(engine.clone());
        room.handle_offer(
            "relay".into(),
            SessionDescription::offer("v=0 relay"),
            owners(&[]),
        )
        .await;

        room.close().await;
        room.close().await;

        assert!(matches!(next_event(&mut events_rx).await, RoomEvent::Closed));
        assert!(events_rx.try_recv().is_err());
        let mut leaves = 0;
        while let Ok(msg) = signaling_rx.try_recv() {
            if matches!(msg, ClientMessage::RoomLeave { .. }) {
                leaves += 1;
            }
        }
        assert_eq!(leaves, 1);
        assert!(engine.last_session().unwrap().is_closed());
    }
}

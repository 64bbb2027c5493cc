//! Media connections: one outbound/inbound stream per remote party.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use super::{ConnectionKind, ConnectionShared, QueuedSignal, SignalScope};
use crate::engine::{
    MediaStream, NegotiationRole, SessionDescription, SessionInit, TransportEngine,
};
use crate::error::PeerError;
use crate::ids::{ConnectionId, PeerId};
use crate::negotiator::{Negotiator, NegotiatorEvent};
use crate::signaling::ClientMessage;

/// Notifications surfaced to the owner of a media connection.
#[derive(Debug, Clone)]
pub enum MediaConnectionEvent {
    /// A remote stream became available (deduplicated by stream identity).
    Stream(MediaStream),
    StreamRemoved(MediaStream),
    /// The engine wants a renegotiation this connection will not run locally;
    /// the owner decides how to obtain the new offer.
    RenegotiationNeeded,
    Closed,
    Error(PeerError),
}

#[derive(Debug, Clone)]
pub struct MediaConnectionOptions {
    /// Correlation token; generated (`mc_` prefix) when absent.
    pub connection_id: Option<ConnectionId>,
    pub scope: SignalScope,
    /// Whether this side reacts to the engine's renegotiation signal by
    /// creating a fresh offer itself. False on SFU relay links, where the
    /// relay is authoritative for offers.
    pub renegotiate_locally: bool,
    /// Signaling that arrived before this object existed.
    pub pending: Vec<QueuedSignal>,
}

impl Default for MediaConnectionOptions {
    fn default() -> Self {
        Self {
            connection_id: None,
            scope: SignalScope::default(),
            renegotiate_locally: true,
            pending: Vec::new(),
        }
    }
}

struct MediaInner {
    shared: ConnectionShared,
    local_stream: Mutex<Option<MediaStream>>,
    remote_stream: Mutex<Option<MediaStream>>,
    /// Latest remote offer for the not-yet-answered callee path; replaced by
    /// `update_offer` until `answer` consumes it.
    stored_offer: Mutex<Option<SessionDescription>>,
    answered: AtomicBool,
    renegotiate_locally: bool,
    events_tx: mpsc::UnboundedSender<MediaConnectionEvent>,
    forward: Mutex<Option<JoinHandle<()>>>,
}

/// A connection carrying one media stream in each direction.
#[derive(Clone)]
pub struct MediaConnection {
    inner: Arc<MediaInner>,
}

impl MediaConnection {
    /// Caller-side entry point: this side originates the call and already
    /// holds its local stream, so negotiation starts immediately and any
    /// pre-supplied queue is drained.
    pub async fn offer(
        engine: Arc<dyn TransportEngine>,
        remote_id: PeerId,
        local_stream: MediaStream,
        signaling_tx: mpsc::UnboundedSender<ClientMessage>,
        options: MediaConnectionOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<MediaConnectionEvent>), PeerError> {
        let (connection, events_rx, negotiator_rx) =
            Self::build(engine, remote_id, signaling_tx, options, Some(local_stream.clone()));
        connection.inner.answered.store(true, Ordering::SeqCst);
        connection.spawn_forward(negotiator_rx);
        connection
            .inner
            .shared
            .negotiator()
            .start(
                SessionInit::media(NegotiationRole::Originator, Some(local_stream)),
                None,
            )
            .await?;
        connection.inner.shared.drain_queue().await;
        Ok((connection, events_rx))
    }

    /// Callee-side entry point: wraps a received offer without starting
    /// negotiation; `answer` completes the handshake.
    pub fn from_offer(
        engine: Arc<dyn TransportEngine>,
        remote_id: PeerId,
        offer: SessionDescription,
        signaling_tx: mpsc::UnboundedSender<ClientMessage>,
        options: MediaConnectionOptions,
    ) -> (Self, mpsc::UnboundedReceiver<MediaConnectionEvent>) {
        let (connection, events_rx, negotiator_rx) =
            Self::build(engine, remote_id, signaling_tx, options, None);
        *connection.inner.stored_offer.lock() = Some(offer);
        connection.spawn_forward(negotiator_rx);
        (connection, events_rx)
    }

    fn build(
        engine: Arc<dyn TransportEngine>,
        remote_id: PeerId,
        signaling_tx: mpsc::UnboundedSender<ClientMessage>,
        options: MediaConnectionOptions,
        local_stream: Option<MediaStream>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<MediaConnectionEvent>,
        mpsc::UnboundedReceiver<NegotiatorEvent>,
    ) {
        let (negotiator, negotiator_rx) = Negotiator::new(engine);
        let shared = ConnectionShared::new(
            remote_id,
            options.connection_id,
            ConnectionKind::Media,
            options.scope,
            negotiator,
            signaling_tx,
            options.pending,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(MediaInner {
            shared,
            local_stream: Mutex::new(local_stream),
            remote_stream: Mutex::new(None),
            stored_offer: Mutex::new(None),
            answered: AtomicBool::new(false),
            renegotiate_locally: options.renegotiate_locally,
            events_tx,
            forward: Mutex::new(None),
        });
        (Self { inner }, events_rx, negotiator_rx)
    }

    pub fn id(&self) -> &ConnectionId {
        self.inner.shared.id()
    }

    pub fn remote_id(&self) -> &PeerId {
        self.inner.shared.remote_id()
    }

    pub fn is_open(&self) -> bool {
        self.inner.shared.is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_closed()
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.inner.local_stream.lock().clone()
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.inner.remote_stream.lock().clone()
    }

    /// Callee-side accept. A connection may be answered at most once; a
    /// second call is rejected.
    pub async fn answer(&self, local_stream: Option<MediaStream>) -> Result<(), PeerError> {
        if self.inner.answered.swap(true, Ordering::SeqCst) {
            warn!(
                target = "cove::connection",
                connection_id = %self.id(),
                "connection already answered"
            );
            return Err(PeerError::AlreadyAnswered);
        }
        let offer = self.inner.stored_offer.lock().take();
        *self.inner.local_stream.lock() = local_stream.clone();
        self.inner
            .shared
            .negotiator()
            .start(
                SessionInit::media(NegotiationRole::Answerer, local_stream),
                offer,
            )
            .await?;
        self.inner.shared.drain_queue().await;
        self.inner.shared.set_open();
        Ok(())
    }

    /// Substitutes the outbound stream and tracks the new reference.
    pub async fn replace_stream(&self, new: MediaStream) {
        let old = self
            .inner
            .local_stream
            .lock()
            .replace(new.clone())
            .map(|s| s.id);
        self.inner.shared.negotiator().replace_stream(old, new).await;
    }

    pub async fn handle_answer(&self, answer: SessionDescription) {
        self.inner.shared.handle_answer(answer).await;
    }

    pub async fn handle_candidate(&self, candidate: crate::engine::IceCandidate) {
        self.inner.shared.handle_candidate(candidate).await;
    }

    /// A fresh remote offer: forwarded for renegotiation when open, otherwise
    /// it replaces the stored construction payload so the eventual `answer`
    /// uses the latest offer.
    pub async fn update_offer(&self, offer: SessionDescription) {
        if self.is_open() {
            self.inner.shared.negotiator().handle_offer(offer).await;
        } else {
            *self.inner.stored_offer.lock() = Some(offer);
        }
    }

    /// Idempotent close: the closed notification and negotiator teardown run
    /// at most once.
    pub async fn close(&self) {
        if !self.inner.shared.begin_close() {
            return;
        }
        self.inner.shared.negotiator().cleanup().await;
        let _ = self.inner.events_tx.send(MediaConnectionEvent::Closed);
        if let Some(task) = self.inner.forward.lock().take() {
            task.abort();
        }
    }

    fn spawn_forward(&self, mut negotiator_rx: mpsc::UnboundedReceiver<NegotiatorEvent>) {
        let this = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = negotiator_rx.recv().await {
                match event {
                    NegotiatorEvent::OfferCreated(offer) => this.inner.shared.send_offer(offer),
                    NegotiatorEvent::AnswerCreated(answer) => {
                        this.inner.shared.send_answer(answer);
                        this.inner.shared.set_open();
                    }
                    NegotiatorEvent::CandidateReady(candidate) => {
                        this.inner.shared.send_candidate(candidate)
                    }
                    NegotiatorEvent::StreamAdded(stream) => {
                        let mut tracked = this.inner.remote_stream.lock();
                        // The engine may report the same stream twice during
                        // renegotiation; only a genuinely new stream is
                        // surfaced.
                        if tracked.as_ref() == Some(&stream) {
                            continue;
                        }
                        *tracked = Some(stream.clone());
                        drop(tracked);
                        let _ = this.inner.events_tx.send(MediaConnectionEvent::Stream(stream));
                    }
                    NegotiatorEvent::StreamRemoved(stream) => {
                        let mut tracked = this.inner.remote_stream.lock();
                        // A stale removal must not clobber a newer stream.
                        if tracked.as_ref() == Some(&stream) {
                            *tracked = None;
                        }
                        drop(tracked);
                        let _ = this
                            .inner
                            .events_tx
                            .send(MediaConnectionEvent::StreamRemoved(stream));
                    }
                    NegotiatorEvent::NegotiationNeeded => {
                        let originator = matches!(
                            this.inner.shared.negotiator().role(),
                            Some(NegotiationRole::Originator)
                        );
                        if this.inner.renegotiate_locally && originator {
                            this.inner.shared.negotiator().negotiate().await;
                        } else {
                            let _ = this
                                .inner
                                .events_tx
                                .send(MediaConnectionEvent::RenegotiationNeeded);
                        }
                    }
                    NegotiatorEvent::ConnectionFailed => {
                        this.close().await;
                    }
                    NegotiatorEvent::Error(err) => {
                        let _ = this.inner.events_tx.send(MediaConnectionEvent::Error(err));
                    }
                    NegotiatorEvent::DataChannelOpen | NegotiatorEvent::DataReceived(_) => {}
                }
            }
        });
        *self.inner.forward.lock() = Some(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SessionEvent;
    use crate::engine::mock::MockEngine;
    use std::time::Duration;

    async fn next_event(
        rx: &mut mpsc::UnboundedReceiver<MediaConnectionEvent>,
    ) -> MediaConnectionEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open")
    }

    fn signaling() -> (
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::UnboundedReceiver<ClientMessage>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn originator_signals_offer_and_opens_on_answer() {
        let engine = MockEngine::new();
        let (tx, mut signaling_rx) = signaling();
        let (connection, _events) = MediaConnection::offer(
            engine.clone(),
            PeerId::from("bob"),
            MediaStream::new("cam"),
            tx,
            MediaConnectionOptions::default(),
        )
        .await
        .unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), signaling_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(msg, ClientMessage::SendOffer { .. }));
        assert!(!connection.is_open());

        connection
            .handle_answer(SessionDescription::answer("v=0 answer"))
            .await;
        assert!(connection.is_open());
    }

    #[tokio::test]
    async fn queued_signaling_drains_in_order_on_answer() {
        let engine = MockEngine::new();
        let (tx, _signaling_rx) = signaling();
        let (connection, _events) = MediaConnection::from_offer(
            engine.clone(),
            PeerId::from("alice"),
            SessionDescription::offer("v=0 offer"),
            tx,
            MediaConnectionOptions::default(),
        );

        // Signaling outruns session readiness: queue, do not forward.
        connection
            .handle_candidate(crate::engine::IceCandidate {
                candidate: "candidate:1".into(),
                sdp_mid: None,
                sdp_mline_index: None,
            })
            .await;
        connection
            .handle_candidate(crate::engine::IceCandidate {
                candidate: "candidate:2".into(),
                sdp_mid: None,
                sdp_mline_index: None,
            })
            .await;
        assert_eq!(engine.session_count(), 0);

        connection.answer(Some(MediaStream::new("cam"))).await.unwrap();
        assert!(connection.is_open());

        let session = engine.last_session().unwrap();
        let candidates: Vec<_> = session
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                crate::engine::mock::MockCall::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(candidates, vec!["candidate:1", "candidate:2"]);
    }

    #[tokio::test]
    async fn answer_twice_is_rejected() {
        let engine = MockEngine::new();
        let (tx, _rx) = signaling();
        let (connection, _events) = MediaConnection::from_offer(
            engine,
            PeerId::from("alice"),
            SessionDescription::offer("v=0 offer"),
            tx,
            MediaConnectionOptions::default(),
        );
        connection.answer(Some(MediaStream::new("cam"))).await.unwrap();
        assert!(matches!(
            connection.answer(Some(MediaStream::new("cam2"))).await,
            Err(PeerError::AlreadyAnswered)
        ));
    }

    #[tokio::test]
    async fn remote_stream_dedup_and_stale_removal_guard() {
        let engine = MockEngine::new();
        let (tx, _rx) = signaling();
        let (connection, mut events) = MediaConnection::offer(
            engine.clone(),
            PeerId::from("bob"),
            MediaStream::new("cam"),
            tx,
            MediaConnectionOptions::default(),
        )
        .await
        .unwrap();

        let session = engine.last_session().unwrap();
        session.emit(SessionEvent::StreamAdded(MediaStream::new("remote-1")));
        session.emit(SessionEvent::StreamAdded(MediaStream::new("remote-1")));
        session.emit(SessionEvent::StreamAdded(MediaStream::new("remote-2")));
        // Stale removal of the superseded stream must not clear the tracker.
        session.emit(SessionEvent::StreamRemoved(MediaStream::new("remote-1")));

        assert!(matches!(
            next_event(&mut events).await,
            MediaConnectionEvent::Stream(s) if s.id.as_str() == "remote-1"
        ));
        assert!(matches!(
            next_event(&mut events).await,
            MediaConnectionEvent::Stream(s) if s.id.as_str() == "remote-2"
        ));
        assert!(matches!(
            next_event(&mut events).await,
            MediaConnectionEvent::StreamRemoved(s) if s.id.as_str() == "remote-1"
        ));
        assert_eq!(
            connection.remote_stream().map(|s| s.id),
            Some(crate::ids::StreamId::from("remote-2"))
        );
    }

    #[tokio::test]
    async fn close_twice_fires_closed_once() {
        let engine = MockEngine::new();
        let (tx, _rx) = signaling();
        let (connection, mut events) = MediaConnection::offer(
            engine.clone(),
            PeerId::from("bob"),
            MediaStream::new("cam"),
            tx,
            MediaConnectionOptions::default(),
        )
        .await
        .unwrap();

        connection.close().await;
        connection.close().await;
        assert!(matches!(
            next_event(&mut events).await,
            MediaConnectionEvent::Closed
        ));
        assert!(tokio::time::timeout(Duration::from_millis(50), events.recv())
            .await
            .is_err());
        assert!(!connection.is_open());
        assert!(engine.last_session().unwrap().is_closed());
    }

    #[tokio::test]
    async fn update_offer_before_answer_uses_latest_payload() {
        let engine = MockEngine::new();
        let (tx, _rx) = signaling();
        let (connection, _events) = MediaConnection::from_offer(
            engine.clone(),
            PeerId::from("alice"),
            SessionDescription::offer("v=0 stale"),
            tx,
            MediaConnectionOptions::default(),
        );
        connection
            .update_offer(SessionDescription::offer("v=0 fresh"))
            .await;
        connection.answer(None).await.unwrap();

        let session = engine.last_session().unwrap();
        // The remote description applied is the replacement offer.
        assert_eq!(session.remote_descriptions(), vec!["v=0 fresh".to_string()]);
    }
}

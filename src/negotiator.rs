//! Per-session negotiation state machine.
//!
//! A `Negotiator` owns exactly one engine session and runs the full
//! offer/answer/candidate protocol against it, converting the engine's
//! asynchronous callbacks into the closed [`NegotiatorEvent`] vocabulary.
//! Signaling may deliver duplicates and arrive out of order; the machine
//! absorbs both (idempotent offer reapplication, answer-without-pending-offer
//! reinterpreted as a manual renegotiation trigger) instead of faulting.
//!
//! Failures in asynchronous engine operations become `Error` events tagged
//! "webrtc"; the negotiator stays alive and keeps serving subsequent
//! signaling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::{
    ConnectivityState, EngineError, IceCandidate, MediaStream, NegotiationRole,
    SessionDescription, SessionEvent, SessionHandle, SessionInit, TransportEngine,
};
use crate::error::PeerError;
use crate::ids::StreamId;

/// Everything a negotiator can report to its owning connection.
#[derive(Debug, Clone)]
pub enum NegotiatorEvent {
    /// A locally created offer was applied and should be signaled out.
    OfferCreated(SessionDescription),
    /// A locally created answer was applied and should be signaled out.
    AnswerCreated(SessionDescription),
    /// A local candidate should be signaled out.
    CandidateReady(IceCandidate),
    StreamAdded(MediaStream),
    StreamRemoved(MediaStream),
    DataChannelOpen,
    DataReceived(Bytes),
    /// The engine reported permanent connectivity loss.
    ConnectionFailed,
    /// The engine wants a renegotiation; the owner decides who creates the
    /// offer (locally for point-to-point links, the relay for SFU links).
    NegotiationNeeded,
    Error(PeerError),
}

struct Inner {
    engine: Arc<dyn TransportEngine>,
    session: RwLock<Option<Arc<dyn SessionHandle>>>,
    role: RwLock<Option<NegotiationRole>>,
    /// SDP of the most recently applied remote offer; value-identical
    /// redeliveries are suppressed.
    last_offer: Mutex<Option<String>>,
    /// True between emitting a locally created offer and applying the
    /// matching answer.
    awaiting_answer: AtomicBool,
    closed: AtomicBool,
    events_tx: mpsc::UnboundedSender<NegotiatorEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Negotiator {
    inner: Arc<Inner>,
}

impl Negotiator {
    pub fn new(
        engine: Arc<dyn TransportEngine>,
    ) -> (Self, mpsc::UnboundedReceiver<NegotiatorEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            engine,
            session: RwLock::new(None),
            role: RwLock::new(None),
            last_offer: Mutex::new(None),
            awaiting_answer: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events_tx,
            pump: Mutex::new(None),
        });
        (Self { inner }, events_rx)
    }

    /// Opens the engine session and kicks off negotiation. Originators create
    /// and apply the first offer; answerers immediately apply `remote_offer`.
    pub async fn start(
        &self,
        init: SessionInit,
        remote_offer: Option<SessionDescription>,
    ) -> Result<(), PeerError> {
        let role = init.role;
        let (session, events) = self
            .inner
            .engine
            .open_session(init)
            .await
            .map_err(|err| PeerError::Webrtc(err.to_string()))?;
        *self.inner.session.write() = Some(session);
        *self.inner.role.write() = Some(role);
        self.spawn_pump(events);

        match role {
            NegotiationRole::Originator => self.negotiate().await,
            NegotiationRole::Answerer => {
                if let Some(offer) = remote_offer {
                    self.handle_offer(offer).await;
                }
            }
        }
        Ok(())
    }

    pub fn has_session(&self) -> bool {
        self.inner.session.read().is_some()
    }

    pub fn role(&self) -> Option<NegotiationRole> {
        *self.inner.role.read()
    }

    pub fn awaiting_answer(&self) -> bool {
        self.inner.awaiting_answer.load(Ordering::SeqCst)
    }

    /// Creates, applies and emits a fresh local offer.
    pub async fn negotiate(&self) {
        let Some(session) = self.session() else {
            return;
        };
        let offer = match session.create_offer().await {
            Ok(offer) => offer,
            Err(err) => return self.emit_engine_error(err),
        };
        if let Err(err) = session.set_local_description(offer.clone()).await {
            return self.emit_engine_error(err);
        }
        self.inner.awaiting_answer.store(true, Ordering::SeqCst);
        self.emit(NegotiatorEvent::OfferCreated(offer));
    }

    /// Applies a remote offer and produces the answer. Value-identical
    /// redelivery of the last applied offer is a no-op.
    pub async fn handle_offer(&self, offer: SessionDescription) {
        let Some(session) = self.session() else {
            return;
        };
        if self.inner.last_offer.lock().as_deref() == Some(offer.sdp.as_str()) {
            debug!(target = "cove::negotiator", "duplicate remote offer suppressed");
            return;
        }
        if let Err(err) = session.set_remote_description(offer.clone()).await {
            return self.emit_engine_error(err);
        }
        *self.inner.last_offer.lock() = Some(offer.sdp);
        let answer = match session.create_answer().await {
            Ok(answer) => answer,
            Err(err) => return self.emit_engine_error(err),
        };
        if let Err(err) = session.set_local_description(answer.clone()).await {
            return self.emit_engine_error(err);
        }
        self.emit(NegotiatorEvent::AnswerCreated(answer));
    }

    /// Applies a remote answer if one is pending. An answer arriving with no
    /// offer in flight is reinterpreted as a manual renegotiation trigger
    /// (covers out-of-order delivery after a side-channel renegotiation
    /// request).
    pub async fn handle_answer(&self, answer: SessionDescription) {
        let Some(session) = self.session() else {
            return;
        };
        if self.inner.awaiting_answer.swap(false, Ordering::SeqCst) {
            if let Err(err) = session.set_remote_description(answer).await {
                self.emit_engine_error(err);
            }
        } else {
            debug!(
                target = "cove::negotiator",
                "answer with no offer in flight; treating as renegotiation trigger"
            );
            self.negotiate().await;
        }
    }

    /// Candidates are best effort; failures are logged, never escalated.
    pub async fn handle_candidate(&self, candidate: IceCandidate) {
        let Some(session) = self.session() else {
            return;
        };
        if let Err(err) = session.add_ice_candidate(candidate).await {
            warn!(
                target = "cove::negotiator",
                error = %err,
                "failed to apply remote candidate"
            );
        }
    }

    /// Substitutes the outbound stream, in place when the engine supports it,
    /// otherwise by remove → one-tick deferral → re-add → forced
    /// renegotiation. A failure surfaces as one error event; there is no
    /// automatic retry.
    pub async fn replace_stream(&self, old: Option<StreamId>, new: MediaStream) {
        let Some(session) = self.session() else {
            return;
        };
        match session.replace_stream(old.as_ref(), new.clone()).await {
            Ok(true) => {}
            Ok(false) => {
                if let Some(old) = old {
                    if let Err(err) = session.remove_stream(&old).await {
                        return self.emit_engine_error(err);
                    }
                }
                // One tick so the engine's renegotiation signal fires with the
                // old stream already detached.
                tokio::task::yield_now().await;
                if let Err(err) = session.add_stream(new).await {
                    return self.emit_engine_error(err);
                }
                self.negotiate().await;
            }
            Err(err) => self.emit_engine_error(err),
        }
    }

    /// Hands one encoded frame to the data channel. `Ok(false)` signals
    /// back-pressure.
    pub(crate) async fn try_send_data(&self, payload: Bytes) -> Result<bool, PeerError> {
        let Some(session) = self.session() else {
            return Err(PeerError::NotOpen);
        };
        session
            .try_send_data(payload)
            .await
            .map_err(|err| PeerError::Webrtc(err.to_string()))
    }

    /// Idempotent teardown; safe on a never-started negotiator. In-flight
    /// completions after this point are absorbed as no-ops.
    pub async fn cleanup(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
        let session = self.inner.session.write().take();
        if let Some(session) = session {
            session.close().await;
        }
    }

    fn session(&self) -> Option<Arc<dyn SessionHandle>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.inner.session.read().clone()
    }

    fn emit(&self, event: NegotiatorEvent) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.events_tx.send(event);
    }

    fn emit_engine_error(&self, err: EngineError) {
        warn!(target = "cove::negotiator", error = %err, "negotiation step failed");
        self.emit(NegotiatorEvent::Error(PeerError::Webrtc(err.to_string())));
    }

    fn spawn_pump(&self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::CandidateReady(candidate) => {
                        this.emit(NegotiatorEvent::CandidateReady(candidate));
                    }
                    SessionEvent::StreamAdded(stream) => {
                        this.emit(NegotiatorEvent::StreamAdded(stream));
                    }
                    SessionEvent::StreamRemoved(stream) => {
                        this.emit(NegotiatorEvent::StreamRemoved(stream));
                    }
                    SessionEvent::DataChannelOpen => {
                        this.emit(NegotiatorEvent::DataChannelOpen);
                    }
                    SessionEvent::DataReceived(payload) => {
                        this.emit(NegotiatorEvent::DataReceived(payload));
                    }
                    SessionEvent::ConnectivityChanged(state) => match state {
                        ConnectivityState::Failed => {
                            this.emit(NegotiatorEvent::ConnectionFailed);
                        }
                        other => {
                            debug!(
                                target = "cove::negotiator",
                                state = ?other,
                                "connectivity state changed"
                            );
                        }
                    },
                    SessionEvent::NegotiationNeeded => {
                        this.emit(NegotiatorEvent::NegotiationNeeded);
                    }
                    SessionEvent::SignalingStateChanged(state) => {
                        debug!(
                            target = "cove::negotiator",
                            state = %state,
                            "signaling state changed"
                        );
                    }
                }
            }
        });
        *self.inner.pump.lock() = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockCall, MockEngine};
    use std::time::Duration;

    async fn next_event(
        rx: &mut mpsc::UnboundedReceiver<NegotiatorEvent>,
    ) -> NegotiatorEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open")
    }

    #[tokio::test]
    async fn originator_creates_and_applies_offer() {
        let engine = MockEngine::new();
        let (negotiator, mut rx) = Negotiator::new(engine.clone());
        negotiator
            .start(SessionInit::media(NegotiationRole::Originator, None), None)
            .await
            .unwrap();

        assert!(matches!(
            next_event(&mut rx).await,
            NegotiatorEvent::OfferCreated(_)
        ));
        assert!(negotiator.awaiting_answer());
        let session = engine.last_session().unwrap();
        assert_eq!(
            session.calls()[..2],
            [MockCall::CreateOffer, MockCall::SetLocal(crate::engine::SdpKind::Offer)]
        );
    }

    #[tokio::test]
    async fn duplicate_offer_yields_single_answer() {
        let engine = MockEngine::new();
        let (negotiator, mut rx) = Negotiator::new(engine.clone());
        let offer = SessionDescription::offer("v=0 remote");
        negotiator
            .start(
                SessionInit::media(NegotiationRole::Answerer, None),
                Some(offer.clone()),
            )
            .await
            .unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            NegotiatorEvent::AnswerCreated(_)
        ));

        negotiator.handle_offer(offer).await;
        let session = engine.last_session().unwrap();
        assert_eq!(session.call_count(|c| matches!(c, MockCall::CreateAnswer)), 1);
    }

    #[tokio::test]
    async fn answer_clears_awaiting_flag() {
        let engine = MockEngine::new();
        let (negotiator, mut rx) = Negotiator::new(engine.clone());
        negotiator
            .start(SessionInit::media(NegotiationRole::Originator, None), None)
            .await
            .unwrap();
        let NegotiatorEvent::OfferCreated(_) = next_event(&mut rx).await else {
            panic!("expected offer");
        };

        negotiator
            .handle_answer(SessionDescription::answer("v=0 remote answer"))
            .await;
        assert!(!negotiator.awaiting_answer());
        let session = engine.last_session().unwrap();
        assert_eq!(
            session.call_count(|c| matches!(c, MockCall::SetRemote(crate::engine::SdpKind::Answer))),
            1
        );
    }

    #[tokio::test]
    async fn unsolicited_answer_triggers_manual_negotiation() {
        let engine = MockEngine::new();
        let (negotiator, mut rx) = Negotiator::new(engine.clone());
        negotiator
            .start(
                SessionInit::media(NegotiationRole::Answerer, None),
                Some(SessionDescription::offer("v=0 remote")),
            )
            .await
            .unwrap();
        let _ = next_event(&mut rx).await; // AnswerCreated

        negotiator
            .handle_answer(SessionDescription::answer("v=0 stray"))
            .await;
        assert!(matches!(
            next_event(&mut rx).await,
            NegotiatorEvent::OfferCreated(_)
        ));
        assert!(negotiator.awaiting_answer());
    }

    #[tokio::test]
    async fn failed_answer_creation_emits_error_and_stays_usable() {
        let engine = MockEngine::new();
        engine.configure(|b| b.fail_create_answer = true);
        let (negotiator, mut rx) = Negotiator::new(engine.clone());
        negotiator
            .start(
                SessionInit::media(NegotiationRole::Answerer, None),
                Some(SessionDescription::offer("v=0 first")),
            )
            .await
            .unwrap();
        let NegotiatorEvent::Error(err) = next_event(&mut rx).await else {
            panic!("expected error event");
        };
        assert_eq!(err.kind(), "webrtc");

        // Negotiator survives: a fresh offer succeeds once the engine does.
        engine.last_session().unwrap().configure(|b| b.fail_create_answer = false);
        negotiator
            .handle_offer(SessionDescription::offer("v=0 second"))
            .await;
        assert!(matches!(
            next_event(&mut rx).await,
            NegotiatorEvent::AnswerCreated(_)
        ));
    }

    #[tokio::test]
    async fn candidate_failure_is_swallowed() {
        let engine = MockEngine::new();
        engine.configure(|b| b.fail_add_candidate = true);
        let (negotiator, mut rx) = Negotiator::new(engine.clone());
        negotiator
            .start(SessionInit::media(NegotiationRole::Originator, None), None)
            .await
            .unwrap();
        let _ = next_event(&mut rx).await; // OfferCreated

        negotiator
            .handle_candidate(IceCandidate {
                candidate: "candidate:1".into(),
                sdp_mid: None,
                sdp_mline_index: None,
            })
            .await;
        // No error event; the next thing on the channel would block, so just
        // check the call was attempted.
        let session = engine.last_session().unwrap();
        assert_eq!(session.call_count(|c| matches!(c, MockCall::AddCandidate(_))), 1);
    }

    #[tokio::test]
    async fn replace_falls_back_to_remove_and_readd() {
        let engine = MockEngine::new();
        engine.configure(|b| b.supports_replace = false);
        let (negotiator, mut rx) = Negotiator::new(engine.clone());
        let first = MediaStream::new("s-old");
        negotiator
            .start(
                SessionInit::media(NegotiationRole::Originator, Some(first.clone())),
                None,
            )
            .await
            .unwrap();
        let _ = next_event(&mut rx).await; // OfferCreated

        negotiator
            .replace_stream(Some(first.id.clone()), MediaStream::new("s-new"))
            .await;

        let session = engine.last_session().unwrap();
        let calls = session.calls();
        let remove_at = calls
            .iter()
            .position(|c| matches!(c, MockCall::RemoveStream(id) if id.as_str() == "s-old"))
            .expect("remove recorded");
        let add_at = calls
            .iter()
            .position(|c| matches!(c, MockCall::AddStream(id) if id.as_str() == "s-new"))
            .expect("add recorded");
        assert!(remove_at < add_at);
        // Forced renegotiation follows the re-add.
        assert!(matches!(
            next_event(&mut rx).await,
            NegotiatorEvent::OfferCreated(_)
        ));
    }

    #[tokio::test]
    async fn replace_in_place_skips_renegotiation() {
        let engine = MockEngine::new();
        let (negotiator, mut rx) = Negotiator::new(engine.clone());
        negotiator
            .start(SessionInit::media(NegotiationRole::Originator, None), None)
            .await
            .unwrap();
        let _ = next_event(&mut rx).await;

        negotiator.replace_stream(None, MediaStream::new("s1")).await;
        let session = engine.last_session().unwrap();
        assert_eq!(session.call_count(|c| matches!(c, MockCall::ReplaceStream { .. })), 1);
        assert_eq!(session.call_count(|c| matches!(c, MockCall::CreateOffer)), 1);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_safe_when_never_started() {
        let engine = MockEngine::new();
        let (negotiator, _rx) = Negotiator::new(engine.clone());
        negotiator.cleanup().await;
        negotiator.cleanup().await;
        assert_eq!(engine.session_count(), 0);

        let (negotiator, mut rx) = Negotiator::new(engine.clone());
        negotiator
            .start(SessionInit::media(NegotiationRole::Originator, None), None)
            .await
            .unwrap();
        let _ = next_event(&mut rx).await;
        negotiator.cleanup().await;
        negotiator.cleanup().await;
        let session = engine.last_session().unwrap();
        assert!(session.is_closed());
        // Post-cleanup signaling is a no-op, not a fault.
        negotiator
            .handle_offer(SessionDescription::offer("v=0 late"))
            .await;
        assert_eq!(session.call_count(|c| matches!(c, MockCall::CreateAnswer)), 0);
    }

    #[tokio::test]
    async fn engine_failure_event_maps_to_connection_failed() {
        let engine = MockEngine::new();
        let (negotiator, mut rx) = Negotiator::new(engine.clone());
        negotiator
            .start(SessionInit::media(NegotiationRole::Originator, None), None)
            .await
            .unwrap();
        let _ = next_event(&mut rx).await;

        engine
            .last_session()
            .unwrap()
            .emit(SessionEvent::ConnectivityChanged(ConnectivityState::Failed));
        assert!(matches!(
            next_event(&mut rx).await,
            NegotiatorEvent::ConnectionFailed
        ));
    }
}

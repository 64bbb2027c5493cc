//! Scriptable in-process engine.
//!
//! Records every call a session receives, produces canned descriptions, and
//! exposes knobs for failure injection and data-channel back-pressure. The
//! crate's own state-machine tests are built on it; hosts can use it to test
//! their orchestration wiring without touching the network.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    EngineError, IceCandidate, MediaStream, SdpKind, SessionDescription, SessionEvent,
    SessionEvents, SessionHandle, SessionInit, TransportEngine,
};
use crate::ids::StreamId;

/// Behavior knobs, copied into each session at open time.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub fail_create_offer: bool,
    pub fail_create_answer: bool,
    pub fail_set_remote: bool,
    pub fail_add_candidate: bool,
    /// Whether `replace_stream` succeeds in place (`Ok(true)`).
    pub supports_replace: bool,
    /// Number of `try_send_data` calls to refuse before accepting.
    pub refuse_data_sends: u32,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            fail_create_offer: false,
            fail_create_answer: false,
            fail_set_remote: false,
            fail_add_candidate: false,
            supports_replace: true,
            refuse_data_sends: 0,
        }
    }
}

/// Everything a session was asked to do, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    AddStream(StreamId),
    RemoveStream(StreamId),
    ReplaceStream {
        old: Option<StreamId>,
        new: StreamId,
    },
    TrySendData(usize),
    Close,
}

pub struct MockEngine {
    behavior: Mutex<MockBehavior>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(MockBehavior::default()),
            sessions: Mutex::new(Vec::new()),
        })
    }

    /// Adjusts behavior applied to sessions opened after this call.
    pub fn configure(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut self.behavior.lock());
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().last().cloned()
    }
}

#[async_trait]
impl TransportEngine for MockEngine {
    async fn open_session(
        &self,
        init: SessionInit,
    ) -> Result<(Arc<dyn SessionHandle>, SessionEvents), EngineError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Arc::new(MockSession {
            init,
            behavior: Mutex::new(self.behavior.lock().clone()),
            calls: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            remote_sdps: Mutex::new(Vec::new()),
            events_tx,
            closed: AtomicBool::new(false),
            sdp_counter: AtomicU32::new(0),
        });
        self.sessions.lock().push(session.clone());
        Ok((session, events_rx))
    }
}

pub struct MockSession {
    init: SessionInit,
    behavior: Mutex<MockBehavior>,
    calls: Mutex<Vec<MockCall>>,
    sent: Mutex<Vec<Bytes>>,
    remote_sdps: Mutex<Vec<String>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    closed: AtomicBool,
    sdp_counter: AtomicU32,
}

impl MockSession {
    pub fn init(&self) -> &SessionInit {
        &self.init
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, matcher: impl Fn(&MockCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| matcher(c)).count()
    }

    /// Frames the session accepted through `try_send_data`.
    pub fn sent_frames(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// SDP bodies applied as remote descriptions, in order.
    pub fn remote_descriptions(&self) -> Vec<String> {
        self.remote_sdps.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Injects an engine callback, as if the transport had fired it.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn configure(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut self.behavior.lock());
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().push(call);
    }

    fn next_sdp(&self, label: &str) -> String {
        let n = self.sdp_counter.fetch_add(1, Ordering::SeqCst);
        format!("v=0\r\no=mock {label} {n}\r\n")
    }
}

#[async_trait]
impl SessionHandle for MockSession {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.record(MockCall::CreateOffer);
        if self.behavior.lock().fail_create_offer {
            return Err(EngineError::Negotiation("scripted offer failure".into()));
        }
        Ok(SessionDescription::offer(self.next_sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.record(MockCall::CreateAnswer);
        if self.behavior.lock().fail_create_answer {
            return Err(EngineError::Negotiation("scripted answer failure".into()));
        }
        Ok(SessionDescription::answer(self.next_sdp("answer")))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.record(MockCall::SetLocal(desc.kind));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.record(MockCall::SetRemote(desc.kind));
        if self.behavior.lock().fail_set_remote {
            return Err(EngineError::Negotiation(
                "scripted remote description failure".into(),
            ));
        }
        self.remote_sdps.lock().push(desc.sdp);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.record(MockCall::AddCandidate(candidate.candidate.clone()));
        if self.behavior.lock().fail_add_candidate {
            return Err(EngineError::Ice("scripted candidate failure".into()));
        }
        Ok(())
    }

    async fn add_stream(&self, stream: MediaStream) -> Result<(), EngineError> {
        self.record(MockCall::AddStream(stream.id));
        Ok(())
    }

    async fn remove_stream(&self, stream: &StreamId) -> Result<(), EngineError> {
        self.record(MockCall::RemoveStream(stream.clone()));
        Ok(())
    }

    async fn replace_stream(
        &self,
        old: Option<&StreamId>,
        new: MediaStream,
    ) -> Result<bool, EngineError> {
        self.record(MockCall::ReplaceStream {
            old: old.cloned(),
            new: new.id,
        });
        Ok(self.behavior.lock().supports_replace)
    }

    async fn try_send_data(&self, payload: Bytes) -> Result<bool, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        self.record(MockCall::TrySendData(payload.len()));
        {
            let mut behavior = self.behavior.lock();
            if behavior.refuse_data_sends > 0 {
                behavior.refuse_data_sends -= 1;
                return Ok(false);
            }
        }
        self.sent.lock().push(payload);
        Ok(true)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record(MockCall::Close);
        }
    }
}

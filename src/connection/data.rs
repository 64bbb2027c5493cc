//! Data connections: an application data channel with message framing,
//! chunking and send-buffering.
//!
//! Outbound messages are serialized according to the connection's declared
//! [`Serialization`] mode, framed and split into chunks below the interop
//! limit, and handed to the engine channel. When the channel refuses a frame
//! (back-pressure) the remainder parks in an ordered buffer that a background
//! flusher drains; a frame leaves the buffer only after the engine confirmed
//! the hand-off. Inbound chunks are reassembled per message id and dispatched
//! through ordinary message handling.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use super::chunk::{self, Reassembler};
use super::{ConnectionKind, ConnectionShared, QueuedSignal, SignalScope};
use crate::engine::{
    DataChannelInit, NegotiationRole, SessionDescription, SessionInit, TransportEngine,
};
use crate::error::PeerError;
use crate::ids::{ConnectionId, PeerId};
use crate::negotiator::{Negotiator, NegotiatorEvent};
use crate::signaling::ClientMessage;

const FLUSH_RETRY_INTERVAL: Duration = Duration::from_millis(50);

const TAG_BINARY: u8 = 0;
const TAG_TEXT: u8 = 1;
const TAG_JSON: u8 = 2;

/// How application messages are encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Serialization {
    /// Tagged binary-safe framing; carries binary, text and JSON payloads.
    Binary,
    /// JSON text; carries text and JSON payloads.
    Json,
    /// Unframed passthrough: bytes in, bytes out, no chunking.
    Raw,
}

/// One application message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Binary(Bytes),
    Text(String),
    Json(serde_json::Value),
}

/// Notifications surfaced to the owner of a data connection.
#[derive(Debug, Clone)]
pub enum DataConnectionEvent {
    /// The underlying channel is ready to carry traffic.
    Open,
    Data(Payload),
    Closed,
    Error(PeerError),
}

#[derive(Debug, Clone)]
pub struct DataConnectionOptions {
    /// Correlation token; generated (`dc_` prefix) when absent.
    pub connection_id: Option<ConnectionId>,
    pub scope: SignalScope,
    pub serialization: Serialization,
    /// Data-channel label; defaults to the connection id.
    pub label: Option<String>,
    /// Signaling that arrived before this object existed.
    pub pending: Vec<QueuedSignal>,
}

impl Default for DataConnectionOptions {
    fn default() -> Self {
        Self {
            connection_id: None,
            scope: SignalScope::default(),
            serialization: Serialization::Binary,
            label: None,
            pending: Vec::new(),
        }
    }
}

struct DataInner {
    shared: ConnectionShared,
    serialization: Serialization,
    label: String,
    reassembler: Mutex<Reassembler>,
    send_buffer: Mutex<VecDeque<Bytes>>,
    flushing: AtomicBool,
    events_tx: mpsc::UnboundedSender<DataConnectionEvent>,
    forward: Mutex<Option<JoinHandle<()>>>,
}

/// A connection carrying an application data channel.
#[derive(Clone)]
pub struct DataConnection {
    inner: Arc<DataInner>,
}

impl DataConnection {
    /// Originator-side entry point: creates the data channel and starts
    /// negotiation immediately, then drains any pre-supplied queue.
    pub async fn open(
        engine: Arc<dyn TransportEngine>,
        remote_id: PeerId,
        signaling_tx: mpsc::UnboundedSender<ClientMessage>,
        options: DataConnectionOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DataConnectionEvent>), PeerError> {
        let (connection, events_rx, negotiator_rx) =
            Self::build(engine, remote_id, signaling_tx, options);
        connection.spawn_forward(negotiator_rx);
        let init = SessionInit::data(NegotiationRole::Originator, connection.channel_init());
        connection.inner.shared.negotiator().start(init, None).await?;
        connection.inner.shared.drain_queue().await;
        Ok((connection, events_rx))
    }

    /// Answerer-side entry point: accepts the remote channel and answers the
    /// received offer immediately.
    pub async fn from_offer(
        engine: Arc<dyn TransportEngine>,
        remote_id: PeerId,
        offer: SessionDescription,
        signaling_tx: mpsc::UnboundedSender<ClientMessage>,
        options: DataConnectionOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DataConnectionEvent>), PeerError> {
        let (connection, events_rx, negotiator_rx) =
            Self::build(engine, remote_id, signaling_tx, options);
        connection.spawn_forward(negotiator_rx);
        let init = SessionInit::data(NegotiationRole::Answerer, connection.channel_init());
        connection
            .inner
            .shared
            .negotiator()
            .start(init, Some(offer))
            .await?;
        connection.inner.shared.drain_queue().await;
        Ok((connection, events_rx))
    }

    fn build(
        engine: Arc<dyn TransportEngine>,
        remote_id: PeerId,
        signaling_tx: mpsc::UnboundedSender<ClientMessage>,
        options: DataConnectionOptions,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<DataConnectionEvent>,
        mpsc::UnboundedReceiver<NegotiatorEvent>,
    ) {
        let (negotiator, negotiator_rx) = Negotiator::new(engine);
        let shared = ConnectionShared::new(
            remote_id,
            options.connection_id,
            ConnectionKind::Data,
            options.scope,
            negotiator,
            signaling_tx,
            options.pending,
        );
        let label = options
            .label
            .unwrap_or_else(|| shared.id().as_str().to_string());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(DataInner {
            shared,
            serialization: options.serialization,
            label,
            reassembler: Mutex::new(Reassembler::new(*chunk::runtime_config())),
            send_buffer: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
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

    pub fn serialization(&self) -> Serialization {
        self.inner.serialization
    }

    /// Queues one application message for delivery. Calling this on a
    /// connection that is not yet open surfaces an error event, not a panic
    /// or a silent drop, and nothing reaches the engine.
    pub async fn send(&self, payload: Payload) {
        if !self.is_open() {
            self.emit(DataConnectionEvent::Error(PeerError::NotOpen));
            return;
        }
        let config = chunk::runtime_config();
        let frames = match self.inner.serialization {
            Serialization::Raw => {
                let bytes = match payload {
                    Payload::Binary(bytes) => bytes,
                    Payload::Text(text) => Bytes::from(text),
                    Payload::Json(value) => match serde_json::to_vec(&value) {
                        Ok(bytes) => Bytes::from(bytes),
                        Err(err) => {
                            self.emit(DataConnectionEvent::Error(PeerError::Payload(
                                err.to_string(),
                            )));
                            return;
                        }
                    },
                };
                if bytes.len() > config.max_chunk_bytes {
                    self.emit(DataConnectionEvent::Error(PeerError::MessageTooLarge(
                        bytes.len(),
                    )));
                    return;
                }
                vec![bytes]
            }
            mode => {
                let encoded = match encode_payload(mode, payload) {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        self.emit(DataConnectionEvent::Error(err));
                        return;
                    }
                };
                let msg_id: u64 = rand::random();
                match chunk::split_message(&encoded, msg_id, config) {
                    Ok(frames) => frames.iter().map(chunk::encode_frame).collect(),
                    Err(chunk::ChunkError::MessageTooLarge(size)) => {
                        self.emit(DataConnectionEvent::Error(PeerError::MessageTooLarge(size)));
                        return;
                    }
                    Err(err) => {
                        self.emit(DataConnectionEvent::Error(PeerError::Payload(
                            err.to_string(),
                        )));
                        return;
                    }
                }
            }
        };
        self.inner.send_buffer.lock().extend(frames);
        self.ensure_flusher();
    }

    /// Frames currently parked waiting for the channel to accept them.
    pub fn buffered_frames(&self) -> usize {
        self.inner.send_buffer.lock().len()
    }

    pub async fn handle_answer(&self, answer: SessionDescription) {
        self.inner.shared.handle_answer(answer).await;
    }

    pub async fn handle_candidate(&self, candidate: crate::engine::IceCandidate) {
        self.inner.shared.handle_candidate(candidate).await;
    }

    /// A fresh remote offer, forwarded for renegotiation.
    pub async fn update_offer(&self, offer: SessionDescription) {
        self.inner.shared.negotiator().handle_offer(offer).await;
    }

    /// Idempotent close.
    pub async fn close(&self) {
        if !self.inner.shared.begin_close() {
            return;
        }
        self.inner.send_buffer.lock().clear();
        self.inner.shared.negotiator().cleanup().await;
        self.emit(DataConnectionEvent::Closed);
        if let Some(task) = self.inner.forward.lock().take() {
            task.abort();
        }
    }

    fn channel_init(&self) -> DataChannelInit {
        DataChannelInit {
            label: self.inner.label.clone(),
            ordered: true,
        }
    }

    fn emit(&self, event: DataConnectionEvent) {
        let _ = self.inner.events_tx.send(event);
    }

    /// Spawns the background flusher unless one is already running. Exactly
    /// one flusher touches the buffer at a time, preserving frame order.
    fn ensure_flusher(&self) {
        if self.inner.flushing.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                if this.inner.shared.is_closed() {
                    this.inner.send_buffer.lock().clear();
                    this.inner.flushing.store(false, Ordering::SeqCst);
                    break;
                }
                let frame = this.inner.send_buffer.lock().front().cloned();
                let Some(frame) = frame else {
                    this.inner.flushing.store(false, Ordering::SeqCst);
                    // A send may have raced the handoff; reclaim if so.
                    if !this.inner.send_buffer.lock().is_empty()
                        && !this.inner.flushing.swap(true, Ordering::SeqCst)
                    {
                        continue;
                    }
                    break;
                };
                match this.inner.shared.negotiator().try_send_data(frame).await {
                    Ok(true) => {
                        // Confirmed hand-off; only now does the frame leave
                        // the buffer.
                        this.inner.send_buffer.lock().pop_front();
                    }
                    Ok(false) => tokio::time::sleep(FLUSH_RETRY_INTERVAL).await,
                    Err(err) => {
                        this.emit(DataConnectionEvent::Error(err));
                        this.inner.send_buffer.lock().clear();
                        this.inner.flushing.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        });
    }

    fn handle_inbound(&self, bytes: Bytes) {
        if self.inner.serialization == Serialization::Raw {
            self.emit(DataConnectionEvent::Data(Payload::Binary(bytes)));
            return;
        }
        let frame = match chunk::decode_frame(&bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    target = "cove::connection",
                    connection_id = %self.id(),
                    error = %err,
                    "dropping malformed data frame"
                );
                return;
            }
        };
        let completed = match self.inner.reassembler.lock().ingest(frame) {
            Ok(completed) => completed,
            Err(err) => {
                warn!(
                    target = "cove::connection",
                    connection_id = %self.id(),
                    error = %err,
                    "dropping unreassemblable message"
                );
                return;
            }
        };
        if let Some(message) = completed {
            match decode_payload(self.inner.serialization, message) {
                Ok(payload) => self.emit(DataConnectionEvent::Data(payload)),
                Err(err) => self.emit(DataConnectionEvent::Error(err)),
            }
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
                    NegotiatorEvent::DataChannelOpen => {
                        this.emit(DataConnectionEvent::Open);
                        this.ensure_flusher();
                    }
                    NegotiatorEvent::DataReceived(bytes) => this.handle_inbound(bytes),
                    NegotiatorEvent::NegotiationNeeded => {
                        if matches!(
                            this.inner.shared.negotiator().role(),
                            Some(NegotiationRole::Originator)
                        ) {
                            this.inner.shared.negotiator().negotiate().await;
                        }
                    }
                    NegotiatorEvent::ConnectionFailed => this.close().await,
                    NegotiatorEvent::Error(err) => {
                        this.emit(DataConnectionEvent::Error(err));
                    }
                    NegotiatorEvent::StreamAdded(_) | NegotiatorEvent::StreamRemoved(_) => {}
                }
            }
        });
        *self.inner.forward.lock() = Some(task);
    }
}

fn encode_payload(mode: Serialization, payload: Payload) -> Result<Bytes, PeerError> {
    match mode {
        Serialization::Binary => {
            let (tag, body) = match payload {
                Payload::Binary(bytes) => (TAG_BINARY, bytes),
                Payload::Text(text) => (TAG_TEXT, Bytes::from(text)),
                Payload::Json(value) => (
                    TAG_JSON,
                    Bytes::from(
                        serde_json::to_vec(&value).map_err(|e| PeerError::Payload(e.to_string()))?,
                    ),
                ),
            };
            let mut buf = Vec::with_capacity(1 + body.len());
            buf.push(tag);
            buf.extend_from_slice(&body);
            Ok(Bytes::from(buf))
        }
        Serialization::Json => {
            let value = match payload {
                Payload::Json(value) => value,
                Payload::Text(text) => serde_json::Value::String(text),
                Payload::Binary(_) => {
                    return Err(PeerError::Payload(
                        "binary payload on a json-serialization connection".into(),
                    ));
                }
            };
            serde_json::to_vec(&value)
                .map(Bytes::from)
                .map_err(|e| PeerError::Payload(e.to_string()))
        }
        Serialization::Raw => unreachable!("raw mode bypasses payload encoding"),
    }
}

fn decode_payload(mode: Serialization, bytes: Bytes) -> Result<Payload, PeerError> {
    match mode {
        Serialization::Binary => {
            let Some((&tag, body)) = bytes.split_first() else {
                return Err(PeerError::Payload("empty framed message".into()));
            };
            match tag {
                TAG_BINARY => Ok(Payload::Binary(Bytes::copy_from_slice(body))),
                TAG_TEXT => String::from_utf8(body.to_vec())
                    .map(Payload::Text)
                    .map_err(|e| PeerError::Payload(e.to_string())),
                TAG_JSON => serde_json::from_slice(body)
                    .map(Payload::Json)
                    .map_err(|e| PeerError::Payload(e.to_string())),
                other => Err(PeerError::Payload(format!("unknown payload tag {other}"))),
            }
        }
        Serialization::Json => serde_json::from_slice(&bytes)
            .map(Payload::Json)
            .map_err(|e| PeerError::Payload(e.to_string())),
        Serialization::Raw => Ok(Payload::Binary(bytes)),
    }
}

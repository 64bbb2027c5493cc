//! Crate error taxonomy.
//!
//! Failures in this layer surface as events on the affected object rather than
//! unwinding the caller, so the error type is cheap to clone and carry inside
//! event enums. A failed negotiation degrades one connection, never the room
//! or the process.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    /// Offer/answer creation or description application failed inside the
    /// transport engine.
    #[error("webrtc negotiation failed: {0}")]
    Webrtc(String),

    /// Application-usage error: the operation needs an open connection.
    #[error("connection is not open")]
    NotOpen,

    /// A media connection may be answered at most once.
    #[error("connection already answered")]
    AlreadyAnswered,

    /// Publishing media requires a local stream to have been provided first.
    #[error("no local stream to publish")]
    NoLocalStream,

    /// Inbound data payload could not be decoded under the declared
    /// serialization mode.
    #[error("data payload malformed: {0}")]
    Payload(String),

    /// Outbound data exceeded the framing limits.
    #[error("data message too large: {0} bytes")]
    MessageTooLarge(usize),
}

impl PeerError {
    /// Taxonomy tag used in diagnostics; negotiation failures are tagged
    /// `webrtc` on the wire-facing side.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerError::Webrtc(_) => "webrtc",
            PeerError::NotOpen | PeerError::AlreadyAnswered | PeerError::NoLocalStream => {
                "usage"
            }
            PeerError::Payload(_) | PeerError::MessageTooLarge(_) => "data",
        }
    }
}

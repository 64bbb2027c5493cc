//! Peer-to-peer session orchestration over a pluggable transport engine.
//!
//! The crate layers a signaling-driven object model on top of an engine that
//! does the actual media transport (the [`engine::webrtc`] adapter in
//! production, [`engine::mock`] in tests):
//!
//! - [`negotiator::Negotiator`] runs the offer/answer/candidate protocol for
//!   one engine session.
//! - [`connection::media::MediaConnection`] and
//!   [`connection::data::DataConnection`] are point-to-point links; data
//!   connections frame, chunk and buffer application messages.
//! - [`room::mesh::MeshRoom`] fans out one connection per member;
//!   [`room::sfu::SfuRoom`] keeps a single relay link and demultiplexes
//!   remote streams back to their owners.
//! - [`signaling::SignalingRouter`] dispatches inbound signaling to the
//!   objects above; putting the messages on an actual wire is the host's
//!   concern.

pub mod connection;
pub mod engine;
pub mod error;
pub mod ids;
pub mod negotiator;
pub mod room;
pub mod signaling;

pub use connection::data::{
    DataConnection, DataConnectionEvent, DataConnectionOptions, Payload, Serialization,
};
pub use connection::media::{MediaConnection, MediaConnectionEvent, MediaConnectionOptions};
pub use connection::{ConnectionKind, SignalScope};
pub use engine::{
    IceCandidate, IceServer, MediaStream, RtcConfig, SessionDescription, TransportEngine,
};
pub use error::PeerError;
pub use ids::{ConnectionId, PeerId, RoomName, StreamId};
pub use negotiator::{Negotiator, NegotiatorEvent};
pub use room::mesh::MeshRoom;
pub use room::sfu::SfuRoom;
pub use room::{RoomEvent, RoomType};
pub use signaling::{ClientMessage, ServerMessage, SignalingRouter};

/// Installs a fmt subscriber for test runs, honoring `RUST_LOG`. Safe to call
/// from every test; only the first call wins.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

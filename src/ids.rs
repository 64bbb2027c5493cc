//! Identifier newtypes used to route signaling to in-memory objects.
//!
//! Everything on the wire is a string; the newtypes keep peer identities,
//! connection tokens, room names and stream identifiers from being mixed up
//! inside the crate.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identity of a participant within the signaling namespace.
    PeerId
);
string_id!(
    /// Correlation token for one connection; unique even when several
    /// connections exist to the same remote identity.
    ConnectionId
);
string_id!(
    /// Name of a multi-party session, unique within the signaling namespace.
    RoomName
);
string_id!(
    /// Identifier of one media stream as reported by the transport engine.
    StreamId
);

impl ConnectionId {
    /// Builds a `<prefix>_<8 hex chars>` identifier. The prefix encodes the
    /// connection kind (`mc` / `dc`) so ids stay readable in signaling logs.
    pub fn generate(prefix: &str) -> Self {
        let suffix: u32 = rand::random();
        Self(format!("{prefix}_{suffix:08x}"))
    }
}

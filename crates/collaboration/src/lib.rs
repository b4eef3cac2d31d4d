/// Real-time collaboration core for the strategy planner
/// Vector-clock operational transformation plus the sync session that wraps it
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod clock;
pub use clock::*;

mod time;
pub use time::*;

mod operations;
pub use operations::*;

mod detector;
pub use detector::*;

mod resolver;
pub use resolver::*;

mod engine;
pub use engine::*;

mod config;
pub use config::*;

mod protocol;
pub use protocol::*;

mod dedup;
pub use dedup::*;

mod store;
pub use store::*;

mod transport;
pub use transport::*;

mod roster;
pub use roster::*;

mod events;
pub use events::*;

mod outbox;
pub use outbox::*;

mod session;
pub use session::*;

pub use strategy::{EntityId, EntityPatch, EntityRecord, TargetKind};

#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error("network error: {0}")]
    NetworkError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("invalid operation: {0}")]
    InvalidOp(String),

    #[error("document store error: {0}")]
    Store(#[from] strategy::StrategyError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for CollaborationError {
    fn from(err: serde_json::Error) -> Self {
        CollaborationError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// Peer identifier in a collaboration room
///
/// Opaque and stable for one session. Derived from the room code plus a
/// random suffix so two tabs in the same room never share a clock entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn for_room(room_code: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", room_code, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

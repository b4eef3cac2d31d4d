use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod records;
pub use records::*;
mod patch;
pub use patch::*;
mod document;
pub use document::*;

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("invalid operation: {0}")]
    InvalidOp(String),
    #[error("{0} already exists: {1}")]
    EntityExists(TargetKind, EntityId),
    #[error("{0} not found: {1}")]
    EntityNotFound(TargetKind, EntityId),
    #[error("patch for {found} cannot be applied to {expected}")]
    PatchMismatch {
        expected: TargetKind,
        found: TargetKind,
    },
}

pub type Result<T> = std::result::Result<T, StrategyError>;

/// Identifier of a strategy, task, milestone or player.
///
/// Ids are opaque strings so that ids minted by the browser client
/// round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The kind of entity an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Strategy,
    Task,
    Milestone,
    Player,
}

impl TargetKind {
    pub const ALL: [TargetKind; 4] = [
        TargetKind::Strategy,
        TargetKind::Task,
        TargetKind::Milestone,
        TargetKind::Player,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Strategy => "strategy",
            TargetKind::Task => "task",
            TargetKind::Milestone => "milestone",
            TargetKind::Player => "player",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_kind_parse() {
        for kind in TargetKind::ALL {
            assert_eq!(TargetKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TargetKind::parse("unit"), None);
    }

    #[test]
    fn test_target_kind_serde_is_lowercase() {
        let json = serde_json::to_string(&TargetKind::Milestone).unwrap();
        assert_eq!(json, "\"milestone\"");
    }
}

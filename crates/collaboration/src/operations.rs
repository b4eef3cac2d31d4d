/// Planner operations
/// The versioned unit of change replicated between peers
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strategy::{EntityId, EntityPatch, EntityRecord, TargetKind};

use crate::{CollaborationError, PeerId, Result, VectorClock};

/// Unique operation identifier: `<peer>-<seq>-<random>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub String);

impl OperationId {
    pub fn generate(peer: &PeerId, seq: u64) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}-{}", peer, seq, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OperationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Move,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Move => "move",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(OperationKind::Create),
            "update" => Some(OperationKind::Update),
            "delete" => Some(OperationKind::Delete),
            "move" => Some(OperationKind::Move),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source and destination position of a reorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveIndices {
    pub from_index: usize,
    pub to_index: usize,
}

impl MoveIndices {
    pub fn new(from_index: usize, to_index: usize) -> Self {
        Self {
            from_index,
            to_index,
        }
    }
}

/// Kind-specific payload of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum OperationData {
    /// Full entity
    Create(EntityRecord),
    /// Partial-field patch
    Update(EntityPatch),
    Delete,
    Move(MoveIndices),
}

impl OperationData {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationData::Create(_) => OperationKind::Create,
            OperationData::Update(_) => OperationKind::Update,
            OperationData::Delete => OperationKind::Delete,
            OperationData::Move(_) => OperationKind::Move,
        }
    }

    /// Entity kind the payload is shaped for, if the payload carries one
    pub fn target_kind(&self) -> Option<TargetKind> {
        match self {
            OperationData::Create(record) => Some(record.target_kind()),
            OperationData::Update(patch) => Some(patch.target_kind()),
            OperationData::Delete | OperationData::Move(_) => None,
        }
    }

    pub fn as_patch(&self) -> Option<&EntityPatch> {
        match self {
            OperationData::Update(patch) => Some(patch),
            _ => None,
        }
    }

    pub fn as_move(&self) -> Option<MoveIndices> {
        match self {
            OperationData::Move(indices) => Some(*indices),
            _ => None,
        }
    }
}

/// Planner operation that can be replicated across peers
///
/// Immutable once created. Resolving a conflict derives a new operation
/// (new id, new wall clock) rather than editing this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Unique operation ID
    pub id: OperationId,

    pub target_kind: TargetKind,

    pub target_id: EntityId,

    pub data: OperationData,

    /// Clock snapshot at creation (causal timestamp)
    pub vector_clock: VectorClock,

    /// Creation time on the author's machine; tie-break only
    pub wall_clock: DateTime<Utc>,

    /// Peer who created this operation
    pub author: PeerId,

    /// Operations that must be applied before this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<OperationId>,

    /// Original remote operation this one was synthesised from by a merge or transform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<OperationId>,
}

impl Operation {
    /// Build an operation, checking that the payload fits the target kind
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: OperationId,
        target_kind: TargetKind,
        target_id: EntityId,
        data: OperationData,
        vector_clock: VectorClock,
        wall_clock: DateTime<Utc>,
        author: PeerId,
        dependencies: Vec<OperationId>,
    ) -> Result<Self> {
        if let Some(shaped_for) = data.target_kind() {
            if shaped_for != target_kind {
                return Err(CollaborationError::InvalidOp(format!(
                    "{} payload shaped for {} but targets {}",
                    data.kind(),
                    shaped_for,
                    target_kind
                )));
            }
        }
        if let OperationData::Create(record) = &data {
            if record.id() != &target_id {
                return Err(CollaborationError::InvalidOp(format!(
                    "create record id {} does not match target {}",
                    record.id(),
                    target_id
                )));
            }
        }

        Ok(Self {
            id,
            target_kind,
            target_id,
            data,
            vector_clock,
            wall_clock,
            author,
            dependencies,
            derived_from: None,
        })
    }

    pub fn kind(&self) -> OperationKind {
        self.data.kind()
    }

    /// Same target as another operation
    pub fn same_target(&self, other: &Operation) -> bool {
        self.target_kind == other.target_kind && self.target_id == other.target_id
    }

    /// Derive a replacement operation carrying `data`
    ///
    /// Keeps target, author, clock and dependencies; records where it came from.
    pub fn derive(&self, id: OperationId, data: OperationData, wall_clock: DateTime<Utc>) -> Self {
        Self {
            id,
            target_kind: self.target_kind,
            target_id: self.target_id.clone(),
            data,
            vector_clock: self.vector_clock.clone(),
            wall_clock,
            author: self.author.clone(),
            dependencies: self.dependencies.clone(),
            derived_from: Some(self.id.clone()),
        }
    }

    /// Ids under which this operation satisfies dependencies
    pub fn known_ids(&self) -> impl Iterator<Item = &OperationId> {
        std::iter::once(&self.id).chain(self.derived_from.iter())
    }
}

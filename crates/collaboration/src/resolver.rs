/// Conflict classification and resolution for concurrent planner operations
use serde::{Deserialize, Serialize};
use strategy::EntityPatch;
use tracing::debug;

use crate::{MoveIndices, Operation, OperationKind};

/// Types of conflicts that can occur between a remote and a local operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictType {
    /// Two peers edited the same entity at the same time
    ConcurrentEdit,

    /// The remote operation depends on something not yet applied here
    DependencyViolation,

    /// At least one side reordered the entity
    OrderingConflict,
}

/// Outcome of applying a remote operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    Accept,
    Merge,
    /// Not applied. For a dependency violation this means "not yet".
    Reject,
    Transform,
}

impl Resolution {
    /// Whether the resolved operation should reach the document store
    pub fn is_applicable(&self) -> bool {
        !matches!(self, Resolution::Reject)
    }
}

/// Result of running a remote operation through the engine
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolution {
    /// The remote operation as received
    pub operation: Operation,

    /// What to apply. Equal to `operation` for Accept and Reject.
    pub resolved_operation: Operation,

    /// `None` when no conflict was found
    pub conflict_type: Option<ConflictType>,

    pub resolution: Resolution,

    /// Field-merged patch, set for Merge only
    pub merged_data: Option<EntityPatch>,
}

impl ConflictResolution {
    /// Remote operation applied unchanged
    pub fn accepted(operation: Operation, conflict_type: Option<ConflictType>) -> Self {
        Self {
            resolved_operation: operation.clone(),
            operation,
            conflict_type,
            resolution: Resolution::Accept,
            merged_data: None,
        }
    }

    pub fn rejected(operation: Operation, conflict_type: Option<ConflictType>) -> Self {
        Self {
            resolved_operation: operation.clone(),
            operation,
            conflict_type,
            resolution: Resolution::Reject,
            merged_data: None,
        }
    }

    pub fn is_applicable(&self) -> bool {
        self.resolution.is_applicable()
    }
}

/// What the resolver wants done with the remote operation
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept,
    Reject,
    /// Replace the remote payload with this merged patch
    Merge(EntityPatch),
    /// Replace the remote move with these indices
    Transform(MoveIndices),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub conflict_type: ConflictType,
    pub verdict: Verdict,
}

/// Stateless resolver for a remote operation and the local one it races with
///
/// Never fails: anything it cannot reconcile falls back to Accept, and
/// destructive conflicts are settled by wall-clock recency.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Classify a conflict. `dependencies_met` reports whether every
    /// dependency of `remote` is already in history.
    pub fn classify(&self, remote: &Operation, local: &Operation, dependencies_met: bool) -> ConflictType {
        if !dependencies_met {
            ConflictType::DependencyViolation
        } else if remote.kind() == OperationKind::Move || local.kind() == OperationKind::Move {
            ConflictType::OrderingConflict
        } else {
            ConflictType::ConcurrentEdit
        }
    }

    pub fn decide(&self, remote: &Operation, local: &Operation, dependencies_met: bool) -> Decision {
        let conflict_type = self.classify(remote, local, dependencies_met);

        let verdict = match conflict_type {
            ConflictType::DependencyViolation => Verdict::Reject,
            ConflictType::OrderingConflict => match (local.data.as_move(), remote.data.as_move()) {
                (Some(local_move), Some(remote_move)) => {
                    Verdict::Transform(self.transform_move(local_move, remote_move))
                }
                // Reordering and editing touch independent state
                _ => Verdict::Accept,
            },
            ConflictType::ConcurrentEdit => match (local.data.as_patch(), remote.data.as_patch()) {
                (Some(local_patch), Some(remote_patch)) => {
                    match self.merge_updates(local, local_patch, remote, remote_patch) {
                        Some(merged) => Verdict::Merge(merged),
                        None => Verdict::Accept,
                    }
                }
                _ => self.last_writer(remote, local),
            },
        };

        debug!(
            remote = %remote.id,
            local = %local.id,
            ?conflict_type,
            ?verdict,
            "Resolved conflict"
        );

        Decision {
            conflict_type,
            verdict,
        }
    }

    /// Field-level merge of two concurrent updates
    ///
    /// Starts from the local patch. Fields only the remote touched are taken,
    /// shared fields go to the remote only when it is strictly newer.
    pub fn merge_updates(
        &self,
        local: &Operation,
        local_patch: &EntityPatch,
        remote: &Operation,
        remote_patch: &EntityPatch,
    ) -> Option<EntityPatch> {
        let remote_newer = remote.wall_clock > local.wall_clock;
        match local_patch.merge_concurrent(remote_patch, remote_newer) {
            Ok(merged) => Some(merged),
            Err(err) => {
                debug!(error = %err, "Patches cannot be merged, accepting remote");
                None
            }
        }
    }

    /// Shift the remote destination to account for an already-applied local move
    pub fn transform_move(&self, local: MoveIndices, remote: MoveIndices) -> MoveIndices {
        let mut to_index = remote.to_index;

        if local.from_index < local.to_index {
            if remote.from_index < local.from_index && remote.to_index >= local.from_index {
                to_index = to_index.saturating_sub(1);
            }
        } else if local.from_index > local.to_index
            && remote.from_index > local.from_index
            && remote.to_index <= local.from_index
        {
            to_index += 1;
        }

        MoveIndices::new(remote.from_index, to_index)
    }

    /// Later wall clock wins outright; the local side keeps ties
    pub fn last_writer(&self, remote: &Operation, local: &Operation) -> Verdict {
        if remote.wall_clock > local.wall_clock {
            Verdict::Accept
        } else {
            Verdict::Reject
        }
    }
}

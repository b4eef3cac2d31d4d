/// Document store boundary
///
/// The session is the only writer; the engine never touches the document.
use strategy::{EntityId, EntityPatch, EntityRecord, StrategyDocument, StrategyError, TargetKind};

use crate::{MoveIndices, Operation, OperationData};

/// Planner document the sync session applies operations to
pub trait DocumentStore: Send {
    fn create_entity(&mut self, record: EntityRecord) -> Result<EntityId, StrategyError>;

    fn update_entity(
        &mut self,
        kind: TargetKind,
        id: &EntityId,
        patch: &EntityPatch,
    ) -> Result<(), StrategyError>;

    fn delete_entity(&mut self, kind: TargetKind, id: &EntityId) -> Result<(), StrategyError>;

    /// Reorder an entity within its kind
    fn move_entity(
        &mut self,
        kind: TargetKind,
        id: &EntityId,
        indices: MoveIndices,
    ) -> Result<(), StrategyError>;

    /// Undo a delete, when the store still remembers the entity
    fn restore_entity(&mut self, kind: TargetKind, id: &EntityId) -> Result<(), StrategyError> {
        Err(StrategyError::EntityNotFound(kind, id.clone()))
    }
}

impl DocumentStore for StrategyDocument {
    fn create_entity(&mut self, record: EntityRecord) -> Result<EntityId, StrategyError> {
        self.insert(record)
    }

    fn update_entity(
        &mut self,
        kind: TargetKind,
        id: &EntityId,
        patch: &EntityPatch,
    ) -> Result<(), StrategyError> {
        self.update(kind, id, patch)
    }

    fn delete_entity(&mut self, kind: TargetKind, id: &EntityId) -> Result<(), StrategyError> {
        self.remove(kind, id).map(|_| ())
    }

    fn move_entity(
        &mut self,
        kind: TargetKind,
        id: &EntityId,
        indices: MoveIndices,
    ) -> Result<(), StrategyError> {
        self.move_to(kind, id, indices.to_index).map(|_| ())
    }

    fn restore_entity(&mut self, kind: TargetKind, id: &EntityId) -> Result<(), StrategyError> {
        self.restore(kind, id).map(|_| ())
    }
}

/// Apply one operation's effect to a store
pub fn apply_operation<S: DocumentStore + ?Sized>(
    store: &mut S,
    operation: &Operation,
) -> Result<(), StrategyError> {
    apply_data(store, operation.target_kind, &operation.target_id, &operation.data)
}

/// Apply an update that won over a concurrent delete already applied here
///
/// The deleted entity is restored first, then patched.
pub fn revive_and_apply<S: DocumentStore + ?Sized>(
    store: &mut S,
    operation: &Operation,
) -> Result<(), StrategyError> {
    match apply_operation(store, operation) {
        Err(StrategyError::EntityNotFound(kind, id)) if operation.data.as_patch().is_some() => {
            store.restore_entity(kind, &id)?;
            apply_operation(store, operation)
        }
        other => other,
    }
}

/// Apply an operation payload to one entity
pub fn apply_data<S: DocumentStore + ?Sized>(
    store: &mut S,
    kind: TargetKind,
    id: &EntityId,
    data: &OperationData,
) -> Result<(), StrategyError> {
    match data {
        OperationData::Create(record) => store.create_entity(record.clone()).map(|_| ()),
        OperationData::Update(patch) => store.update_entity(kind, id, patch),
        OperationData::Delete => store.delete_entity(kind, id),
        OperationData::Move(indices) => store.move_entity(kind, id, *indices),
    }
}

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::{
    EntityId, EntityPatch, EntityRecord, Milestone, Player, Strategy, StrategyError, TargetKind,
    Task,
};

/// Recently deleted entities kept for restoration
const DELETED_LIMIT: usize = 256;

/// A removed entity and where it sat in its display order
#[derive(Debug, Clone, PartialEq)]
struct Deleted {
    record: EntityRecord,
    index: usize,
}

/// In-memory planner document: every entity by id plus a display order per kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyDocument {
    pub strategies: HashMap<EntityId, Strategy>,
    pub tasks: HashMap<EntityId, Task>,
    pub milestones: HashMap<EntityId, Milestone>,
    pub players: HashMap<EntityId, Player>,
    #[serde(default)]
    order: BTreeMap<TargetKind, Vec<EntityId>>,
    #[serde(skip)]
    deleted: VecDeque<Deleted>,
}

impl StrategyDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, kind: TargetKind, id: &EntityId) -> bool {
        match kind {
            TargetKind::Strategy => self.strategies.contains_key(id),
            TargetKind::Task => self.tasks.contains_key(id),
            TargetKind::Milestone => self.milestones.contains_key(id),
            TargetKind::Player => self.players.contains_key(id),
        }
    }

    pub fn len(&self) -> usize {
        self.strategies.len() + self.tasks.len() + self.milestones.len() + self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn task(&self, id: &EntityId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Display order of entities of `kind` (e.g. Gantt rows for tasks).
    pub fn order(&self, kind: TargetKind) -> &[EntityId] {
        self.order.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Look up any entity as a record.
    pub fn record(&self, kind: TargetKind, id: &EntityId) -> Option<EntityRecord> {
        match kind {
            TargetKind::Strategy => self.strategies.get(id).cloned().map(EntityRecord::Strategy),
            TargetKind::Task => self.tasks.get(id).cloned().map(EntityRecord::Task),
            TargetKind::Milestone => self.milestones.get(id).cloned().map(EntityRecord::Milestone),
            TargetKind::Player => self.players.get(id).cloned().map(EntityRecord::Player),
        }
    }

    pub fn insert(&mut self, record: EntityRecord) -> Result<EntityId, StrategyError> {
        let kind = record.target_kind();
        let id = record.id().clone();
        if self.contains(kind, &id) {
            return Err(StrategyError::EntityExists(kind, id));
        }

        match record {
            EntityRecord::Strategy(s) => {
                self.strategies.insert(id.clone(), s);
            }
            EntityRecord::Task(t) => {
                self.tasks.insert(id.clone(), t);
            }
            EntityRecord::Milestone(m) => {
                self.milestones.insert(id.clone(), m);
            }
            EntityRecord::Player(p) => {
                self.players.insert(id.clone(), p);
            }
        }
        self.order.entry(kind).or_default().push(id.clone());

        Ok(id)
    }

    pub fn update(
        &mut self,
        kind: TargetKind,
        id: &EntityId,
        patch: &EntityPatch,
    ) -> Result<(), StrategyError> {
        if patch.target_kind() != kind {
            return Err(StrategyError::PatchMismatch {
                expected: kind,
                found: patch.target_kind(),
            });
        }

        let not_found = || StrategyError::EntityNotFound(kind, id.clone());
        match patch {
            EntityPatch::Strategy(p) => self.strategies.get_mut(id).ok_or_else(not_found)?.apply(p),
            EntityPatch::Task(p) => self.tasks.get_mut(id).ok_or_else(not_found)?.apply(p),
            EntityPatch::Milestone(p) => self.milestones.get_mut(id).ok_or_else(not_found)?.apply(p),
            EntityPatch::Player(p) => self.players.get_mut(id).ok_or_else(not_found)?.apply(p),
        }

        Ok(())
    }

    pub fn remove(&mut self, kind: TargetKind, id: &EntityId) -> Result<EntityRecord, StrategyError> {
        let removed = match kind {
            TargetKind::Strategy => self.strategies.remove(id).map(EntityRecord::Strategy),
            TargetKind::Task => self.tasks.remove(id).map(EntityRecord::Task),
            TargetKind::Milestone => self.milestones.remove(id).map(EntityRecord::Milestone),
            TargetKind::Player => self.players.remove(id).map(EntityRecord::Player),
        }
        .ok_or_else(|| StrategyError::EntityNotFound(kind, id.clone()))?;

        let mut index = 0;
        if let Some(order) = self.order.get_mut(&kind) {
            if let Some(position) = order.iter().position(|existing| existing == id) {
                order.remove(position);
                index = position;
            }
        }

        if self.deleted.len() == DELETED_LIMIT {
            self.deleted.pop_front();
        }
        self.deleted.push_back(Deleted {
            record: removed.clone(),
            index,
        });

        Ok(removed)
    }

    /// Bring back a recently removed entity at its old display position.
    pub fn restore(&mut self, kind: TargetKind, id: &EntityId) -> Result<EntityId, StrategyError> {
        if self.contains(kind, id) {
            return Err(StrategyError::EntityExists(kind, id.clone()));
        }
        let position = self
            .deleted
            .iter()
            .rposition(|d| d.record.target_kind() == kind && d.record.id() == id)
            .ok_or_else(|| StrategyError::EntityNotFound(kind, id.clone()))?;
        let Some(Deleted { record, index }) = self.deleted.remove(position) else {
            return Err(StrategyError::EntityNotFound(kind, id.clone()));
        };

        let id = self.insert(record)?;
        self.move_to(kind, &id, index)?;
        Ok(id)
    }

    /// Move an entity to `index` in its display order. Out-of-range indices clamp to the end.
    pub fn move_to(&mut self, kind: TargetKind, id: &EntityId, index: usize) -> Result<usize, StrategyError> {
        let order = self.order.entry(kind).or_default();
        let current = order
            .iter()
            .position(|existing| existing == id)
            .ok_or_else(|| StrategyError::EntityNotFound(kind, id.clone()))?;

        let entry = order.remove(current);
        let target = std::cmp::min(index, order.len());
        order.insert(target, entry);

        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskPatch;

    fn doc_with_tasks(names: &[&str]) -> (StrategyDocument, Vec<EntityId>) {
        let mut doc = StrategyDocument::new();
        let ids = names
            .iter()
            .map(|name| doc.insert(EntityRecord::Task(Task::new(*name))).unwrap())
            .collect();
        (doc, ids)
    }

    #[test]
    fn test_insert_and_duplicate() {
        let mut doc = StrategyDocument::new();
        let task = Task::new("Barracks");
        let id = doc.insert(EntityRecord::Task(task.clone())).unwrap();

        assert!(doc.contains(TargetKind::Task, &id));
        assert_eq!(doc.order(TargetKind::Task), &[id.clone()]);

        let err = doc.insert(EntityRecord::Task(task)).unwrap_err();
        assert!(matches!(err, StrategyError::EntityExists(TargetKind::Task, _)));
    }

    #[test]
    fn test_update_missing_entity() {
        let mut doc = StrategyDocument::new();
        let patch = EntityPatch::Task(TaskPatch::default());
        let err = doc
            .update(TargetKind::Task, &EntityId::from("nope"), &patch)
            .unwrap_err();
        assert!(matches!(err, StrategyError::EntityNotFound(..)));
    }

    #[test]
    fn test_update_kind_mismatch() {
        let (mut doc, ids) = doc_with_tasks(&["Barracks"]);
        let patch = EntityPatch::Task(TaskPatch::default());
        let err = doc.update(TargetKind::Player, &ids[0], &patch).unwrap_err();
        assert!(matches!(err, StrategyError::PatchMismatch { .. }));
    }

    #[test]
    fn test_remove_drops_from_order() {
        let (mut doc, ids) = doc_with_tasks(&["a", "b", "c"]);
        doc.remove(TargetKind::Task, &ids[1]).unwrap();

        assert_eq!(doc.order(TargetKind::Task), &[ids[0].clone(), ids[2].clone()]);
        assert!(doc.remove(TargetKind::Task, &ids[1]).is_err());
    }

    #[test]
    fn test_restore_returns_entity_to_its_row() {
        let (mut doc, ids) = doc_with_tasks(&["a", "b", "c"]);
        doc.update(
            TargetKind::Task,
            &ids[1],
            &EntityPatch::Task(TaskPatch {
                priority: Some(7),
                ..Default::default()
            }),
        )
        .unwrap();
        doc.remove(TargetKind::Task, &ids[1]).unwrap();

        doc.restore(TargetKind::Task, &ids[1]).unwrap();
        assert_eq!(doc.order(TargetKind::Task), &ids[..]);
        assert_eq!(doc.task(&ids[1]).map(|t| t.priority), Some(7));

        let err = doc.restore(TargetKind::Task, &ids[1]).unwrap_err();
        assert!(matches!(err, StrategyError::EntityExists(..)));
    }

    #[test]
    fn test_restore_unknown_entity() {
        let (mut doc, ids) = doc_with_tasks(&["a"]);
        let err = doc.restore(TargetKind::Task, &EntityId::from("never")).unwrap_err();
        assert!(matches!(err, StrategyError::EntityNotFound(..)));

        doc.remove(TargetKind::Task, &ids[0]).unwrap();
        assert!(doc.restore(TargetKind::Player, &ids[0]).is_err());
    }

    #[test]
    fn test_move_to_reorders_and_clamps() {
        let (mut doc, ids) = doc_with_tasks(&["a", "b", "c", "d"]);

        let from = doc.move_to(TargetKind::Task, &ids[0], 2).unwrap();
        assert_eq!(from, 0);
        assert_eq!(
            doc.order(TargetKind::Task),
            &[ids[1].clone(), ids[2].clone(), ids[0].clone(), ids[3].clone()]
        );

        doc.move_to(TargetKind::Task, &ids[1], 99).unwrap();
        assert_eq!(doc.order(TargetKind::Task).last(), Some(&ids[1]));
    }
}

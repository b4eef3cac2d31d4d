/// Conflict detection between an incoming remote operation and local history
use chrono::Duration;

use crate::Operation;

/// Finds the already-applied operation, if any, that an incoming remote
/// operation races with.
///
/// Two operations conflict when they target the same entity, come from
/// different authors, have concurrent vector clocks, and were created within
/// `window` of each other in wall-clock time. Operations further apart are
/// treated as sequential even when their clocks are concurrent.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    window: Duration,
}

impl ConflictDetector {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check whether `remote` conflicts with one specific local operation
    pub fn conflicts(&self, remote: &Operation, local: &Operation) -> bool {
        if remote.id == local.id || remote.author == local.author {
            return false;
        }
        if !remote.same_target(local) {
            return false;
        }
        if !remote.vector_clock.is_concurrent_with(&local.vector_clock) {
            return false;
        }

        let gap = remote.wall_clock - local.wall_clock;
        gap.abs() <= self.window
    }

    /// Search history, most recent first, for the operation `remote` conflicts with
    pub fn find_conflict<'a, I>(&self, remote: &Operation, history: I) -> Option<&'a Operation>
    where
        I: DoubleEndedIterator<Item = &'a Operation>,
    {
        history.rev().find(|local| self.conflicts(remote, local))
    }
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new(Duration::milliseconds(5_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OperationData, OperationId, PeerId, VectorClock};
    use chrono::{DateTime, Utc};
    use strategy::{EntityId, EntityPatch, TargetKind, TaskPatch};

    fn base_time() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(1_000)
    }

    fn update(id: &str, author: &str, target: &str, clock: &[(&str, u64)], offset_ms: i64) -> Operation {
        let vector_clock: VectorClock = clock
            .iter()
            .map(|(peer, count)| (PeerId::from(*peer), *count))
            .collect();
        Operation::new(
            OperationId::from(id),
            TargetKind::Task,
            EntityId::from(target),
            OperationData::Update(EntityPatch::Task(TaskPatch::default())),
            vector_clock,
            base_time() + Duration::milliseconds(offset_ms),
            PeerId::from(author),
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_concurrent_edits_conflict() {
        let detector = ConflictDetector::default();
        let local = update("l", "a", "t1", &[("a", 2)], 0);
        let remote = update("r", "b", "t1", &[("a", 1), ("b", 1)], 1_000);

        assert!(detector.conflicts(&remote, &local));
    }

    #[test]
    fn test_causally_ordered_edits_do_not_conflict() {
        let detector = ConflictDetector::default();
        let local = update("l", "a", "t1", &[("a", 1)], 0);
        let remote = update("r", "b", "t1", &[("a", 1), ("b", 1)], 100);

        assert!(!detector.conflicts(&remote, &local));
    }

    #[test]
    fn test_same_author_or_other_target_ignored() {
        let detector = ConflictDetector::default();
        let local = update("l", "a", "t1", &[("a", 2)], 0);

        let same_author = update("r1", "a", "t1", &[("b", 1)], 0);
        let other_target = update("r2", "b", "t2", &[("b", 1)], 0);

        assert!(!detector.conflicts(&same_author, &local));
        assert!(!detector.conflicts(&other_target, &local));
    }

    #[test]
    fn test_window_bounds_detection() {
        let detector = ConflictDetector::new(Duration::milliseconds(5_000));
        let local = update("l", "a", "t1", &[("a", 1)], 0);

        let inside = update("r1", "b", "t1", &[("b", 1)], 5_000);
        let outside = update("r2", "b", "t1", &[("b", 1)], 5_001);
        let before = update("r3", "b", "t1", &[("b", 1)], -5_001);

        assert!(detector.conflicts(&inside, &local));
        assert!(!detector.conflicts(&outside, &local));
        assert!(!detector.conflicts(&before, &local));
    }

    #[test]
    fn test_find_conflict_prefers_most_recent() {
        let detector = ConflictDetector::default();
        let history = vec![
            update("l1", "a", "t1", &[("a", 1)], 0),
            update("l2", "a", "t1", &[("a", 2)], 10),
        ];
        let remote = update("r", "b", "t1", &[("b", 1)], 20);

        let found = detector.find_conflict(&remote, history.iter()).unwrap();
        assert_eq!(found.id, OperationId::from("l2"));
    }
}

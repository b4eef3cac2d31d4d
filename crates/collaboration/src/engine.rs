/// Operational transformation engine
/// Owns the vector clock, the operation history and the pending set for one peer
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use strategy::{EntityId, TargetKind};
use tracing::{debug, warn};

use crate::{
    ConflictDetector, ConflictResolution, ConflictResolver, ConflictType, OperationData,
    Operation, OperationId, PeerId, Resolution, Result, SystemTimeSource, TimeSource, Verdict,
    VectorClock,
};

/// Engine tuning knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Wall-clock distance within which concurrent edits count as conflicting
    pub concurrency_window_ms: u64,

    /// Entries kept by the periodic history cleanup
    pub history_limit: usize,

    /// Parked operations older than this are dropped
    pub pending_ttl_ms: u64,

    /// Parking beyond this evicts the oldest parked operation
    pub max_pending: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_window_ms: 5_000,
            history_limit: 1_000,
            pending_ttl_ms: 300_000,
            max_pending: 500,
        }
    }
}

impl EngineConfig {
    pub fn concurrency_window(&self) -> Duration {
        Duration::milliseconds(self.concurrency_window_ms as i64)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::milliseconds(self.pending_ttl_ms as i64)
    }
}

/// Remote operation waiting for its dependencies
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub operation: Operation,
    pub parked_at: DateTime<Utc>,
    seq: u64,
}

/// Per-peer OT engine
///
/// All methods are synchronous state transitions. Callers must serialize
/// access; the sync session holds the engine behind a mutex.
#[derive(Debug)]
pub struct OtEngine {
    peer_id: PeerId,
    clock: VectorClock,
    history: VecDeque<Operation>,
    /// How many history entries answer to each id (own id or `derived_from`)
    index: HashMap<OperationId, usize>,
    pending: HashMap<OperationId, PendingOperation>,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    time: Arc<dyn TimeSource>,
    config: EngineConfig,
    next_seq: u64,
    park_seq: u64,
}

impl OtEngine {
    pub fn new(peer_id: PeerId, config: EngineConfig, time: Arc<dyn TimeSource>) -> Self {
        Self {
            peer_id,
            clock: VectorClock::new(),
            history: VecDeque::new(),
            index: HashMap::new(),
            pending: HashMap::new(),
            detector: ConflictDetector::new(config.concurrency_window()),
            resolver: ConflictResolver::new(),
            time,
            config,
            next_seq: 0,
            park_seq: 0,
        }
    }

    pub fn with_system_time(peer_id: PeerId, config: EngineConfig) -> Self {
        Self::new(peer_id, config, Arc::new(SystemTimeSource))
    }

    /// Stamp a local operation with the next clock value and record it
    ///
    /// Local operations are never checked for conflicts.
    pub fn create_operation(
        &mut self,
        target_kind: TargetKind,
        target_id: EntityId,
        data: OperationData,
        dependencies: Vec<OperationId>,
    ) -> Result<Operation> {
        let mut clock = self.clock.clone();
        let seq = clock.increment(&self.peer_id);

        let operation = Operation::new(
            OperationId::generate(&self.peer_id, seq),
            target_kind,
            target_id,
            data,
            clock.clone(),
            self.now(),
            self.peer_id.clone(),
            dependencies,
        )?;

        self.clock = clock;
        self.next_seq = self.next_seq.max(seq);
        self.push_history(operation.clone());

        debug!(id = %operation.id, kind = %operation.kind(), target = %operation.target_id, "Created operation");
        Ok(operation)
    }

    /// Integrate an operation received from another peer
    pub fn apply_remote_operation(&mut self, operation: Operation) -> ConflictResolution {
        if self.index.contains_key(&operation.id) || self.pending.contains_key(&operation.id) {
            debug!(id = %operation.id, "Operation already known");
            return ConflictResolution::rejected(operation, None);
        }

        self.clock.merge(&operation.vector_clock);

        if !self.dependencies_met(&operation) {
            debug!(id = %operation.id, deps = ?operation.dependencies, "Parking operation with missing dependencies");
            self.park(operation.clone());
            return ConflictResolution::rejected(operation, Some(ConflictType::DependencyViolation));
        }

        let decision = self
            .detector
            .find_conflict(&operation, self.history.iter())
            .map(|local| self.resolver.decide(&operation, local, true));

        let Some(decision) = decision else {
            self.push_history(operation.clone());
            return ConflictResolution::accepted(operation, None);
        };

        let conflict_type = Some(decision.conflict_type);
        match decision.verdict {
            Verdict::Accept => {
                self.push_history(operation.clone());
                ConflictResolution::accepted(operation, conflict_type)
            }
            Verdict::Reject => ConflictResolution::rejected(operation, conflict_type),
            Verdict::Merge(patch) => {
                let resolved = self.derive(&operation, OperationData::Update(patch.clone()));
                self.push_history(resolved.clone());
                ConflictResolution {
                    operation,
                    resolved_operation: resolved,
                    conflict_type,
                    resolution: Resolution::Merge,
                    merged_data: Some(patch),
                }
            }
            Verdict::Transform(indices) => {
                let resolved = self.derive(&operation, OperationData::Move(indices));
                self.push_history(resolved.clone());
                ConflictResolution {
                    operation,
                    resolved_operation: resolved,
                    conflict_type,
                    resolution: Resolution::Transform,
                    merged_data: None,
                }
            }
        }
    }

    /// Retry every parked operation whose dependencies are now in history
    ///
    /// Replays in parking order and repeats until no parked operation
    /// becomes ready, so chains of dependents drain in one call.
    pub fn process_pending_operations(&mut self) -> Vec<ConflictResolution> {
        let mut resolutions = Vec::new();

        loop {
            let mut ready: Vec<(u64, OperationId)> = self
                .pending
                .values()
                .filter(|pending| self.dependencies_met(&pending.operation))
                .map(|pending| (pending.seq, pending.operation.id.clone()))
                .collect();
            if ready.is_empty() {
                break;
            }
            ready.sort();

            for (_, id) in ready {
                if let Some(pending) = self.pending.remove(&id) {
                    debug!(id = %id, "Replaying parked operation");
                    resolutions.push(self.apply_remote_operation(pending.operation));
                }
            }
        }

        resolutions
    }

    /// Keep only the `keep` most recent history entries, returning how many were evicted
    pub fn cleanup_history(&mut self, keep: usize) -> usize {
        let excess = self.history.len().saturating_sub(keep);
        if excess == 0 {
            return 0;
        }

        self.history.drain(..excess);
        self.rebuild_index();
        debug!(evicted = excess, kept = self.history.len(), "Cleaned up operation history");
        excess
    }

    /// Drop parked operations older than the pending TTL
    pub fn expire_pending(&mut self) -> Vec<Operation> {
        let cutoff = self.time.now() - self.config.pending_ttl();
        let expired_ids: Vec<OperationId> = self
            .pending
            .values()
            .filter(|pending| pending.parked_at < cutoff)
            .map(|pending| pending.operation.id.clone())
            .collect();

        let mut expired: Vec<PendingOperation> = expired_ids
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect();
        expired.sort_by_key(|pending| pending.seq);

        for pending in &expired {
            warn!(id = %pending.operation.id, "Dropping parked operation whose dependencies never arrived");
        }
        expired.into_iter().map(|pending| pending.operation).collect()
    }

    /// Forget all clock, history and pending state
    pub fn reset(&mut self) {
        self.clock.clear();
        self.history.clear();
        self.index.clear();
        self.pending.clear();
        self.next_seq = 0;
        self.park_seq = 0;
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// History, oldest first
    pub fn history(&self) -> impl DoubleEndedIterator<Item = &Operation> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Whether an operation with this id (or derived from it) is in history
    pub fn has_applied(&self, id: &OperationId) -> bool {
        self.index.contains_key(id)
    }

    /// Parked operations in parking order
    pub fn pending(&self) -> Vec<&PendingOperation> {
        let mut pending: Vec<_> = self.pending.values().collect();
        pending.sort_by_key(|p| p.seq);
        pending
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &OperationId) -> bool {
        self.pending.contains_key(id)
    }

    fn dependencies_met(&self, operation: &Operation) -> bool {
        operation
            .dependencies
            .iter()
            .all(|dep| self.index.contains_key(dep))
    }

    fn derive(&mut self, operation: &Operation, data: OperationData) -> Operation {
        self.next_seq += 1;
        let id = OperationId::generate(&self.peer_id, self.next_seq);
        operation.derive(id, data, self.now())
    }

    /// Wall clock at the precision the wire carries
    fn now(&self) -> DateTime<Utc> {
        self.time.now().trunc_subsecs(3)
    }

    fn park(&mut self, operation: Operation) {
        if self.pending.len() >= self.config.max_pending {
            let oldest = self
                .pending
                .values()
                .min_by_key(|p| p.seq)
                .map(|p| p.operation.id.clone());
            if let Some(oldest) = oldest {
                warn!(id = %oldest, "Pending set full, evicting oldest parked operation");
                self.pending.remove(&oldest);
            }
        }

        self.park_seq += 1;
        self.pending.insert(
            operation.id.clone(),
            PendingOperation {
                operation,
                parked_at: self.time.now(),
                seq: self.park_seq,
            },
        );
    }

    fn push_history(&mut self, operation: Operation) {
        for id in operation.known_ids() {
            *self.index.entry(id.clone()).or_insert(0) += 1;
        }
        self.history.push_back(operation);
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for operation in &self.history {
            for id in operation.known_ids() {
                *self.index.entry(id.clone()).or_insert(0) += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManualTimeSource, MoveIndices, OperationKind};
    use strategy::{EntityPatch, EntityRecord, Task, TaskPatch};

    fn engine(peer: &str, time: &Arc<ManualTimeSource>) -> OtEngine {
        OtEngine::new(PeerId::from(peer), EngineConfig::default(), time.clone())
    }

    fn task_patch(patch: TaskPatch) -> OperationData {
        OperationData::Update(EntityPatch::Task(patch))
    }

    fn priority(value: i32) -> OperationData {
        task_patch(TaskPatch {
            priority: Some(value),
            ..Default::default()
        })
    }

    #[test]
    fn test_clock_monotonicity() {
        let time = Arc::new(ManualTimeSource::from_millis(0));
        let mut alice = engine("alice", &time);
        let target = EntityId::from("t1");

        let mut last = 0;
        for n in 0..5 {
            let op = alice
                .create_operation(TargetKind::Task, target.clone(), priority(n), Vec::new())
                .unwrap();
            let own = op.vector_clock.get(&PeerId::from("alice"));
            assert!(own > last);
            last = own;
        }
        assert_eq!(alice.history_len(), 5);
    }

    #[test]
    fn test_invalid_create_leaves_clock_untouched() {
        let time = Arc::new(ManualTimeSource::from_millis(0));
        let mut alice = engine("alice", &time);

        let task = Task::new("Barracks");
        let result = alice.create_operation(
            TargetKind::Player,
            task.id.clone(),
            OperationData::Create(EntityRecord::Task(task)),
            Vec::new(),
        );

        assert!(result.is_err());
        assert!(alice.clock().is_empty());
        assert_eq!(alice.history_len(), 0);
    }

    #[test]
    fn test_no_conflict_pass_through() {
        let time = Arc::new(ManualTimeSource::from_millis(0));
        let mut alice = engine("alice", &time);
        let mut bob = engine("bob", &time);

        let op = bob
            .create_operation(TargetKind::Task, EntityId::from("t1"), priority(2), Vec::new())
            .unwrap();
        let resolution = alice.apply_remote_operation(op.clone());

        assert_eq!(resolution.resolution, Resolution::Accept);
        assert_eq!(resolution.conflict_type, None);
        assert_eq!(resolution.resolved_operation, op);
        assert_eq!(alice.clock().get(&PeerId::from("bob")), 1);
        assert!(alice.has_applied(&op.id));
    }

    #[test]
    fn test_known_operation_rejected() {
        let time = Arc::new(ManualTimeSource::from_millis(0));
        let mut alice = engine("alice", &time);
        let mut bob = engine("bob", &time);

        let op = bob
            .create_operation(TargetKind::Task, EntityId::from("t1"), priority(2), Vec::new())
            .unwrap();
        alice.apply_remote_operation(op.clone());
        let again = alice.apply_remote_operation(op);

        assert_eq!(again.resolution, Resolution::Reject);
        assert_eq!(again.conflict_type, None);
        assert_eq!(alice.history_len(), 1);
    }

    #[test]
    fn test_concurrent_updates_merge() {
        let time = Arc::new(ManualTimeSource::from_millis(0));
        let mut alice = engine("alice", &time);
        let mut bob = engine("bob", &time);
        let target = EntityId::from("t1");

        alice
            .create_operation(
                TargetKind::Task,
                target.clone(),
                task_patch(TaskPatch {
                    name: Some("A".into()),
                    priority: Some(1),
                    ..Default::default()
                }),
                Vec::new(),
            )
            .unwrap();
        time.advance_millis(100);
        let remote = bob
            .create_operation(
                TargetKind::Task,
                target,
                task_patch(TaskPatch {
                    name: Some("B".into()),
                    ..Default::default()
                }),
                Vec::new(),
            )
            .unwrap();

        let resolution = alice.apply_remote_operation(remote.clone());

        assert_eq!(resolution.resolution, Resolution::Merge);
        assert_eq!(resolution.conflict_type, Some(ConflictType::ConcurrentEdit));
        let expected = EntityPatch::Task(TaskPatch {
            name: Some("B".into()),
            priority: Some(1),
            ..Default::default()
        });
        assert_eq!(resolution.merged_data.as_ref(), Some(&expected));

        let resolved = &resolution.resolved_operation;
        assert_ne!(resolved.id, remote.id);
        assert_eq!(resolved.derived_from.as_ref(), Some(&remote.id));
        assert_eq!(resolved.data, OperationData::Update(expected));
        assert!(alice.has_applied(&remote.id));
    }

    #[test]
    fn test_concurrent_moves_transform() {
        let time = Arc::new(ManualTimeSource::from_millis(0));
        let mut alice = engine("alice", &time);
        let mut bob = engine("bob", &time);
        let target = EntityId::from("t1");

        alice
            .create_operation(
                TargetKind::Task,
                target.clone(),
                OperationData::Move(MoveIndices::new(2, 5)),
                Vec::new(),
            )
            .unwrap();
        let remote = bob
            .create_operation(
                TargetKind::Task,
                target,
                OperationData::Move(MoveIndices::new(1, 3)),
                Vec::new(),
            )
            .unwrap();

        let resolution = alice.apply_remote_operation(remote);
        assert_eq!(resolution.resolution, Resolution::Transform);
        assert_eq!(resolution.resolved_operation.kind(), OperationKind::Move);
        assert_eq!(
            resolution.resolved_operation.data.as_move(),
            Some(MoveIndices::new(1, 2))
        );
    }

    #[test]
    fn test_outside_window_is_sequential() {
        let time = Arc::new(ManualTimeSource::from_millis(0));
        let mut alice = engine("alice", &time);
        let mut bob = engine("bob", &time);
        let target = EntityId::from("t1");

        alice
            .create_operation(TargetKind::Task, target.clone(), priority(1), Vec::new())
            .unwrap();
        time.advance_millis(6_000);
        let remote = bob
            .create_operation(TargetKind::Task, target, OperationData::Delete, Vec::new())
            .unwrap();

        let resolution = alice.apply_remote_operation(remote);
        assert_eq!(resolution.resolution, Resolution::Accept);
        assert_eq!(resolution.conflict_type, None);
    }

    #[test]
    fn test_dependency_parking_and_replay() {
        let time = Arc::new(ManualTimeSource::from_millis(0));
        let mut alice = engine("alice", &time);
        let mut bob = engine("bob", &time);
        let target = EntityId::from("t1");

        let u1 = bob
            .create_operation(TargetKind::Task, target.clone(), priority(1), Vec::new())
            .unwrap();
        let u2 = bob
            .create_operation(TargetKind::Task, target, priority(2), vec![u1.id.clone()])
            .unwrap();

        let parked = alice.apply_remote_operation(u2.clone());
        assert_eq!(parked.resolution, Resolution::Reject);
        assert_eq!(parked.conflict_type, Some(ConflictType::DependencyViolation));
        assert!(alice.is_pending(&u2.id));
        assert!(alice.process_pending_operations().is_empty());

        assert_eq!(alice.apply_remote_operation(u1).resolution, Resolution::Accept);

        let replayed = alice.process_pending_operations();
        assert_eq!(replayed.len(), 1);
        assert!(replayed[0].is_applicable());
        assert_eq!(replayed[0].operation.id, u2.id);
        assert_eq!(alice.pending_len(), 0);
    }

    #[test]
    fn test_dependency_chain_drains_in_one_sweep() {
        let time = Arc::new(ManualTimeSource::from_millis(0));
        let mut alice = engine("alice", &time);
        let mut bob = engine("bob", &time);
        let target = EntityId::from("t1");

        let u1 = bob
            .create_operation(TargetKind::Task, target.clone(), priority(1), Vec::new())
            .unwrap();
        let u2 = bob
            .create_operation(TargetKind::Task, target.clone(), priority(2), vec![u1.id.clone()])
            .unwrap();
        let u3 = bob
            .create_operation(TargetKind::Task, target, priority(3), vec![u2.id.clone()])
            .unwrap();

        alice.apply_remote_operation(u3);
        alice.apply_remote_operation(u2);
        alice.apply_remote_operation(u1);

        let replayed = alice.process_pending_operations();
        assert_eq!(replayed.len(), 2);
        assert_eq!(alice.pending_len(), 0);
        assert_eq!(alice.history_len(), 3);
    }

    #[test]
    fn test_history_bound_keeps_most_recent() {
        let time = Arc::new(ManualTimeSource::from_millis(0));
        let mut alice = engine("alice", &time);

        let ops: Vec<Operation> = (0..10)
            .map(|n| {
                alice
                    .create_operation(TargetKind::Task, EntityId::from("t1"), priority(n), Vec::new())
                    .unwrap()
            })
            .collect();

        assert_eq!(alice.cleanup_history(4), 6);
        assert_eq!(alice.history_len(), 4);
        let kept: Vec<_> = alice.history().map(|op| op.id.clone()).collect();
        let expected: Vec<_> = ops[6..].iter().map(|op| op.id.clone()).collect();
        assert_eq!(kept, expected);
        assert!(!alice.has_applied(&ops[0].id));
        assert_eq!(alice.cleanup_history(4), 0);
    }

    #[test]
    fn test_pending_expires_after_ttl() {
        let time = Arc::new(ManualTimeSource::from_millis(0));
        let config = EngineConfig {
            pending_ttl_ms: 1_000,
            ..Default::default()
        };
        let mut alice = OtEngine::new(PeerId::from("alice"), config, time.clone());
        let mut bob = engine("bob", &time);

        let orphan = bob
            .create_operation(
                TargetKind::Task,
                EntityId::from("t1"),
                priority(1),
                vec![OperationId::from("never-seen")],
            )
            .unwrap();
        alice.apply_remote_operation(orphan.clone());

        time.advance_millis(500);
        assert!(alice.expire_pending().is_empty());

        time.advance_millis(600);
        let expired = alice.expire_pending();
        assert_eq!(expired, vec![orphan]);
        assert_eq!(alice.pending_len(), 0);
    }

    #[test]
    fn test_pending_cap_evicts_oldest() {
        let time = Arc::new(ManualTimeSource::from_millis(0));
        let config = EngineConfig {
            max_pending: 2,
            ..Default::default()
        };
        let mut alice = OtEngine::new(PeerId::from("alice"), config, time.clone());
        let mut bob = engine("bob", &time);

        let parked: Vec<Operation> = (0..3)
            .map(|n| {
                let op = bob
                    .create_operation(
                        TargetKind::Task,
                        EntityId::from("t1"),
                        priority(n),
                        vec![OperationId::from("missing")],
                    )
                    .unwrap();
                alice.apply_remote_operation(op.clone());
                op
            })
            .collect();

        assert_eq!(alice.pending_len(), 2);
        assert!(!alice.is_pending(&parked[0].id));
        let order: Vec<_> = alice.pending().iter().map(|p| p.operation.id.clone()).collect();
        assert_eq!(order, vec![parked[1].id.clone(), parked[2].id.clone()]);
    }

    #[test]
    fn test_reset_clears_state() {
        let time = Arc::new(ManualTimeSource::from_millis(0));
        let mut alice = engine("alice", &time);
        alice
            .create_operation(TargetKind::Task, EntityId::from("t1"), priority(1), Vec::new())
            .unwrap();

        alice.reset();
        assert!(alice.clock().is_empty());
        assert_eq!(alice.history_len(), 0);
        assert_eq!(alice.pending_len(), 0);
    }
}

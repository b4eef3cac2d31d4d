/// Sync session: the coordinator between engine, document store and transport
///
/// One session per room. It owns the engine, applies resolved operations to
/// the document, broadcasts local operations and runs the periodic sweep
/// and cleanup. Nothing here is global; leaving a room resets the engine.
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strategy::{EntityId, EntityPatch, EntityRecord, TargetKind};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    apply_data, apply_operation, decode, encode, revive_and_apply, CollaborationError,
    ConflictResolution, ConflictType, ConnectionState, DocumentStore, MessageType, MoveIndices,
    Notification, NotificationLevel, NotificationLog, Operation, OperationData, OperationId,
    OtEngine, Outbox, PeerId, PeerRoster, PeerSet, RecentIds, Resolution, Result, SessionEvent,
    SyncConfig, SystemTimeSource, TimeSource, Transport, WireMessage,
};

const EVENT_CAPACITY: usize = 256;

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    /// Message id already seen
    Duplicate,
    /// Arrived while another message was being applied; queued behind it
    Deferred,
    /// Our own operation coming back
    Echo,
    /// Not an operation (presence or unknown type)
    Ignored,
    /// Dropped because it could not be decoded
    Malformed(String),
    Resolved(ConflictResolution),
}

/// Counts from one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub history_evicted: usize,
    pub pending_expired: usize,
    pub notifications_expired: usize,
    pub peers_pruned: usize,
}

pub struct SyncSession<S: DocumentStore, T: Transport> {
    peer_id: PeerId,
    config: SyncConfig,
    engine: Mutex<OtEngine>,
    store: Mutex<S>,
    transport: T,
    recent: Mutex<RecentIds>,
    roster: Mutex<PeerRoster>,
    notifications: Mutex<NotificationLog>,
    outbox: Mutex<Outbox>,
    events: broadcast::Sender<SessionEvent>,
    time: Arc<dyn TimeSource>,
    /// Held while a message or sweep is being applied
    applying: AtomicBool,
    deferred: Mutex<VecDeque<WireMessage>>,
    connected: AtomicBool,
}

impl<S: DocumentStore, T: Transport> SyncSession<S, T> {
    pub fn new(peer_id: PeerId, store: S, transport: T, config: SyncConfig) -> Self {
        Self::with_time_source(peer_id, store, transport, config, Arc::new(SystemTimeSource))
    }

    pub fn with_time_source(
        peer_id: PeerId,
        store: S,
        transport: T,
        config: SyncConfig,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let engine = OtEngine::new(peer_id.clone(), config.engine.clone(), time.clone());
        let connected = transport.is_connected();

        Self {
            engine: Mutex::new(engine),
            store: Mutex::new(store),
            transport,
            recent: Mutex::new(RecentIds::new(config.dedup_capacity)),
            roster: Mutex::new(PeerRoster::new()),
            notifications: Mutex::new(NotificationLog::new(config.max_notifications)),
            outbox: Mutex::new(Outbox::for_peer(peer_id.clone())),
            events,
            time,
            applying: AtomicBool::new(false),
            deferred: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(connected),
            peer_id,
            config,
        }
    }

    /// Announce this peer to the room
    pub fn join(&self) -> Result<()> {
        info!(peer = %self.peer_id, "Joining collaboration room");
        self.publish(SessionEvent::ConnectionChanged(self.connection_state()));
        let message = WireMessage::presence(MessageType::UserJoined, self.peer_id.clone(), self.time.now());
        self.send_or_queue(message);
        Ok(())
    }

    /// Say goodbye and drop all replication state
    pub fn leave(&self) {
        info!(peer = %self.peer_id, "Leaving collaboration room");
        let message = WireMessage::presence(MessageType::UserLeft, self.peer_id.clone(), self.time.now());
        if let Err(e) = self.transport.send(&PeerSet::All, &message) {
            debug!(error = %e, "Could not announce departure");
        }

        self.engine.lock().reset();
        self.recent.lock().clear();
        self.roster.lock().clear();
        self.deferred.lock().clear();
        self.connected.store(false, Ordering::SeqCst);
        self.publish(SessionEvent::ConnectionChanged(ConnectionState::Disconnected));
    }

    /// Subscribe to session events; drop the receiver to unsubscribe
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn create_entity(&self, record: EntityRecord) -> Result<Operation> {
        let kind = record.target_kind();
        let id = record.id().clone();
        self.submit_local(kind, id, OperationData::Create(record), Vec::new())
    }

    pub fn update_entity(&self, kind: TargetKind, id: EntityId, patch: EntityPatch) -> Result<Operation> {
        self.submit_local(kind, id, OperationData::Update(patch), Vec::new())
    }

    pub fn delete_entity(&self, kind: TargetKind, id: EntityId) -> Result<Operation> {
        self.submit_local(kind, id, OperationData::Delete, Vec::new())
    }

    pub fn move_entity(&self, kind: TargetKind, id: EntityId, indices: MoveIndices) -> Result<Operation> {
        self.submit_local(kind, id, OperationData::Move(indices), Vec::new())
    }

    /// Apply a local change to the document, then record and broadcast it
    pub fn submit_local(
        &self,
        target_kind: TargetKind,
        target_id: EntityId,
        data: OperationData,
        dependencies: Vec<OperationId>,
    ) -> Result<Operation> {
        if let OperationData::Create(record) = &data {
            if record.target_kind() != target_kind || record.id() != &target_id {
                return Err(CollaborationError::InvalidOp(format!(
                    "create record {} {} does not match target {} {}",
                    record.target_kind(),
                    record.id(),
                    target_kind,
                    target_id
                )));
            }
        }

        apply_data(&mut *self.store.lock(), target_kind, &target_id, &data)?;
        self.record_local(target_kind, target_id, data, dependencies)
    }

    /// Record and broadcast a change the caller already made to the document
    pub fn record_local(
        &self,
        target_kind: TargetKind,
        target_id: EntityId,
        data: OperationData,
        dependencies: Vec<OperationId>,
    ) -> Result<Operation> {
        let operation = self
            .engine
            .lock()
            .create_operation(target_kind, target_id, data, dependencies)?;

        let message = encode(&operation)?;
        self.send_or_queue(message);
        Ok(operation)
    }

    /// Handle one message from the transport
    ///
    /// Never re-enters: a message arriving while another is being applied
    /// (e.g. from a document store callback) is queued and processed by the
    /// call already in progress.
    pub fn handle_inbound(&self, message: WireMessage) -> InboundOutcome {
        if !self.try_acquire() {
            debug!(message_id = %message.message_id, "Deferring re-entrant inbound message");
            self.deferred.lock().push_back(message);
            return InboundOutcome::Deferred;
        }

        let outcome = self.process_message(message);
        self.release();
        outcome
    }

    /// Replay parked operations whose dependencies have arrived
    ///
    /// Also flushes the outbox once connected. Skipped while a message is
    /// being applied.
    pub fn sweep_pending(&self) -> Vec<ConflictResolution> {
        if !self.try_acquire() {
            debug!("Inbound message in progress, skipping sweep");
            return Vec::new();
        }

        self.refresh_connection();
        self.flush_outbox();

        let resolutions = self.engine.lock().process_pending_operations();
        for resolution in &resolutions {
            self.apply_resolution(resolution);
        }

        self.release();
        resolutions
    }

    /// Bound history, expire stale pending operations, notifications and peers
    pub fn cleanup(&self) -> CleanupReport {
        let now = self.time.now();

        let (history_evicted, expired) = {
            let mut engine = self.engine.lock();
            let evicted = engine.cleanup_history(self.config.engine.history_limit);
            (evicted, engine.expire_pending())
        };
        for operation in &expired {
            self.notify(
                NotificationLevel::Warning,
                format!("Dropped change {} from {}: its prerequisites never arrived", operation.id, operation.author),
            );
        }

        let notifications_expired = self.notifications.lock().expire(now, self.config.notification_ttl());

        let (pruned, peer_count) = {
            let mut roster = self.roster.lock();
            let pruned = roster.prune_idle(now, self.config.peer_idle());
            (pruned, roster.len())
        };
        if !pruned.is_empty() {
            self.publish(SessionEvent::PeerCountChanged(peer_count));
        }

        let report = CleanupReport {
            history_evicted,
            pending_expired: expired.len(),
            notifications_expired,
            peers_pruned: pruned.len(),
        };
        debug!(?report, "Session cleanup");
        report
    }

    /// Send queued messages in order; returns how many left the outbox
    pub fn flush_outbox(&self) -> usize {
        if !self.transport.is_connected() {
            return 0;
        }

        let queued = self.outbox.lock().drain();
        if queued.is_empty() {
            return 0;
        }

        let mut sent = 0;
        let mut remaining = queued.into_iter();
        for message in remaining.by_ref() {
            if let Err(e) = self.transport.send(&PeerSet::All, &message) {
                warn!(error = %e, "Outbox flush interrupted");
                let mut unsent = vec![message];
                unsent.extend(remaining);
                self.outbox.lock().requeue_front(unsent);
                return sent;
            }
            sent += 1;
        }

        info!(sent, "Flushed outbox");
        sent
    }

    /// Save unsent messages so a restart can resume them
    pub async fn persist_outbox(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = self.outbox.lock().clone();
        snapshot.persist(path).await
    }

    /// Load previously saved messages ahead of anything queued since
    pub async fn restore_outbox(&self, path: impl AsRef<Path>) -> Result<usize> {
        let mut restored = Outbox::restore(path).await?;
        let messages = restored.drain();
        let count = messages.len();
        self.outbox.lock().requeue_front(messages);
        Ok(count)
    }

    /// Drive the session until the inbound channel closes
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<WireMessage>)
    where
        S: 'static,
        T: 'static,
    {
        info!(peer = %self.peer_id, "Starting sync session loop");

        let mut sweep = interval(self.config.sweep_interval());
        let mut cleanup = interval(self.config.cleanup_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // First tick fires immediately
        sweep.tick().await;
        cleanup.tick().await;

        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => {
                        self.handle_inbound(message);
                    }
                    None => {
                        info!(peer = %self.peer_id, "Inbound channel closed, stopping sync session loop");
                        break;
                    }
                },

                _ = sweep.tick() => {
                    self.sweep_pending();
                }

                _ = cleanup.tick() => {
                    self.cleanup();
                }
            }
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Read the document
    pub fn with_store<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.store.lock())
    }

    /// Inspect the engine
    pub fn with_engine<R>(&self, f: impl FnOnce(&OtEngine) -> R) -> R {
        f(&self.engine.lock())
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().list()
    }

    pub fn peer_count(&self) -> usize {
        self.roster.lock().len()
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.lock().len()
    }

    pub fn pending_len(&self) -> usize {
        self.engine.lock().pending_len()
    }

    pub fn connection_state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn try_acquire(&self) -> bool {
        self.applying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drain deferred messages, then drop the guard
    fn release(&self) {
        loop {
            loop {
                let next = self.deferred.lock().pop_front();
                match next {
                    Some(message) => {
                        self.process_message(message);
                    }
                    None => break,
                }
            }

            self.applying.store(false, Ordering::Release);

            // A message may have been deferred between the last pop and the store
            if self.deferred.lock().is_empty() || !self.try_acquire() {
                break;
            }
        }
    }

    fn process_message(&self, message: WireMessage) -> InboundOutcome {
        if !self.recent.lock().insert(&message.message_id) {
            debug!(message_id = %message.message_id, "Dropping duplicate message");
            return InboundOutcome::Duplicate;
        }
        if message.author == self.peer_id {
            return InboundOutcome::Echo;
        }

        self.track_peer(&message);

        if !message.message_type.is_operation() {
            self.publish(SessionEvent::MessageReceived {
                message_type: message.message_type.clone(),
                author: message.author.clone(),
                payload: message.payload.clone(),
            });
            return InboundOutcome::Ignored;
        }

        let operation = match decode(&message) {
            Ok(operation) => operation,
            Err(e) => {
                warn!(message_id = %message.message_id, author = %message.author, error = %e, "Dropping malformed message");
                return InboundOutcome::Malformed(e.to_string());
            }
        };

        let resolution = self.engine.lock().apply_remote_operation(operation);
        self.apply_resolution(&resolution);
        InboundOutcome::Resolved(resolution)
    }

    fn apply_resolution(&self, resolution: &ConflictResolution) {
        match (resolution.resolution, resolution.conflict_type) {
            (Resolution::Merge, _) => self.notify(
                NotificationLevel::Info,
                format!("Merged concurrent edits to {} {}", resolution.operation.target_kind, resolution.operation.target_id),
            ),
            (Resolution::Transform, _) => self.notify(
                NotificationLevel::Info,
                format!("Adjusted concurrent reorder of {} {}", resolution.operation.target_kind, resolution.operation.target_id),
            ),
            (Resolution::Reject, Some(ConflictType::DependencyViolation)) => {
                debug!(id = %resolution.operation.id, "Waiting for dependencies")
            }
            (Resolution::Reject, Some(_)) => self.notify(
                NotificationLevel::Warning,
                format!("Kept local version of {} {}; a concurrent older change from {} was discarded", resolution.operation.target_kind, resolution.operation.target_id, resolution.operation.author),
            ),
            _ => {}
        }

        if !resolution.is_applicable() {
            return;
        }

        let operation = &resolution.resolved_operation;
        // A winning update may target an entity deleted here
        let won_concurrent_edit = resolution.resolution == Resolution::Accept
            && resolution.conflict_type == Some(ConflictType::ConcurrentEdit);
        let applied = if won_concurrent_edit {
            revive_and_apply(&mut *self.store.lock(), operation)
        } else {
            apply_operation(&mut *self.store.lock(), operation)
        };
        if let Err(e) = applied {
            warn!(id = %operation.id, error = %e, "Resolved operation did not apply to the document");
            return;
        }

        debug!(id = %operation.id, resolution = ?resolution.resolution, "Applied remote operation");
        self.publish(SessionEvent::OperationApplied {
            operation: operation.clone(),
            resolution: resolution.resolution,
        });
    }

    fn track_peer(&self, message: &WireMessage) {
        let now = self.time.now();
        let (changed, peer_count) = {
            let mut roster = self.roster.lock();
            let changed = match message.message_type {
                MessageType::UserLeft => roster.remove(&message.author).is_some(),
                _ => roster.touch(&message.author, now),
            };
            (changed, roster.len())
        };

        if !changed {
            return;
        }
        self.publish(SessionEvent::PeerCountChanged(peer_count));
        match message.message_type {
            MessageType::UserLeft => self.notify(NotificationLevel::Info, format!("{} left the room", message.author)),
            _ => self.notify(NotificationLevel::Info, format!("{} joined the room", message.author)),
        }
    }

    fn send_or_queue(&self, message: WireMessage) {
        self.refresh_connection();
        if !self.transport.is_connected() {
            debug!(message_id = %message.message_id, "Offline, queueing message");
            self.outbox.lock().enqueue(message);
            return;
        }

        if let Err(e) = self.transport.send(&PeerSet::All, &message) {
            warn!(error = %e, "Send failed, queueing message");
            self.outbox.lock().enqueue(message);
        }
    }

    fn refresh_connection(&self) {
        let now_connected = self.transport.is_connected();
        if self.connected.swap(now_connected, Ordering::SeqCst) != now_connected {
            let state = if now_connected {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            };
            info!(peer = %self.peer_id, ?state, "Connection state changed");
            self.publish(SessionEvent::ConnectionChanged(state));
        }
    }

    fn notify(&self, level: NotificationLevel, message: String) {
        let notification = Notification::new(level, message, self.time.now());
        self.notifications.lock().push(notification.clone());
        self.publish(SessionEvent::Notification(notification));
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

//! Optimistic operation tracking: temporary identifiers, correlation
//! tokens, and the pending-operation table that reconciliation
//! resolves against.
//!
//! Invariant: at most one in-flight mutation per temporary identifier.
//! A second mutation against the same temp id is parked in a deferred
//! queue and dispatched (re-addressed to the server id) once the
//! create confirmation arrives.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;
use uuid::Uuid;

use shelfsync_core::{EntityKind, OpKind};

use crate::protocol::Payload;

/// Source of client-fabricated identifiers. Injected so tests can use
/// a deterministic sequence.
pub trait IdSource: Send + Sync {
    /// A temporary entity id: unique within the session, collision-safe
    /// across same-millisecond calls.
    fn next_temp_id(&self) -> i64;
    /// A correlation token the server echoes back best-effort.
    fn next_event_id(&self) -> Uuid;
}

/// Production id source: millisecond timestamp × 1000 plus a random
/// suffix, with a monotonic guard for same-millisecond calls.
pub struct SystemIds {
    last: Mutex<i64>,
}

impl SystemIds {
    pub fn new() -> Self {
        Self { last: Mutex::new(0) }
    }
}

impl Default for SystemIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for SystemIds {
    fn next_temp_id(&self) -> i64 {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let suffix = (Uuid::new_v4().as_u128() % 1000) as i64;
        let candidate = millis * 1000 + suffix;

        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let id = if candidate <= *last { *last + 1 } else { candidate };
        *last = id;
        id
    }

    fn next_event_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Deterministic id source for tests: temp ids count up from a base,
/// event ids are derived from the same counter.
pub struct SeqIds {
    counter: Mutex<i64>,
}

impl SeqIds {
    pub fn new(base: i64) -> Self {
        Self {
            counter: Mutex::new(base),
        }
    }
}

impl IdSource for SeqIds {
    fn next_temp_id(&self) -> i64 {
        let mut c = self.counter.lock().unwrap_or_else(|e| e.into_inner());
        *c += 1;
        *c
    }

    fn next_event_id(&self) -> Uuid {
        let c = *self.counter.lock().unwrap_or_else(|e| e.into_inner());
        Uuid::from_u128(c as u128 + 1)
    }
}

/// A locally-initiated, not-yet-confirmed mutation.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub temp_id: i64,
    pub event_id: Uuid,
    pub kind: EntityKind,
    pub op: OpKind,
    pub body: Payload,
    pub created_at: Instant,
}

/// A mutation parked behind an unresolved create on the same entity.
#[derive(Debug, Clone)]
pub struct DeferredCommand {
    pub op: OpKind,
    pub body: Payload,
}

/// Pending operations keyed by correlation token, with a temp-id index
/// and per-entity deferred queues.
#[derive(Debug, Default)]
pub struct PendingSet {
    by_event: HashMap<Uuid, PendingOperation>,
    temp_index: HashMap<(EntityKind, i64), Uuid>,
    deferred: HashMap<(EntityKind, i64), VecDeque<DeferredCommand>>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, op: PendingOperation) {
        self.temp_index.insert((op.kind, op.temp_id), op.event_id);
        self.by_event.insert(op.event_id, op);
    }

    pub fn contains_temp(&self, kind: EntityKind, temp_id: i64) -> bool {
        self.temp_index.contains_key(&(kind, temp_id))
    }

    pub fn get_by_event(&self, event_id: &Uuid) -> Option<&PendingOperation> {
        self.by_event.get(event_id)
    }

    /// Resolve by echoed correlation token. The entity's deferred
    /// queue is drained and returned with the operation, so no caller
    /// can leave it behind.
    pub fn remove_by_event(
        &mut self,
        event_id: &Uuid,
    ) -> Option<(PendingOperation, Vec<DeferredCommand>)> {
        let op = self.by_event.remove(event_id)?;
        self.temp_index.remove(&(op.kind, op.temp_id));
        let deferred = self.take_deferred(op.kind, op.temp_id);
        Some((op, deferred))
    }

    /// Resolve by echoed (or structurally matched) temporary id, with
    /// the same deferred-queue handover as [`Self::remove_by_event`].
    pub fn remove_by_temp(
        &mut self,
        kind: EntityKind,
        temp_id: i64,
    ) -> Option<(PendingOperation, Vec<DeferredCommand>)> {
        let event_id = self.temp_index.remove(&(kind, temp_id))?;
        let op = self.by_event.remove(&event_id)?;
        let deferred = self.take_deferred(kind, temp_id);
        Some((op, deferred))
    }

    /// Park a mutation behind the unresolved create for `temp_id`.
    pub fn defer(&mut self, kind: EntityKind, temp_id: i64, command: DeferredCommand) {
        self.deferred
            .entry((kind, temp_id))
            .or_default()
            .push_back(command);
    }

    /// Take the deferred queue for an entity, in arrival order.
    pub fn take_deferred(&mut self, kind: EntityKind, temp_id: i64) -> Vec<DeferredCommand> {
        self.deferred
            .remove(&(kind, temp_id))
            .map(|q| q.into_iter().collect())
            .unwrap_or_default()
    }

    /// Remove and return every pending operation older than `timeout`.
    /// Their deferred queues are dropped with them.
    pub fn expire(&mut self, timeout: Duration) -> Vec<PendingOperation> {
        let expired: Vec<Uuid> = self
            .by_event
            .values()
            .filter(|op| op.created_at.elapsed() > timeout)
            .map(|op| op.event_id)
            .collect();
        expired
            .iter()
            .filter_map(|id| {
                let (op, _deferred) = self.remove_by_event(id)?;
                Some(op)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_event.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_event.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_event.clear();
        self.temp_index.clear();
        self.deferred.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MemoBody;

    fn pending(kind: EntityKind, temp_id: i64, event_id: Uuid) -> PendingOperation {
        PendingOperation {
            temp_id,
            event_id,
            kind,
            op: OpKind::Create,
            body: Payload::Memo(MemoBody::default()),
            created_at: Instant::now(),
        }
    }

    #[test]
    fn test_system_ids_monotonic_same_millisecond() {
        let ids = SystemIds::new();
        let mut previous = 0;
        for _ in 0..1000 {
            let id = ids.next_temp_id();
            assert!(id > previous, "temp ids must never repeat or regress");
            previous = id;
        }
    }

    #[test]
    fn test_system_ids_timestamp_seeded() {
        let ids = SystemIds::new();
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        let id = ids.next_temp_id();
        assert!(id >= before * 1000);
    }

    #[test]
    fn test_seq_ids_deterministic() {
        let ids = SeqIds::new(1000);
        assert_eq!(ids.next_temp_id(), 1001);
        assert_eq!(ids.next_temp_id(), 1002);
    }

    #[test]
    fn test_pending_set_event_resolution() {
        let mut set = PendingSet::new();
        let event = Uuid::new_v4();
        set.insert(pending(EntityKind::Memo, 1001, event));

        assert!(set.contains_temp(EntityKind::Memo, 1001));
        let (op, _) = set.remove_by_event(&event).unwrap();
        assert_eq!(op.temp_id, 1001);
        assert!(!set.contains_temp(EntityKind::Memo, 1001));
        assert!(set.is_empty());
    }

    #[test]
    fn test_pending_set_temp_resolution() {
        let mut set = PendingSet::new();
        let event = Uuid::new_v4();
        set.insert(pending(EntityKind::Memo, 1001, event));

        let (op, _) = set.remove_by_temp(EntityKind::Memo, 1001).unwrap();
        assert_eq!(op.event_id, event);
        assert!(set.remove_by_event(&event).is_none());
    }

    #[test]
    fn test_temp_ids_scoped_by_kind() {
        let mut set = PendingSet::new();
        set.insert(pending(EntityKind::Memo, 1001, Uuid::new_v4()));

        assert!(set.contains_temp(EntityKind::Memo, 1001));
        assert!(!set.contains_temp(EntityKind::ShelfBook, 1001));
    }

    #[test]
    fn test_deferred_queue_is_fifo() {
        let mut set = PendingSet::new();
        set.defer(
            EntityKind::Memo,
            1001,
            DeferredCommand {
                op: OpKind::Update,
                body: Payload::Memo(MemoBody {
                    content: Some("first".to_string()),
                    ..MemoBody::default()
                }),
            },
        );
        set.defer(
            EntityKind::Memo,
            1001,
            DeferredCommand {
                op: OpKind::Delete,
                body: Payload::Memo(MemoBody::default()),
            },
        );

        let drained = set.take_deferred(EntityKind::Memo, 1001);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].op, OpKind::Update);
        assert_eq!(drained[1].op, OpKind::Delete);
        assert!(set.take_deferred(EntityKind::Memo, 1001).is_empty());
    }

    #[test]
    fn test_remove_drains_deferred_queue() {
        let mut set = PendingSet::new();
        set.insert(pending(EntityKind::Memo, 1001, Uuid::new_v4()));
        set.defer(
            EntityKind::Memo,
            1001,
            DeferredCommand {
                op: OpKind::Update,
                body: Payload::Memo(MemoBody::default()),
            },
        );

        let (_, deferred) = set.remove_by_temp(EntityKind::Memo, 1001).unwrap();
        assert_eq!(deferred.len(), 1);
        // Nothing lingers for the removed entity.
        assert!(set.take_deferred(EntityKind::Memo, 1001).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_removes_only_stale_operations() {
        let mut set = PendingSet::new();
        set.insert(pending(EntityKind::Memo, 1001, Uuid::new_v4()));

        tokio::time::advance(Duration::from_secs(20)).await;
        set.insert(pending(EntityKind::Memo, 1002, Uuid::new_v4()));

        tokio::time::advance(Duration::from_secs(15)).await;
        let expired = set.expire(Duration::from_secs(30));

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].temp_id, 1001);
        assert!(set.contains_temp(EntityKind::Memo, 1002));
    }
}

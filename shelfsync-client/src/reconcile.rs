//! Reconciliation: merges confirmed and broadcast remote events into
//! the local cache, resolving optimistic operations.
//!
//! Create confirmations are matched against pending operations in
//! order: echoed correlation token, echoed client temp id, structural
//! signature. A miss is never dropped — it is some other client's
//! entity and is inserted as new.
//!
//! These are pure functions over the cache and pending set; the engine
//! task holds the locks and applies the returned events, which keeps
//! this logic reentrancy-free and directly unit-testable.

use shelfsync_core::{EntityId, EntityKind, LocalCache, LocalEntity, OpKind};

use crate::event::SyncEvent;
use crate::optimistic::PendingSet;
use crate::protocol::{InboundMessage, Payload};

/// Result of applying one inbound message.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Events to surface to the consumer, in order.
    pub events: Vec<SyncEvent>,
    /// Deferred commands released by a resolved create, re-addressed
    /// to the server-assigned id and ready to dispatch.
    pub followups: Vec<(OpKind, Payload)>,
}

/// Apply one decoded broadcast to the cache and pending set.
///
/// `editing` is the entity currently open in an editor, if any;
/// confirmations targeting it merge in place and emit
/// [`SyncEvent::EditingMerged`] instead of a full-refresh event.
pub fn apply(
    cache: &mut LocalCache,
    pending: &mut PendingSet,
    editing: Option<(EntityKind, EntityId)>,
    message: &InboundMessage,
) -> ApplyOutcome {
    match message.op() {
        OpKind::Create => apply_create(cache, pending, message),
        OpKind::Update => apply_update(cache, editing, message),
        OpKind::Delete => apply_delete(cache, pending, message),
        OpKind::Read => apply_read(cache, editing, message),
    }
}

fn apply_create(
    cache: &mut LocalCache,
    pending: &mut PendingSet,
    message: &InboundMessage,
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();
    let kind = message.kind();
    let payload = &message.payload;

    let Some(server_id) = payload.server_id() else {
        log::warn!("reconcile: create confirmation without a server id, ignoring");
        return outcome;
    };

    // (a) echoed correlation token
    let mut matched = payload
        .event_id()
        .and_then(|event_id| pending.remove_by_event(&event_id));

    // (b) echoed client temp id
    if matched.is_none() {
        matched = payload
            .client_temp_id()
            .and_then(|temp| pending.remove_by_temp(kind, temp));
    }

    // (c) structural signature against any temporary entity
    if matched.is_none() {
        if let Some(signature) = payload.signature() {
            if let Some(temp) = cache
                .find_temp_by_signature(kind, &signature)
                .map(|e| e.id().raw())
            {
                matched = pending.remove_by_temp(kind, temp);
            }
        }
    }

    match matched {
        Some((op, deferred)) => {
            let temp_id = op.temp_id;
            let resolved_id = EntityId::Server(server_id);

            // Start from the optimistic record so locally-edited fields
            // the confirmation does not carry survive the rewrite.
            let mut entity = cache
                .get(kind, EntityId::Temp(temp_id))
                .cloned()
                .unwrap_or_else(|| entity_from_payload(payload, resolved_id));
            entity.set_id(resolved_id);
            merge_payload(payload, &mut entity);

            if cache.resolve_temp(kind, temp_id, entity).is_none() {
                // Temp record already gone (deleted locally); keep the
                // server's view so the shelves converge.
                cache.upsert(entity_from_payload(payload, resolved_id));
            }
            log::info!("reconcile: {kind} temp {temp_id} -> server {server_id}");
            outcome.events.push(SyncEvent::Reconciled {
                kind,
                temp_id,
                id: resolved_id,
            });

            for command in deferred {
                outcome
                    .followups
                    .push((command.op, readdress(command.body, server_id)));
            }
        }
        None => {
            // Another client's create, or a confirmation we lost track
            // of. Insert, never drop.
            let entity = entity_from_payload(payload, EntityId::Server(server_id));
            cache.upsert(entity.clone());
            outcome.events.push(SyncEvent::RemoteCreated(entity));
        }
    }
    outcome
}

fn apply_update(
    cache: &mut LocalCache,
    editing: Option<(EntityKind, EntityId)>,
    message: &InboundMessage,
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();
    let kind = message.kind();
    let payload = &message.payload;

    let Some(id) = target_id(payload) else {
        log::warn!("reconcile: update confirmation without an id, ignoring");
        return outcome;
    };

    match cache.get_mut(kind, id) {
        Some(entity) => {
            merge_payload(payload, entity);
            let entity = entity.clone();
            if editing == Some((kind, id)) {
                outcome.events.push(SyncEvent::EditingMerged { kind, id });
            } else {
                outcome.events.push(SyncEvent::RemoteUpdated(entity));
            }
        }
        None => {
            // Update for an entity we never saw — insert it.
            let entity = entity_from_payload(payload, id);
            cache.upsert(entity.clone());
            outcome.events.push(SyncEvent::RemoteUpdated(entity));
        }
    }
    outcome
}

fn apply_delete(
    cache: &mut LocalCache,
    pending: &mut PendingSet,
    message: &InboundMessage,
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();
    let kind = message.kind();

    let Some(id) = target_id(&message.payload) else {
        log::warn!("reconcile: delete confirmation without an id, ignoring");
        return outcome;
    };

    if let EntityId::Temp(temp) = id {
        let _ = pending.remove_by_temp(kind, temp);
    }
    if cache.remove(kind, id).is_some() {
        outcome.events.push(SyncEvent::RemoteDeleted { kind, id });
    } else {
        log::debug!("reconcile: delete for unknown {kind} {id}, nothing to remove");
    }
    outcome
}

fn apply_read(
    cache: &mut LocalCache,
    editing: Option<(EntityKind, EntityId)>,
    message: &InboundMessage,
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();
    let kind = message.kind();
    let payload = &message.payload;

    let Some(server_id) = payload.server_id() else {
        log::warn!("reconcile: read response without a server id, ignoring");
        return outcome;
    };
    let id = EntityId::Server(server_id);

    match cache.get_mut(kind, id) {
        Some(entity) => {
            merge_payload(payload, entity);
            let entity = entity.clone();
            if editing == Some((kind, id)) {
                outcome.events.push(SyncEvent::EditingMerged { kind, id });
            } else {
                outcome.events.push(SyncEvent::Loaded(entity));
            }
        }
        None => {
            let entity = entity_from_payload(payload, id);
            cache.upsert(entity.clone());
            outcome.events.push(SyncEvent::Loaded(entity));
        }
    }
    outcome
}

/// The identifier an update/delete confirmation addresses: the
/// server-assigned id when present, the temporary id otherwise.
fn target_id(payload: &Payload) -> Option<EntityId> {
    payload
        .server_id()
        .map(EntityId::Server)
        .or_else(|| payload.client_temp_id().map(EntityId::Temp))
}

fn entity_from_payload(payload: &Payload, id: EntityId) -> LocalEntity {
    match payload {
        Payload::Memo(body) => LocalEntity::Memo(body.clone().into_memo(id)),
        Payload::ShelfBook(body) => LocalEntity::ShelfBook(body.clone().into_shelf_book(id)),
    }
}

fn merge_payload(payload: &Payload, entity: &mut LocalEntity) {
    match (payload, entity) {
        (Payload::Memo(body), LocalEntity::Memo(memo)) => body.merge_into(memo),
        (Payload::ShelfBook(body), LocalEntity::ShelfBook(book)) => body.merge_into(book),
        _ => log::warn!("reconcile: payload kind does not match cached entity, skipping merge"),
    }
}

/// Rewrite a deferred command body so it addresses the server id.
fn readdress(payload: Payload, server_id: i64) -> Payload {
    match payload {
        Payload::Memo(mut body) => {
            body.cache_memo_id = Some(server_id);
            body.client_temp_id = None;
            Payload::Memo(body)
        }
        Payload::ShelfBook(mut body) => {
            body.cache_user_shelf_book_id = Some(server_id);
            body.client_temp_id = None;
            Payload::ShelfBook(body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::Instant;
    use uuid::Uuid;

    use shelfsync_core::Memo;

    use crate::optimistic::{DeferredCommand, PendingOperation};
    use crate::protocol::{InboundMessage, MemoBody};

    fn temp_memo(temp_id: i64, content: &str) -> LocalEntity {
        LocalEntity::Memo(Memo {
            id: EntityId::Temp(temp_id),
            user_book_id: 7,
            page_number: Some(1),
            content: content.to_string(),
            tags: Vec::new(),
            tag_category: None,
            memo_start_time: None,
        })
    }

    fn pending_create(temp_id: i64, event_id: Uuid, content: &str) -> PendingOperation {
        PendingOperation {
            temp_id,
            event_id,
            kind: EntityKind::Memo,
            op: OpKind::Create,
            body: Payload::Memo(MemoBody {
                client_temp_id: Some(temp_id),
                event_id: Some(event_id),
                cache_user_shelf_book_id: Some(7),
                content: Some(content.to_string()),
                page_number: Some(1),
                ..MemoBody::default()
            }),
            created_at: Instant::now(),
        }
    }

    fn message(channel: &str, body: serde_json::Value) -> InboundMessage {
        InboundMessage::decode(channel, body).unwrap()
    }

    #[test]
    fn test_create_matched_by_event_id() {
        let mut cache = LocalCache::new();
        let mut pending = PendingSet::new();
        let event_id = Uuid::new_v4();

        cache.upsert(temp_memo(1001, "hello"));
        pending.insert(pending_create(1001, event_id, "hello"));

        let msg = message(
            "42/create/memo",
            json!({"cacheMemoId": 9, "eventId": event_id, "content": "hello"}),
        );
        let outcome = apply(&mut cache, &mut pending, None, &msg);

        assert!(matches!(
            outcome.events[0],
            SyncEvent::Reconciled { temp_id: 1001, id: EntityId::Server(9), .. }
        ));
        assert_eq!(cache.len(), 1);
        let entity = cache.get(EntityKind::Memo, EntityId::Server(9)).unwrap();
        assert!(!entity.is_temporary());
        assert_eq!(entity.as_memo().unwrap().content, "hello");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_create_matched_by_client_temp_id() {
        let mut cache = LocalCache::new();
        let mut pending = PendingSet::new();
        cache.upsert(temp_memo(1001, "hello"));
        pending.insert(pending_create(1001, Uuid::new_v4(), "hello"));

        // Server echoed the temp id but not the event id.
        let msg = message(
            "42/create/memo",
            json!({"cacheMemoId": 9, "clientTempId": 1001, "content": "hello"}),
        );
        let outcome = apply(&mut cache, &mut pending, None, &msg);

        assert!(matches!(outcome.events[0], SyncEvent::Reconciled { .. }));
        assert!(cache.contains(EntityKind::Memo, EntityId::Server(9)));
        assert!(!cache.contains(EntityKind::Memo, EntityId::Temp(1001)));
    }

    #[test]
    fn test_create_matched_by_structural_signature() {
        let mut cache = LocalCache::new();
        let mut pending = PendingSet::new();
        cache.upsert(temp_memo(1001, "hello"));
        pending.insert(pending_create(1001, Uuid::new_v4(), "hello"));

        // No correlation echoed at all: same parent, page, content.
        let msg = message(
            "42/create/memo",
            json!({"cacheMemoId": 9, "cacheUserShelfBookId": 7, "pageNumber": 1, "content": "hello"}),
        );
        let outcome = apply(&mut cache, &mut pending, None, &msg);

        assert!(matches!(outcome.events[0], SyncEvent::Reconciled { .. }));
        assert_eq!(cache.len(), 1);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_create_miss_inserts_as_remote() {
        let mut cache = LocalCache::new();
        let mut pending = PendingSet::new();

        let msg = message(
            "42/create/memo",
            json!({"cacheMemoId": 9, "cacheUserShelfBookId": 7, "content": "from another client"}),
        );
        let outcome = apply(&mut cache, &mut pending, None, &msg);

        assert!(matches!(outcome.events[0], SyncEvent::RemoteCreated(_)));
        assert!(cache.contains(EntityKind::Memo, EntityId::Server(9)));
    }

    #[test]
    fn test_create_miss_leaves_unrelated_pending_untouched() {
        let mut cache = LocalCache::new();
        let mut pending = PendingSet::new();
        cache.upsert(temp_memo(1001, "mine"));
        pending.insert(pending_create(1001, Uuid::new_v4(), "mine"));

        let msg = message(
            "42/create/memo",
            json!({"cacheMemoId": 9, "cacheUserShelfBookId": 8, "content": "theirs"}),
        );
        apply(&mut cache, &mut pending, None, &msg);

        assert_eq!(pending.len(), 1);
        assert!(cache.contains(EntityKind::Memo, EntityId::Temp(1001)));
        assert!(cache.contains(EntityKind::Memo, EntityId::Server(9)));
    }

    #[test]
    fn test_reconciled_create_releases_deferred_commands() {
        let mut cache = LocalCache::new();
        let mut pending = PendingSet::new();
        let event_id = Uuid::new_v4();
        cache.upsert(temp_memo(1001, "hello"));
        pending.insert(pending_create(1001, event_id, "hello"));
        pending.defer(
            EntityKind::Memo,
            1001,
            DeferredCommand {
                op: OpKind::Update,
                body: Payload::Memo(MemoBody {
                    client_temp_id: Some(1001),
                    content: Some("edited while pending".to_string()),
                    ..MemoBody::default()
                }),
            },
        );

        let msg = message(
            "42/create/memo",
            json!({"cacheMemoId": 9, "eventId": event_id}),
        );
        let outcome = apply(&mut cache, &mut pending, None, &msg);

        assert_eq!(outcome.followups.len(), 1);
        let (op, payload) = &outcome.followups[0];
        assert_eq!(*op, OpKind::Update);
        // Re-addressed to the server id.
        assert_eq!(payload.server_id(), Some(9));
        assert_eq!(payload.client_temp_id(), None);
    }

    #[test]
    fn test_reconcile_preserves_local_fields_not_in_confirmation() {
        let mut cache = LocalCache::new();
        let mut pending = PendingSet::new();
        let event_id = Uuid::new_v4();

        let mut entity = temp_memo(1001, "typed locally");
        if let LocalEntity::Memo(m) = &mut entity {
            m.tags = vec!["QUOTE".to_string()];
        }
        cache.upsert(entity);
        pending.insert(pending_create(1001, event_id, "typed locally"));

        // Confirmation carries only the id mapping.
        let msg = message(
            "42/create/memo",
            json!({"cacheMemoId": 9, "eventId": event_id}),
        );
        apply(&mut cache, &mut pending, None, &msg);

        let memo = cache
            .get(EntityKind::Memo, EntityId::Server(9))
            .unwrap()
            .as_memo()
            .unwrap()
            .clone();
        assert_eq!(memo.content, "typed locally");
        assert_eq!(memo.tags, vec!["QUOTE".to_string()]);
    }

    #[test]
    fn test_update_applies_by_id() {
        let mut cache = LocalCache::new();
        let mut pending = PendingSet::new();
        cache.upsert(LocalEntity::Memo(Memo {
            id: EntityId::Server(9),
            user_book_id: 7,
            page_number: Some(1),
            content: "old".to_string(),
            tags: Vec::new(),
            tag_category: None,
            memo_start_time: None,
        }));

        let msg = message("42/update/memo", json!({"cacheMemoId": 9, "content": "new"}));
        let outcome = apply(&mut cache, &mut pending, None, &msg);

        assert!(matches!(outcome.events[0], SyncEvent::RemoteUpdated(_)));
        let memo = cache.get(EntityKind::Memo, EntityId::Server(9)).unwrap();
        assert_eq!(memo.as_memo().unwrap().content, "new");
    }

    #[test]
    fn test_update_to_editing_entity_merges_in_place() {
        let mut cache = LocalCache::new();
        let mut pending = PendingSet::new();
        cache.upsert(LocalEntity::Memo(Memo {
            id: EntityId::Server(9),
            user_book_id: 7,
            page_number: Some(3),
            content: "unsaved keystrokes".to_string(),
            tags: Vec::new(),
            tag_category: None,
            memo_start_time: None,
        }));

        let editing = Some((EntityKind::Memo, EntityId::Server(9)));
        let msg = message("42/update/memo", json!({"cacheMemoId": 9, "pageNumber": 4}));
        let outcome = apply(&mut cache, &mut pending, editing, &msg);

        assert!(matches!(
            outcome.events[0],
            SyncEvent::EditingMerged { id: EntityId::Server(9), .. }
        ));
        let memo = cache
            .get(EntityKind::Memo, EntityId::Server(9))
            .unwrap()
            .as_memo()
            .unwrap()
            .clone();
        // Authoritative field merged, local buffer preserved.
        assert_eq!(memo.page_number, Some(4));
        assert_eq!(memo.content, "unsaved keystrokes");
    }

    #[test]
    fn test_delete_removes_and_clears_pending() {
        let mut cache = LocalCache::new();
        let mut pending = PendingSet::new();
        cache.upsert(temp_memo(1001, "doomed"));
        pending.insert(pending_create(1001, Uuid::new_v4(), "doomed"));

        let msg = message("42/delete/memo", json!({"clientTempId": 1001}));
        let outcome = apply(&mut cache, &mut pending, None, &msg);

        assert!(matches!(outcome.events[0], SyncEvent::RemoteDeleted { .. }));
        assert!(cache.is_empty());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_delete_discards_deferred_commands() {
        let mut cache = LocalCache::new();
        let mut pending = PendingSet::new();
        cache.upsert(temp_memo(1001, "doomed"));
        pending.insert(pending_create(1001, Uuid::new_v4(), "doomed"));
        pending.defer(
            EntityKind::Memo,
            1001,
            DeferredCommand {
                op: OpKind::Update,
                body: Payload::Memo(MemoBody::default()),
            },
        );

        let msg = message("42/delete/memo", json!({"clientTempId": 1001}));
        apply(&mut cache, &mut pending, None, &msg);

        assert!(pending.is_empty());
        // The parked update dies with its entity.
        assert!(pending.take_deferred(EntityKind::Memo, 1001).is_empty());
    }

    #[test]
    fn test_delete_unknown_id_is_harmless() {
        let mut cache = LocalCache::new();
        let mut pending = PendingSet::new();

        let msg = message("42/delete/memo", json!({"cacheMemoId": 404}));
        let outcome = apply(&mut cache, &mut pending, None, &msg);
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn test_read_response_loads_into_cache() {
        let mut cache = LocalCache::new();
        let mut pending = PendingSet::new();

        let msg = message(
            "42/read/memo",
            json!({"cacheMemoId": 9, "cacheUserShelfBookId": 7, "content": "stored"}),
        );
        let outcome = apply(&mut cache, &mut pending, None, &msg);

        assert!(matches!(outcome.events[0], SyncEvent::Loaded(_)));
        assert!(cache.contains(EntityKind::Memo, EntityId::Server(9)));
    }

    #[test]
    fn test_shelf_book_create_reconciles() {
        let mut cache = LocalCache::new();
        let mut pending = PendingSet::new();
        let event_id = Uuid::new_v4();

        cache.upsert(LocalEntity::ShelfBook(shelfsync_core::ShelfBook {
            id: EntityId::Temp(2001),
            book_id: Some(501),
            category: Some("ToRead".to_string()),
            expectation: None,
            reading_start_date: None,
            reading_progress: None,
            purchase_type: None,
            reading_finished_date: None,
            rating: None,
            review: None,
        }));
        pending.insert(PendingOperation {
            temp_id: 2001,
            event_id,
            kind: EntityKind::ShelfBook,
            op: OpKind::Create,
            body: Payload::ShelfBook(Default::default()),
            created_at: Instant::now(),
        });

        let msg = message(
            "42/create/usershelfbook",
            json!({"cacheUserShelfBookId": 70, "eventId": event_id}),
        );
        let outcome = apply(&mut cache, &mut pending, None, &msg);

        assert!(matches!(
            outcome.events[0],
            SyncEvent::Reconciled { kind: EntityKind::ShelfBook, temp_id: 2001, id: EntityId::Server(70) }
        ));
        let book = cache
            .get(EntityKind::ShelfBook, EntityId::Server(70))
            .unwrap()
            .as_shelf_book()
            .unwrap()
            .clone();
        assert_eq!(book.book_id, Some(501));
    }
}

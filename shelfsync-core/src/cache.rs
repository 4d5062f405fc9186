//! In-memory entity cache — the single source of truth the rendering
//! layer reads from.
//!
//! The cache never performs network I/O. It is mutated by the
//! optimistic tracker (provisional inserts), by reconciliation
//! (temp→server identity rewrite) and by confirmed remote events.
//!
//! Invariants:
//! - `list()` never contains two entries with the same resolved id
//! - resolving a temporary identifier replaces the record in place;
//!   the temporary entry does not survive the rewrite

use std::collections::HashMap;

use crate::{EntityId, EntityKind, LocalEntity, Signature};

/// Map of current identifier (temporary or resolved) to entity state.
#[derive(Debug, Default)]
pub struct LocalCache {
    entries: HashMap<(EntityKind, EntityId), LocalEntity>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert or replace an entity under its current identifier.
    pub fn upsert(&mut self, entity: LocalEntity) {
        self.entries.insert((entity.kind(), entity.id()), entity);
    }

    /// Remove an entity. Returns the removed record, if any.
    pub fn remove(&mut self, kind: EntityKind, id: EntityId) -> Option<LocalEntity> {
        self.entries.remove(&(kind, id))
    }

    pub fn get(&self, kind: EntityKind, id: EntityId) -> Option<&LocalEntity> {
        self.entries.get(&(kind, id))
    }

    pub fn get_mut(&mut self, kind: EntityKind, id: EntityId) -> Option<&mut LocalEntity> {
        self.entries.get_mut(&(kind, id))
    }

    pub fn contains(&self, kind: EntityKind, id: EntityId) -> bool {
        self.entries.contains_key(&(kind, id))
    }

    /// All entities, unordered.
    pub fn list(&self) -> Vec<&LocalEntity> {
        self.entries.values().collect()
    }

    /// All entities of one kind, unordered.
    pub fn list_kind(&self, kind: EntityKind) -> Vec<&LocalEntity> {
        self.entries
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, v)| v)
            .collect()
    }

    /// Entities matching a caller-supplied predicate.
    pub fn list_where<F>(&self, mut filter: F) -> Vec<&LocalEntity>
    where
        F: FnMut(&LocalEntity) -> bool,
    {
        self.entries.values().filter(|e| filter(e)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Find a temporary entity of `kind` whose structural signature
    /// matches. Used as the reconciliation fallback when the server
    /// did not echo a correlation token.
    pub fn find_temp_by_signature(
        &self,
        kind: EntityKind,
        signature: &Signature,
    ) -> Option<&LocalEntity> {
        self.entries
            .iter()
            .filter(|((k, id), _)| *k == kind && id.is_temporary())
            .map(|(_, v)| v)
            .find(|e| e.signature() == *signature)
    }

    /// Rewrite the identity of a temporary entity to its server-assigned
    /// id, replacing the record in place.
    ///
    /// `authoritative` carries the server's view of the entity (already
    /// holding the server id); local fields not present in the
    /// confirmation were merged by the caller. Returns the resolved
    /// entity, or `None` if no temporary record existed.
    pub fn resolve_temp(
        &mut self,
        kind: EntityKind,
        temp_id: i64,
        authoritative: LocalEntity,
    ) -> Option<&LocalEntity> {
        debug_assert!(!authoritative.id().is_temporary());
        self.entries.remove(&(kind, EntityId::Temp(temp_id)))?;
        let key = (kind, authoritative.id());
        log::debug!(
            "cache: resolved temp {} -> {} ({kind})",
            temp_id,
            authoritative.id()
        );
        self.entries.insert(key, authoritative);
        self.entries.get(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Memo;

    fn memo(id: EntityId, content: &str) -> LocalEntity {
        LocalEntity::Memo(Memo {
            id,
            user_book_id: 7,
            page_number: Some(1),
            content: content.to_string(),
            tags: Vec::new(),
            tag_category: None,
            memo_start_time: None,
        })
    }

    #[test]
    fn test_upsert_get_remove() {
        let mut cache = LocalCache::new();
        cache.upsert(memo(EntityId::Server(9), "hello"));

        assert_eq!(cache.len(), 1);
        assert!(cache.contains(EntityKind::Memo, EntityId::Server(9)));

        let removed = cache.remove(EntityKind::Memo, EntityId::Server(9));
        assert!(removed.is_some());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_upsert_same_id_replaces() {
        let mut cache = LocalCache::new();
        cache.upsert(memo(EntityId::Server(9), "first"));
        cache.upsert(memo(EntityId::Server(9), "second"));

        assert_eq!(cache.len(), 1);
        let entity = cache.get(EntityKind::Memo, EntityId::Server(9)).unwrap();
        assert_eq!(entity.as_memo().unwrap().content, "second");
    }

    #[test]
    fn test_resolve_temp_replaces_in_place() {
        let mut cache = LocalCache::new();
        cache.upsert(memo(EntityId::Temp(1001), "hello"));

        let resolved = cache.resolve_temp(
            EntityKind::Memo,
            1001,
            memo(EntityId::Server(9), "hello"),
        );
        assert!(resolved.is_some());

        // Exactly one entry, carrying the server id; no temp entry left.
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(EntityKind::Memo, EntityId::Server(9)));
        assert!(!cache.contains(EntityKind::Memo, EntityId::Temp(1001)));
    }

    #[test]
    fn test_resolve_temp_without_temp_record() {
        let mut cache = LocalCache::new();
        let resolved =
            cache.resolve_temp(EntityKind::Memo, 1001, memo(EntityId::Server(9), "x"));
        assert!(resolved.is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_no_duplicate_resolved_ids_after_resolve() {
        let mut cache = LocalCache::new();
        // A remote broadcast inserted the server record before our
        // confirmation was reconciled.
        cache.upsert(memo(EntityId::Server(9), "hello"));
        cache.upsert(memo(EntityId::Temp(1001), "hello"));

        cache.resolve_temp(EntityKind::Memo, 1001, memo(EntityId::Server(9), "hello"));

        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_find_temp_by_signature() {
        let mut cache = LocalCache::new();
        cache.upsert(memo(EntityId::Server(3), "confirmed"));
        cache.upsert(memo(EntityId::Temp(1001), "draft"));

        let sig = memo(EntityId::Temp(0), "draft").signature();
        let found = cache.find_temp_by_signature(EntityKind::Memo, &sig);
        assert_eq!(found.unwrap().id(), EntityId::Temp(1001));

        let sig = memo(EntityId::Temp(0), "confirmed").signature();
        // Resolved entities are never signature-matched.
        assert!(cache.find_temp_by_signature(EntityKind::Memo, &sig).is_none());
    }

    #[test]
    fn test_list_filters() {
        let mut cache = LocalCache::new();
        cache.upsert(memo(EntityId::Server(1), "a"));
        cache.upsert(memo(EntityId::Server(2), "b"));

        assert_eq!(cache.list().len(), 2);
        assert_eq!(cache.list_kind(EntityKind::Memo).len(), 2);
        assert_eq!(cache.list_kind(EntityKind::ShelfBook).len(), 0);

        let only_b = cache.list_where(|e| e.as_memo().is_some_and(|m| m.content == "b"));
        assert_eq!(only_b.len(), 1);
    }
}

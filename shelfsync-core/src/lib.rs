//! # shelfsync-core — domain model for the reading-tracker sync engine
//!
//! Pure data: entity kinds, identifiers, the two tracked entities
//! (memos and shelf books) and the in-memory [`LocalCache`] the UI
//! renders from. No I/O happens in this crate.

use serde::{Deserialize, Serialize};

pub mod cache;

pub use cache::LocalCache;

/// A tracked domain type. Wire names match the channel vocabulary
/// of the sync server (`memo`, `usershelfbook`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Memo,
    ShelfBook,
}

impl EntityKind {
    /// All tracked kinds, in subscription order.
    pub const ALL: [EntityKind; 2] = [EntityKind::Memo, EntityKind::ShelfBook];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Memo => "memo",
            EntityKind::ShelfBook => "usershelfbook",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "memo" => Some(EntityKind::Memo),
            "usershelfbook" => Some(EntityKind::ShelfBook),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the four channel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Create,
    Read,
    Update,
    Delete,
}

impl OpKind {
    /// All operations, in subscription order.
    pub const ALL: [OpKind; 4] = [
        OpKind::Create,
        OpKind::Read,
        OpKind::Update,
        OpKind::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Read => "read",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OpKind::Create),
            "read" => Some(OpKind::Read),
            "update" => Some(OpKind::Update),
            "delete" => Some(OpKind::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity identity: a client-fabricated placeholder until the server
/// confirms, the server-assigned id afterwards.
///
/// Reconciliation rewrites `Temp(t)` to `Server(s)` in place, so an
/// entity can never carry both identifiers at once and the temporary
/// flag clears together with the rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityId {
    Temp(i64),
    Server(i64),
}

impl EntityId {
    pub fn is_temporary(&self) -> bool {
        matches!(self, EntityId::Temp(_))
    }

    /// The raw numeric value, regardless of provenance.
    pub fn raw(&self) -> i64 {
        match self {
            EntityId::Temp(v) | EntityId::Server(v) => *v,
        }
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityId::Temp(v) => write!(f, "temp:{v}"),
            EntityId::Server(v) => write!(f, "{v}"),
        }
    }
}

/// A reading memo attached to a shelf book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memo {
    pub id: EntityId,
    /// Parent shelf-book id (server-assigned).
    pub user_book_id: i64,
    pub page_number: Option<u32>,
    pub content: String,
    pub tags: Vec<String>,
    pub tag_category: Option<String>,
    /// ISO-8601 timestamp of when the memo was started.
    pub memo_start_time: Option<String>,
}

impl Memo {
    /// Structural signature used as the reconciliation fallback:
    /// parent book + page number + exact content.
    pub fn signature(&self) -> Signature {
        Signature {
            parent: self.user_book_id,
            discriminant: format!("{}|{}", self.page_number.unwrap_or(0), self.content),
        }
    }
}

/// A book on the user's shelf, with reading state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShelfBook {
    pub id: EntityId,
    /// Catalog book id this shelf entry points at.
    pub book_id: Option<i64>,
    pub category: Option<String>,
    pub expectation: Option<String>,
    pub reading_start_date: Option<String>,
    pub reading_progress: Option<u32>,
    pub purchase_type: Option<String>,
    pub reading_finished_date: Option<String>,
    pub rating: Option<f32>,
    pub review: Option<String>,
}

impl ShelfBook {
    /// Structural signature: catalog book id discriminates shelf entries.
    pub fn signature(&self) -> Signature {
        Signature {
            parent: self.book_id.unwrap_or(0),
            discriminant: self.category.clone().unwrap_or_default(),
        }
    }
}

/// Parent id plus a discriminating field, used to match an unechoed
/// create confirmation against a temporary entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub parent: i64,
    pub discriminant: String,
}

/// The UI-visible representation of any tracked entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LocalEntity {
    Memo(Memo),
    ShelfBook(ShelfBook),
}

impl LocalEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            LocalEntity::Memo(_) => EntityKind::Memo,
            LocalEntity::ShelfBook(_) => EntityKind::ShelfBook,
        }
    }

    pub fn id(&self) -> EntityId {
        match self {
            LocalEntity::Memo(m) => m.id,
            LocalEntity::ShelfBook(b) => b.id,
        }
    }

    pub fn set_id(&mut self, id: EntityId) {
        match self {
            LocalEntity::Memo(m) => m.id = id,
            LocalEntity::ShelfBook(b) => b.id = id,
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.id().is_temporary()
    }

    pub fn signature(&self) -> Signature {
        match self {
            LocalEntity::Memo(m) => m.signature(),
            LocalEntity::ShelfBook(b) => b.signature(),
        }
    }

    pub fn as_memo(&self) -> Option<&Memo> {
        match self {
            LocalEntity::Memo(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_shelf_book(&self) -> Option<&ShelfBook> {
        match self {
            LocalEntity::ShelfBook(b) => Some(b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memo(id: EntityId) -> Memo {
        Memo {
            id,
            user_book_id: 7,
            page_number: Some(12),
            content: "margin note".to_string(),
            tags: vec!["TYPE".to_string()],
            tag_category: None,
            memo_start_time: None,
        }
    }

    #[test]
    fn test_kind_wire_names_roundtrip() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntityKind::parse("book"), None);
    }

    #[test]
    fn test_op_wire_names_roundtrip() {
        for op in OpKind::ALL {
            assert_eq!(OpKind::parse(op.as_str()), Some(op));
        }
        assert_eq!(OpKind::parse("patch"), None);
    }

    #[test]
    fn test_entity_id_temporary() {
        assert!(EntityId::Temp(1001).is_temporary());
        assert!(!EntityId::Server(9).is_temporary());
        assert_eq!(EntityId::Temp(1001).raw(), 1001);
        assert_eq!(EntityId::Server(9).raw(), 9);
    }

    #[test]
    fn test_memo_signature_discriminates_on_content() {
        let a = memo(EntityId::Temp(1));
        let mut b = memo(EntityId::Temp(2));
        assert_eq!(a.signature(), b.signature());

        b.content = "different".to_string();
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn test_local_entity_id_rewrite() {
        let mut entity = LocalEntity::Memo(memo(EntityId::Temp(1001)));
        assert!(entity.is_temporary());

        entity.set_id(EntityId::Server(9));
        assert!(!entity.is_temporary());
        assert_eq!(entity.id(), EntityId::Server(9));
    }
}

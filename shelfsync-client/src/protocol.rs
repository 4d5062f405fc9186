//! Wire protocol for the reading-tracker sync channel.
//!
//! Addressing scheme:
//! ```text
//! inbound broadcast:  {room}/{operation}/{entity-kind}
//! outbound send:      {app-prefix}/{room}/{operation}/{entity-kind}
//! ```
//! where `operation ∈ {create, read, update, delete}` and the entity
//! kinds are `memo` and `usershelfbook`.
//!
//! Frames are JSON, internally tagged on `frame`. Bodies are the
//! per-entity camelCase envelopes the server round-trips; the
//! `clientTempId` and `eventId` fields are client-side correlation
//! aids the server echoes back best-effort.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use shelfsync_core::{EntityId, EntityKind, Memo, OpKind, ShelfBook, Signature};

/// Opaque identifier for the one logical room (the authenticated
/// user's data) a session is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<i64> for RoomId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

/// A logical channel: one (room, operation, entity-kind) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    pub room: RoomId,
    pub op: OpKind,
    pub kind: EntityKind,
}

impl Channel {
    pub fn new(room: RoomId, op: OpKind, kind: EntityKind) -> Self {
        Self { room, op, kind }
    }

    /// Inbound broadcast name: `{room}/{op}/{entity}`.
    pub fn name(&self) -> String {
        format!("{}/{}/{}", self.room, self.op, self.kind)
    }

    /// Outbound send destination: `{app-prefix}/{room}/{op}/{entity}`.
    pub fn destination(&self, app_prefix: &str) -> String {
        format!("{}/{}/{}/{}", app_prefix, self.room, self.op, self.kind)
    }

    pub fn parse(name: &str) -> Result<Self, ProtocolError> {
        let mut parts = name.splitn(3, '/');
        let (room, op, kind) = match (parts.next(), parts.next(), parts.next()) {
            (Some(room), Some(op), Some(kind)) if !room.is_empty() => (room, op, kind),
            _ => return Err(ProtocolError::InvalidChannel(name.to_string())),
        };
        let op =
            OpKind::parse(op).ok_or_else(|| ProtocolError::InvalidChannel(name.to_string()))?;
        let kind = EntityKind::parse(kind)
            .ok_or_else(|| ProtocolError::InvalidChannel(name.to_string()))?;
        Ok(Self {
            room: RoomId::new(room),
            op,
            kind,
        })
    }
}

/// Transport frame. `Subscribe`/`Unsubscribe`/`Send` travel client to
/// server; `Message` is the server's broadcast delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "lowercase")]
pub enum Frame {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Send { destination: String, body: Value },
    Message { channel: String, body: Value },
}

impl Frame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Memo envelope, camelCase on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_memo_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_user_shelf_book_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo_start_time: Option<String>,
}

impl MemoBody {
    /// Snapshot an entity into an outbound envelope.
    pub fn from_memo(memo: &Memo) -> Self {
        Self {
            cache_memo_id: Some(memo.id.raw()),
            client_temp_id: None,
            event_id: None,
            cache_user_shelf_book_id: Some(memo.user_book_id),
            content: Some(memo.content.clone()),
            page_number: memo.page_number,
            tags: Some(memo.tags.clone()),
            tag_category: memo.tag_category.clone(),
            memo_start_time: memo.memo_start_time.clone(),
        }
    }

    /// Materialize an entity from a confirmation, under the given id.
    pub fn into_memo(self, id: EntityId) -> Memo {
        Memo {
            id,
            user_book_id: self.cache_user_shelf_book_id.unwrap_or(0),
            page_number: self.page_number,
            content: self.content.unwrap_or_default(),
            tags: self.tags.unwrap_or_default(),
            tag_category: self.tag_category,
            memo_start_time: self.memo_start_time,
        }
    }

    /// Merge the fields the confirmation actually carries into an
    /// existing record, leaving absent fields untouched. This is what
    /// keeps a live editing buffer from losing unsaved keystrokes.
    pub fn merge_into(&self, memo: &mut Memo) {
        if let Some(book) = self.cache_user_shelf_book_id {
            memo.user_book_id = book;
        }
        if let Some(content) = &self.content {
            memo.content = content.clone();
        }
        if let Some(page) = self.page_number {
            memo.page_number = Some(page);
        }
        if let Some(tags) = &self.tags {
            memo.tags = tags.clone();
        }
        if let Some(cat) = &self.tag_category {
            memo.tag_category = Some(cat.clone());
        }
        if let Some(start) = &self.memo_start_time {
            memo.memo_start_time = Some(start.clone());
        }
    }

    /// Structural signature of the envelope, when it carries enough
    /// fields to build one.
    pub fn signature(&self) -> Option<Signature> {
        let parent = self.cache_user_shelf_book_id?;
        Some(Signature {
            parent,
            discriminant: format!(
                "{}|{}",
                self.page_number.unwrap_or(0),
                self.content.clone().unwrap_or_default()
            ),
        })
    }
}

/// Shelf-book envelope, camelCase on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShelfBookBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_user_shelf_book_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_book_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expectation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reading_start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reading_progress: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purchase_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reading_finished_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<String>,
}

impl ShelfBookBody {
    pub fn from_shelf_book(book: &ShelfBook) -> Self {
        Self {
            cache_user_shelf_book_id: Some(book.id.raw()),
            client_temp_id: None,
            event_id: None,
            cache_book_id: book.book_id,
            category: book.category.clone(),
            expectation: book.expectation.clone(),
            reading_start_date: book.reading_start_date.clone(),
            reading_progress: book.reading_progress,
            purchase_type: book.purchase_type.clone(),
            reading_finished_date: book.reading_finished_date.clone(),
            rating: book.rating,
            review: book.review.clone(),
        }
    }

    pub fn into_shelf_book(self, id: EntityId) -> ShelfBook {
        ShelfBook {
            id,
            book_id: self.cache_book_id,
            category: self.category,
            expectation: self.expectation,
            reading_start_date: self.reading_start_date,
            reading_progress: self.reading_progress,
            purchase_type: self.purchase_type,
            reading_finished_date: self.reading_finished_date,
            rating: self.rating,
            review: self.review,
        }
    }

    pub fn merge_into(&self, book: &mut ShelfBook) {
        if let Some(id) = self.cache_book_id {
            book.book_id = Some(id);
        }
        if let Some(v) = &self.category {
            book.category = Some(v.clone());
        }
        if let Some(v) = &self.expectation {
            book.expectation = Some(v.clone());
        }
        if let Some(v) = &self.reading_start_date {
            book.reading_start_date = Some(v.clone());
        }
        if let Some(v) = self.reading_progress {
            book.reading_progress = Some(v);
        }
        if let Some(v) = &self.purchase_type {
            book.purchase_type = Some(v.clone());
        }
        if let Some(v) = &self.reading_finished_date {
            book.reading_finished_date = Some(v.clone());
        }
        if let Some(v) = self.rating {
            book.rating = Some(v);
        }
        if let Some(v) = &self.review {
            book.review = Some(v.clone());
        }
    }

    pub fn signature(&self) -> Option<Signature> {
        let parent = self.cache_book_id?;
        Some(Signature {
            parent,
            discriminant: self.category.clone().unwrap_or_default(),
        })
    }
}

/// Typed inbound payload, one variant per entity kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Memo(MemoBody),
    ShelfBook(ShelfBookBody),
}

impl Payload {
    pub fn kind(&self) -> EntityKind {
        match self {
            Payload::Memo(_) => EntityKind::Memo,
            Payload::ShelfBook(_) => EntityKind::ShelfBook,
        }
    }

    pub fn server_id(&self) -> Option<i64> {
        match self {
            Payload::Memo(b) => b.cache_memo_id,
            Payload::ShelfBook(b) => b.cache_user_shelf_book_id,
        }
    }

    pub fn client_temp_id(&self) -> Option<i64> {
        match self {
            Payload::Memo(b) => b.client_temp_id,
            Payload::ShelfBook(b) => b.client_temp_id,
        }
    }

    pub fn event_id(&self) -> Option<Uuid> {
        match self {
            Payload::Memo(b) => b.event_id,
            Payload::ShelfBook(b) => b.event_id,
        }
    }

    pub fn signature(&self) -> Option<Signature> {
        match self {
            Payload::Memo(b) => b.signature(),
            Payload::ShelfBook(b) => b.signature(),
        }
    }

    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        let result = match self {
            Payload::Memo(b) => serde_json::to_value(b),
            Payload::ShelfBook(b) => serde_json::to_value(b),
        };
        result.map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// A decoded broadcast: closed, typed variant per (entity, operation),
/// produced at the router boundary so downstream logic never inspects
/// message shape structurally.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub channel: Channel,
    pub payload: Payload,
}

impl InboundMessage {
    /// Decode a `Message` frame body against its channel tag.
    pub fn decode(channel: &str, body: Value) -> Result<Self, ProtocolError> {
        let channel = Channel::parse(channel)?;
        let payload = match channel.kind {
            EntityKind::Memo => Payload::Memo(
                serde_json::from_value(body)
                    .map_err(|e| ProtocolError::Deserialization(e.to_string()))?,
            ),
            EntityKind::ShelfBook => Payload::ShelfBook(
                serde_json::from_value(body)
                    .map_err(|e| ProtocolError::Deserialization(e.to_string()))?,
            ),
        };
        Ok(Self { channel, payload })
    }

    pub fn op(&self) -> OpKind {
        self.channel.op
    }

    pub fn kind(&self) -> EntityKind {
        self.channel.kind
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    InvalidChannel(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidChannel(c) => write!(f, "Invalid channel name: {c}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

//! Typed events emitted by the sync engine.
//!
//! One closed enum instead of stringly-typed event names: consumers
//! match exhaustively and the compiler flags unhandled variants.

use std::time::Duration;

use shelfsync_core::{EntityId, EntityKind, LocalEntity, OpKind};

use crate::connection::ConnectionState;
use crate::protocol::RoomId;

/// Events emitted by the sync client. The UI layer consumes these to
/// reflect connectivity and to re-render from the cache.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection state transition. Emitted for every transition so
    /// the UI never needs to poll.
    StateChanged(ConnectionState),
    /// Session established and subscribed to the room.
    Connected { room: RoomId },
    /// Session torn down.
    Disconnected,
    /// A handshake or transport failure, with the cause.
    ConnectionFailed { cause: String },
    /// A retry was scheduled.
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// The retry cap was reached; an explicit `connect` is required.
    ReconnectExhausted { attempts: u32 },
    /// The offline queue was drained after (re)connecting.
    QueueFlushed { count: usize },

    /// A remote client created an entity (no local pending matched).
    RemoteCreated(LocalEntity),
    /// A remote update was applied to the cache.
    RemoteUpdated(LocalEntity),
    /// A remote delete was applied to the cache.
    RemoteDeleted { kind: EntityKind, id: EntityId },
    /// A read response entity was loaded into the cache.
    Loaded(LocalEntity),

    /// An optimistic create was confirmed: the temporary identifier
    /// was rewritten to the server-assigned one.
    Reconciled {
        kind: EntityKind,
        temp_id: i64,
        id: EntityId,
    },
    /// A confirmation targeted the entity open for editing; its
    /// authoritative fields were merged in place instead of forcing a
    /// full re-render.
    EditingMerged { kind: EntityKind, id: EntityId },
    /// A pending operation waited longer than the configured timeout
    /// without a matching confirmation ("sync failed, retry?").
    PendingExpired {
        kind: EntityKind,
        temp_id: i64,
        op: OpKind,
    },

    /// An outbound send was rejected by the transport. The payload is
    /// not requeued; the caller decides whether to retry.
    SendFailed {
        kind: EntityKind,
        op: OpKind,
        cause: String,
    },
    /// A malformed inbound message was discarded.
    ParseFailed { cause: String },
}

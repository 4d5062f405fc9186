//! # shelfsync-client — real-time sync engine for the reading tracker
//!
//! Keeps a user's memos and shelf books synchronized with the server
//! over a WebSocket session, with optimistic local mutations:
//!
//! - every mutation applies to the [`LocalCache`] immediately, under a
//!   temporary identifier for creates
//! - confirmations are reconciled back by correlation token, echoed
//!   temp id or structural signature, rewriting temp ids in place
//! - sends while offline queue FIFO and flush on reconnect
//! - reconnects are bounded: linearly growing delay, capped attempts
//! - burst-prone updates (autosave) debounce per entity
//!
//! ```no_run
//! use shelfsync_client::{RoomId, SyncClient, SyncConfig};
//!
//! # async fn run() {
//! let client = SyncClient::new(SyncConfig::default());
//! let mut events = client.take_event_rx().unwrap();
//! client.connect(RoomId::from(42)).await;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod debounce;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod optimistic;
pub mod protocol;
pub mod reconcile;
pub mod router;
pub mod transport;

pub use client::{SyncClient, SyncConfig};
pub use connection::{ConnectionState, ReconnectPolicy};
pub use error::SyncError;
pub use event::SyncEvent;
pub use protocol::{Channel, Frame, MemoBody, Payload, RoomId, ShelfBookBody};
pub use shelfsync_core::{
    EntityId, EntityKind, LocalCache, LocalEntity, Memo, OpKind, ShelfBook,
};

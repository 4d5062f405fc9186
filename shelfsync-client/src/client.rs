//! The sync client facade: one session per authenticated user, owning
//! the connection supervisor, the router, the outbound dispatcher, the
//! optimistic tracker and the debounce scheduler.
//!
//! All remote effects surface as [`SyncEvent`]s on the channel returned
//! by [`SyncClient::take_event_rx`]; the UI re-renders from the cache
//! when it sees one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;

use shelfsync_core::{EntityId, EntityKind, LocalCache, LocalEntity, Memo, OpKind, ShelfBook};

use crate::connection::{ConnectionState, ReconnectPolicy};
use crate::debounce::{DebounceScheduler, FlushItem, DEFAULT_DEBOUNCE};
use crate::dispatcher::{OutboundDispatcher, SendStatus};
use crate::error::SyncError;
use crate::event::SyncEvent;
use crate::optimistic::{
    DeferredCommand, IdSource, PendingOperation, PendingSet, SystemIds,
};
use crate::protocol::{Frame, MemoBody, Payload, RoomId, ShelfBookBody};
use crate::reconcile;
use crate::router::SubscriptionRouter;
use crate::transport::{Connection, TransportFactory, WsFactory};

/// Client configuration. The defaults mirror the development server.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// WebSocket endpoint, without the room segment.
    pub endpoint: String,
    /// Prefix prepended to outbound send destinations.
    pub app_prefix: String,
    /// Bearer credential for the handshake, if the server requires one.
    pub token: Option<String>,
    pub reconnect: ReconnectPolicy,
    /// Quiet period for debounced updates.
    pub debounce_interval: Duration,
    /// How long an unconfirmed optimistic operation may wait before it
    /// is reported as expired.
    pub pending_timeout: Duration,
    /// Offline queue capacity; sends beyond it fail.
    pub queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:9090/ws-sharedsync".to_string(),
            app_prefix: "/app".to_string(),
            token: None,
            reconnect: ReconnectPolicy::default(),
            debounce_interval: DEFAULT_DEBOUNCE,
            pending_timeout: Duration::from_secs(30),
            queue_capacity: 512,
        }
    }
}

/// Cache, pending set and editing marker behind one lock, so
/// reconciliation observes them atomically.
struct EngineState {
    cache: LocalCache,
    pending: PendingSet,
    editing: Option<(EntityKind, EntityId)>,
}

struct ClientInner {
    config: SyncConfig,
    transport: Arc<dyn TransportFactory>,
    ids: Arc<dyn IdSource>,
    router: SubscriptionRouter,
    dispatcher: OutboundDispatcher,
    debounce: DebounceScheduler,
    shared: Mutex<EngineState>,
    state: StdRwLock<ConnectionState>,
    room: StdRwLock<Option<RoomId>>,
    events: mpsc::UnboundedSender<SyncEvent>,
    // Bumped on every connect/disconnect; a session loop whose captured
    // value no longer matches stops touching shared state.
    generation: AtomicU64,
    shutdown: Notify,
}

/// The sync engine entry point.
pub struct SyncClient {
    inner: Arc<ClientInner>,
    event_rx: StdMutex<Option<mpsc::UnboundedReceiver<SyncEvent>>>,
    flush_rx: StdMutex<Option<mpsc::UnboundedReceiver<FlushItem>>>,
    background_started: AtomicBool,
}

impl SyncClient {
    /// Production client: WebSocket transport, system identifiers.
    pub fn new(config: SyncConfig) -> Self {
        Self::with_transport(config, Arc::new(WsFactory::new()), Arc::new(SystemIds::new()))
    }

    /// Constructor-injected transport and id source, used by tests.
    pub fn with_transport(
        config: SyncConfig,
        transport: Arc<dyn TransportFactory>,
        ids: Arc<dyn IdSource>,
    ) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (debounce, flush_rx) = DebounceScheduler::new(config.debounce_interval);
        let dispatcher = OutboundDispatcher::new(config.app_prefix.clone(), config.queue_capacity);
        let inner = Arc::new(ClientInner {
            config,
            transport,
            ids,
            router: SubscriptionRouter::new(),
            dispatcher,
            debounce,
            shared: Mutex::new(EngineState {
                cache: LocalCache::new(),
                pending: PendingSet::new(),
                editing: None,
            }),
            state: StdRwLock::new(ConnectionState::Disconnected),
            room: StdRwLock::new(None),
            events,
            generation: AtomicU64::new(0),
            shutdown: Notify::new(),
        });
        Self {
            inner,
            event_rx: StdMutex::new(Some(event_rx)),
            flush_rx: StdMutex::new(Some(flush_rx)),
            background_started: AtomicBool::new(false),
        }
    }

    /// Take the event receiver. Can only be taken once.
    pub fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self
            .inner
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn room(&self) -> Option<RoomId> {
        self.inner
            .room
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Open (or switch) the session for a room. Connecting to the room
    /// that is already active is a no-op; a different room tears the
    /// current session down first.
    pub async fn connect(&self, room: RoomId) {
        let active = self.room() == Some(room.clone())
            && self.connection_state() != ConnectionState::Disconnected;
        if active {
            log::debug!("client: already connected to room {room}, ignoring");
            return;
        }

        if self.connection_state() != ConnectionState::Disconnected {
            self.teardown().await;
        }
        self.start_background_tasks();

        *self.inner.room.write().unwrap_or_else(|e| e.into_inner()) = Some(room.clone());
        self.inner.set_state(ConnectionState::Connecting);

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.session_loop(room, generation).await;
        });
    }

    /// Close the session: unsubscribe, drop the socket, discard queued
    /// and debounced sends. Pending operations and the cache survive.
    pub async fn disconnect(&self) {
        self.teardown().await;
        *self.inner.room.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.inner.set_state(ConnectionState::Disconnected);
        let _ = self.inner.events.send(SyncEvent::Disconnected);
    }

    async fn teardown(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();
        self.inner.router.unsubscribe_all().await;
        self.inner.dispatcher.detach().await;
        self.inner.dispatcher.clear_queue().await;
        self.inner.debounce.cancel_all();
    }

    fn start_background_tasks(&self) {
        if self.background_started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut flush_rx) = self
            .flush_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                while let Some(item) = flush_rx.recv().await {
                    inner.dispatch_flush(item).await;
                }
            });
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if inner.events.is_closed() {
                    return;
                }
                inner.sweep_expired().await;
            }
        });
    }

    // ---- memos ----------------------------------------------------

    /// Optimistically create a memo. The record is visible in the cache
    /// immediately under a temporary id; the returned id is rewritten
    /// when the confirmation reconciles.
    pub async fn create_memo(&self, mut memo: Memo) -> Result<EntityId, SyncError> {
        let temp_id = self.inner.ids.next_temp_id();
        let event_id = self.inner.ids.next_event_id();
        memo.id = EntityId::Temp(temp_id);

        let mut body = MemoBody::from_memo(&memo);
        body.cache_memo_id = None;
        body.client_temp_id = Some(temp_id);
        body.event_id = Some(event_id);
        let payload = Payload::Memo(body);

        {
            let mut shared = self.inner.shared.lock().await;
            shared.cache.upsert(LocalEntity::Memo(memo));
            shared.pending.insert(PendingOperation {
                temp_id,
                event_id,
                kind: EntityKind::Memo,
                op: OpKind::Create,
                body: payload.clone(),
                created_at: Instant::now(),
            });
        }
        self.inner
            .send_command(EntityKind::Memo, OpKind::Create, payload)
            .await?;
        Ok(EntityId::Temp(temp_id))
    }

    /// Update a memo now. An update against a temporary id whose create
    /// is still unconfirmed is parked and dispatched, re-addressed,
    /// once the create reconciles.
    pub async fn update_memo(&self, memo: Memo) -> Result<(), SyncError> {
        let id = memo.id;
        let payload = Payload::Memo(outbound_memo_body(&memo));
        {
            let mut shared = self.inner.shared.lock().await;
            shared.cache.upsert(LocalEntity::Memo(memo));
            if let EntityId::Temp(temp) = id {
                if shared.pending.contains_temp(EntityKind::Memo, temp) {
                    shared.pending.defer(
                        EntityKind::Memo,
                        temp,
                        DeferredCommand {
                            op: OpKind::Update,
                            body: payload,
                        },
                    );
                    return Ok(());
                }
            }
        }
        self.inner
            .send_command(EntityKind::Memo, OpKind::Update, payload)
            .await
            .map(|_| ())
    }

    /// Update a memo after the debounce quiet period; repeated calls
    /// within the window coalesce to the latest snapshot.
    pub async fn schedule_memo_update(&self, memo: Memo) {
        let id = memo.id;
        let payload = Payload::Memo(outbound_memo_body(&memo));
        self.inner
            .shared
            .lock()
            .await
            .cache
            .upsert(LocalEntity::Memo(memo));
        self.inner
            .debounce
            .schedule(EntityKind::Memo, id, OpKind::Update, payload);
    }

    /// Send a scheduled memo update immediately (save-on-blur).
    pub fn flush_memo_update(&self, id: EntityId) -> bool {
        self.inner.debounce.flush_now(EntityKind::Memo, id)
    }

    /// Optimistically delete a memo: removed from the cache now, the
    /// command deferred if its create is still unconfirmed.
    pub async fn delete_memo(&self, id: EntityId) -> Result<(), SyncError> {
        self.delete_entity(EntityKind::Memo, id).await
    }

    /// Request the memos of one shelf book.
    pub async fn request_memos(&self, user_book_id: i64) -> Result<(), SyncError> {
        let payload = Payload::Memo(MemoBody {
            cache_user_shelf_book_id: Some(user_book_id),
            ..MemoBody::default()
        });
        self.inner
            .send_command(EntityKind::Memo, OpKind::Read, payload)
            .await
            .map(|_| ())
    }

    // ---- shelf books ----------------------------------------------

    /// Optimistically add a book to the shelf.
    pub async fn add_shelf_book(&self, mut book: ShelfBook) -> Result<EntityId, SyncError> {
        let temp_id = self.inner.ids.next_temp_id();
        let event_id = self.inner.ids.next_event_id();
        book.id = EntityId::Temp(temp_id);

        let mut body = ShelfBookBody::from_shelf_book(&book);
        body.cache_user_shelf_book_id = None;
        body.client_temp_id = Some(temp_id);
        body.event_id = Some(event_id);
        let payload = Payload::ShelfBook(body);

        {
            let mut shared = self.inner.shared.lock().await;
            shared.cache.upsert(LocalEntity::ShelfBook(book));
            shared.pending.insert(PendingOperation {
                temp_id,
                event_id,
                kind: EntityKind::ShelfBook,
                op: OpKind::Create,
                body: payload.clone(),
                created_at: Instant::now(),
            });
        }
        self.inner
            .send_command(EntityKind::ShelfBook, OpKind::Create, payload)
            .await?;
        Ok(EntityId::Temp(temp_id))
    }

    pub async fn update_shelf_book(&self, book: ShelfBook) -> Result<(), SyncError> {
        let id = book.id;
        let payload = Payload::ShelfBook(outbound_shelf_book_body(&book));
        {
            let mut shared = self.inner.shared.lock().await;
            shared.cache.upsert(LocalEntity::ShelfBook(book));
            if let EntityId::Temp(temp) = id {
                if shared.pending.contains_temp(EntityKind::ShelfBook, temp) {
                    shared.pending.defer(
                        EntityKind::ShelfBook,
                        temp,
                        DeferredCommand {
                            op: OpKind::Update,
                            body: payload,
                        },
                    );
                    return Ok(());
                }
            }
        }
        self.inner
            .send_command(EntityKind::ShelfBook, OpKind::Update, payload)
            .await
            .map(|_| ())
    }

    pub async fn delete_shelf_book(&self, id: EntityId) -> Result<(), SyncError> {
        self.delete_entity(EntityKind::ShelfBook, id).await
    }

    /// Request the full shelf.
    pub async fn request_shelf_books(&self) -> Result<(), SyncError> {
        self.inner
            .send_command(
                EntityKind::ShelfBook,
                OpKind::Read,
                Payload::ShelfBook(ShelfBookBody::default()),
            )
            .await
            .map(|_| ())
    }

    // ---- editing --------------------------------------------------

    /// Mark an entity as open in an editor. Confirmations targeting it
    /// merge field-wise instead of replacing the record wholesale.
    pub async fn begin_editing(&self, kind: EntityKind, id: EntityId) {
        self.inner.shared.lock().await.editing = Some((kind, id));
    }

    pub async fn end_editing(&self) {
        self.inner.shared.lock().await.editing = None;
    }

    // ---- cache access ---------------------------------------------

    pub async fn entity(&self, kind: EntityKind, id: EntityId) -> Option<LocalEntity> {
        self.inner.shared.lock().await.cache.get(kind, id).cloned()
    }

    pub async fn memos(&self) -> Vec<Memo> {
        self.inner
            .shared
            .lock()
            .await
            .cache
            .list_kind(EntityKind::Memo)
            .into_iter()
            .filter_map(|e| e.as_memo().cloned())
            .collect()
    }

    pub async fn shelf_books(&self) -> Vec<ShelfBook> {
        self.inner
            .shared
            .lock()
            .await
            .cache
            .list_kind(EntityKind::ShelfBook)
            .into_iter()
            .filter_map(|e| e.as_shelf_book().cloned())
            .collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.shared.lock().await.pending.len()
    }

    pub async fn queued_count(&self) -> usize {
        self.inner.dispatcher.queue_len().await
    }

    async fn delete_entity(&self, kind: EntityKind, id: EntityId) -> Result<(), SyncError> {
        let payload = delete_payload(kind, id);
        {
            let mut shared = self.inner.shared.lock().await;
            shared.cache.remove(kind, id);
            if let EntityId::Temp(temp) = id {
                if shared.pending.contains_temp(kind, temp) {
                    shared.pending.defer(
                        kind,
                        temp,
                        DeferredCommand {
                            op: OpKind::Delete,
                            body: payload,
                        },
                    );
                    return Ok(());
                }
            }
        }
        self.inner
            .send_command(kind, OpKind::Delete, payload)
            .await
            .map(|_| ())
    }
}

impl ClientInner {
    fn stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            log::info!("client: {} -> {next}", *state);
            *state = next;
            let _ = self.events.send(SyncEvent::StateChanged(next));
        }
    }

    fn current_room(&self) -> Option<RoomId> {
        self.room.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Connect, run, reconnect with linearly growing delays, give up at
    /// the cap. Exits when the generation is bumped (explicit
    /// disconnect or room switch) or the cap is reached.
    async fn session_loop(self: Arc<Self>, room: RoomId, generation: u64) {
        let mut attempt: u32 = 0;
        loop {
            if self.stale(generation) {
                return;
            }
            let connected = self
                .transport
                .connect(&self.config.endpoint, &room, self.config.token.as_deref())
                .await;
            match connected {
                Ok(conn) => {
                    if self.stale(generation) {
                        return;
                    }
                    attempt = 0;
                    if let Err(e) = self.run_connection(&room, conn, generation).await {
                        log::error!("client: session error: {e}");
                        let _ = self.events.send(SyncEvent::ConnectionFailed {
                            cause: e.to_string(),
                        });
                    }
                    self.dispatcher.detach().await;
                    if self.stale(generation) {
                        return;
                    }
                    log::warn!("client: connection to room {room} lost");
                }
                Err(e) => {
                    log::warn!("client: connect to room {room} failed: {e}");
                    let _ = self.events.send(SyncEvent::ConnectionFailed {
                        cause: e.to_string(),
                    });
                    if self.stale(generation) {
                        return;
                    }
                    // A failed handshake drops back to Disconnected; an
                    // established connection that died goes straight to
                    // Reconnecting below.
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            attempt += 1;
            if self.config.reconnect.exhausted(attempt) {
                let attempts = attempt - 1;
                log::error!("client: giving up on room {room} after {attempts} retries");
                self.set_state(ConnectionState::Disconnected);
                let _ = self.events.send(SyncEvent::ReconnectExhausted { attempts });
                return;
            }
            self.set_state(ConnectionState::Reconnecting);
            let delay = self.config.reconnect.delay_for(attempt);
            let _ = self
                .events
                .send(SyncEvent::ReconnectScheduled { attempt, delay });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.notified() => return,
            }
            if self.stale(generation) {
                return;
            }
            // Each retry re-enters Connecting before the handshake.
            self.set_state(ConnectionState::Connecting);
        }
    }

    /// Drive one live connection: subscribe, flush the offline queue,
    /// then pump frames and reconcile until the socket closes.
    async fn run_connection(
        &self,
        room: &RoomId,
        mut conn: Connection,
        generation: u64,
    ) -> Result<(), SyncError> {
        let (in_tx, mut in_rx) = mpsc::unbounded_channel();
        let channels = self.router.subscribe_all(room, "engine", in_tx).await;
        for channel in channels {
            let frame = Frame::Subscribe {
                channel: channel.name(),
            }
            .encode()?;
            conn.outgoing
                .send(frame)
                .await
                .map_err(|e| SyncError::Send(e.to_string()))?;
        }

        let flushed = self.dispatcher.attach(conn.outgoing.clone()).await?;
        self.set_state(ConnectionState::Connected);
        let _ = self.events.send(SyncEvent::Connected { room: room.clone() });
        if flushed > 0 {
            let _ = self.events.send(SyncEvent::QueueFlushed { count: flushed });
        }

        loop {
            tokio::select! {
                frame = conn.incoming.recv() => {
                    match frame {
                        None => return Ok(()),
                        Some(text) => self.handle_frame(&text).await,
                    }
                }
                Some(message) = in_rx.recv() => {
                    self.apply_inbound(&message).await;
                }
                _ = self.shutdown.notified() => return Ok(()),
            }
            if self.stale(generation) {
                return Ok(());
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("client: discarding malformed frame: {e}");
                let _ = self.events.send(SyncEvent::ParseFailed {
                    cause: e.to_string(),
                });
                return;
            }
        };
        match frame {
            Frame::Message { channel, body } => {
                if let Err(e) = self.router.dispatch(&channel, body).await {
                    log::warn!("client: discarding undecodable message on {channel}: {e}");
                    let _ = self.events.send(SyncEvent::ParseFailed {
                        cause: e.to_string(),
                    });
                }
            }
            other => log::debug!("client: ignoring non-message frame {other:?}"),
        }
    }

    async fn apply_inbound(&self, message: &crate::protocol::InboundMessage) {
        let outcome = {
            let mut shared = self.shared.lock().await;
            let editing = shared.editing;
            let EngineState { cache, pending, .. } = &mut *shared;
            reconcile::apply(cache, pending, editing, message)
        };
        for event in outcome.events {
            let _ = self.events.send(event);
        }
        for (op, payload) in outcome.followups {
            let kind = payload.kind();
            self.send_payload(kind, op, payload).await;
        }
    }

    async fn dispatch_flush(&self, item: FlushItem) {
        if let EntityId::Temp(temp) = item.id {
            let mut shared = self.shared.lock().await;
            if shared.pending.contains_temp(item.kind, temp) {
                shared.pending.defer(
                    item.kind,
                    temp,
                    DeferredCommand {
                        op: item.op,
                        body: item.body,
                    },
                );
                return;
            }
        }
        self.send_payload(item.kind, item.op, item.body).await;
    }

    async fn sweep_expired(&self) {
        let expired = self
            .shared
            .lock()
            .await
            .pending
            .expire(self.config.pending_timeout);
        for op in expired {
            log::warn!(
                "client: {} {} for temp {} unconfirmed after {:?}",
                op.op,
                op.kind,
                op.temp_id,
                self.config.pending_timeout
            );
            let _ = self.events.send(SyncEvent::PendingExpired {
                kind: op.kind,
                temp_id: op.temp_id,
                op: op.op,
            });
        }
    }

    /// A rejected send surfaces both ways: as the returned error and
    /// as a [`SyncEvent::SendFailed`] for observers.
    async fn send_command(
        &self,
        kind: EntityKind,
        op: OpKind,
        payload: Payload,
    ) -> Result<SendStatus, SyncError> {
        let result = match self.current_room() {
            None => Err(SyncError::Closed),
            Some(room) => match payload.to_value() {
                Ok(body) => self.dispatcher.send(&room, kind, op, body).await,
                Err(e) => Err(e.into()),
            },
        };
        if let Err(e) = &result {
            let _ = self.events.send(SyncEvent::SendFailed {
                kind,
                op,
                cause: e.to_string(),
            });
        }
        result
    }

    /// Fire-and-forget variant for engine-internal sends; failures
    /// surface as events only.
    async fn send_payload(&self, kind: EntityKind, op: OpKind, payload: Payload) {
        if let Err(e) = self.send_command(kind, op, payload).await {
            log::error!("client: failed to send {op} {kind}: {e}");
        }
    }
}

fn outbound_memo_body(memo: &Memo) -> MemoBody {
    let mut body = MemoBody::from_memo(memo);
    if let EntityId::Temp(temp) = memo.id {
        body.cache_memo_id = None;
        body.client_temp_id = Some(temp);
    }
    body
}

fn outbound_shelf_book_body(book: &ShelfBook) -> ShelfBookBody {
    let mut body = ShelfBookBody::from_shelf_book(book);
    if let EntityId::Temp(temp) = book.id {
        body.cache_user_shelf_book_id = None;
        body.client_temp_id = Some(temp);
    }
    body
}

fn delete_payload(kind: EntityKind, id: EntityId) -> Payload {
    match kind {
        EntityKind::Memo => {
            let mut body = MemoBody::default();
            match id {
                EntityId::Temp(t) => body.client_temp_id = Some(t),
                EntityId::Server(s) => body.cache_memo_id = Some(s),
            }
            Payload::Memo(body)
        }
        EntityKind::ShelfBook => {
            let mut body = ShelfBookBody::default();
            match id {
                EntityId::Temp(t) => body.client_temp_id = Some(t),
                EntityId::Server(s) => body.cache_user_shelf_book_id = Some(s),
            }
            Payload::ShelfBook(body)
        }
    }
}

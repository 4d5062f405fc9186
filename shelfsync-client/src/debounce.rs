//! Debounce scheduler for burst-prone updates (autosave while typing).
//!
//! One timer per entity. Scheduling again before the timer fires
//! replaces the stored payload and restarts the window, so only the
//! latest snapshot goes to the wire. Distinct entities debounce
//! independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use shelfsync_core::{EntityId, EntityKind, OpKind};

use crate::protocol::Payload;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// A payload whose debounce window elapsed (or was flushed early).
#[derive(Debug, Clone)]
pub struct FlushItem {
    pub kind: EntityKind,
    pub id: EntityId,
    pub op: OpKind,
    pub body: Payload,
}

struct Slot {
    // Bumped on every (re)schedule; a sleeping timer task only flushes
    // when its captured generation is still current.
    generation: u64,
    op: OpKind,
    body: Payload,
}

type Key = (EntityKind, EntityId);

/// Coalesces per-entity updates into one send per quiet period.
pub struct DebounceScheduler {
    interval: Duration,
    slots: Arc<Mutex<HashMap<Key, Slot>>>,
    out: mpsc::UnboundedSender<FlushItem>,
}

impl DebounceScheduler {
    /// Returns the scheduler and the receiver on which elapsed payloads
    /// are delivered.
    pub fn new(interval: Duration) -> (Self, mpsc::UnboundedReceiver<FlushItem>) {
        let (out, rx) = mpsc::unbounded_channel();
        (
            Self {
                interval,
                slots: Arc::new(Mutex::new(HashMap::new())),
                out,
            },
            rx,
        )
    }

    /// Store `body` for the entity and (re)start its timer. The
    /// previous payload for the same entity, if any, is discarded.
    pub fn schedule(&self, kind: EntityKind, id: EntityId, op: OpKind, body: Payload) {
        let generation = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let slot = slots.entry((kind, id)).or_insert(Slot {
                generation: 0,
                op,
                body: body.clone(),
            });
            slot.generation += 1;
            slot.op = op;
            slot.body = body;
            slot.generation
        };

        let slots = Arc::clone(&self.slots);
        let out = self.out.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let item = {
                let mut slots = slots.lock().unwrap_or_else(|e| e.into_inner());
                match slots.get(&(kind, id)) {
                    Some(slot) if slot.generation == generation => {
                        let slot = slots.remove(&(kind, id)).unwrap();
                        Some(FlushItem {
                            kind,
                            id,
                            op: slot.op,
                            body: slot.body,
                        })
                    }
                    // Rescheduled or cancelled while we slept.
                    _ => None,
                }
            };
            if let Some(item) = item {
                let _ = out.send(item);
            }
        });
    }

    /// Deliver the stored payload immediately, bypassing the timer
    /// (save-on-blur, explicit save). No-op when nothing is scheduled.
    pub fn flush_now(&self, kind: EntityKind, id: EntityId) -> bool {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.remove(&(kind, id))
        };
        match slot {
            Some(slot) => self
                .out
                .send(FlushItem {
                    kind,
                    id,
                    op: slot.op,
                    body: slot.body,
                })
                .is_ok(),
            None => false,
        }
    }

    /// Discard a scheduled payload without sending it.
    pub fn cancel(&self, kind: EntityKind, id: EntityId) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(&(kind, id)).is_some()
    }

    /// Discard everything scheduled (session teardown).
    pub fn cancel_all(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.clear();
    }

    pub fn scheduled_count(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

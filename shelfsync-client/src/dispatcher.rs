//! Outbound dispatcher: serializes commands to their channel address
//! and queues them while the connection is down.
//!
//! Ordering contract: messages queued while offline are flushed
//! strictly FIFO on reconnect, before any new caller-initiated send is
//! accepted. The flush holds the queue lock while the dispatcher is
//! promoted to online, so a racing send either lands in the queue (and
//! drains in order) or runs after the promotion.

use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};

use shelfsync_core::{EntityKind, OpKind};

use crate::error::SyncError;
use crate::protocol::{Channel, Frame, RoomId};

/// Ordered (destination, body) pairs awaiting send.
pub struct OutboundQueue {
    queue: VecDeque<(String, Value)>,
    max_size: usize,
}

impl OutboundQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max_size,
        }
    }

    /// Append; returns false when the queue is full.
    pub fn enqueue(&mut self, destination: String, body: Value) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back((destination, body));
        true
    }

    pub fn drain(&mut self) -> Vec<(String, Value)> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Whether a send was transmitted immediately or deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    Queued,
}

struct Online {
    writer: mpsc::Sender<String>,
}

/// Serializes commands for a room and owns the offline queue.
pub struct OutboundDispatcher {
    app_prefix: String,
    queue: Mutex<OutboundQueue>,
    // None while disconnected; writes of queued frames go through the
    // queue lock so the FIFO contract holds across the transition.
    online: RwLock<Option<Online>>,
}

impl OutboundDispatcher {
    pub fn new(app_prefix: impl Into<String>, queue_capacity: usize) -> Self {
        Self {
            app_prefix: app_prefix.into(),
            queue: Mutex::new(OutboundQueue::new(queue_capacity)),
            online: RwLock::new(None),
        }
    }

    /// Send a command, or queue it when the connection is not
    /// established. Queueing is not an error: delivery is deferred.
    pub async fn send(
        &self,
        room: &RoomId,
        kind: EntityKind,
        op: OpKind,
        body: Value,
    ) -> Result<SendStatus, SyncError> {
        let destination =
            Channel::new(room.clone(), op, kind).destination(&self.app_prefix);

        let mut queue = self.queue.lock().await;
        let online = self.online.read().await;
        match online.as_ref() {
            None => {
                log::warn!("dispatcher: offline, queueing {op} {kind}");
                if !queue.enqueue(destination, body) {
                    return Err(SyncError::Send("outbound queue full".to_string()));
                }
                Ok(SendStatus::Queued)
            }
            Some(conn) => {
                let writer = conn.writer.clone();
                drop(online);
                drop(queue);
                Self::transmit(&writer, destination, body).await?;
                Ok(SendStatus::Sent)
            }
        }
    }

    /// Go online: install the writer and flush the queue strictly in
    /// enqueue order. Returns the number of flushed messages.
    pub async fn attach(&self, writer: mpsc::Sender<String>) -> Result<usize, SyncError> {
        let mut queue = self.queue.lock().await;
        let pending = queue.drain();
        let flushed = pending.len();
        for (destination, body) in pending {
            Self::transmit(&writer, destination, body).await?;
        }
        *self.online.write().await = Some(Online { writer });
        if flushed > 0 {
            log::info!("dispatcher: flushed {flushed} queued messages");
        }
        Ok(flushed)
    }

    /// Go offline: subsequent sends queue instead of transmitting.
    pub async fn detach(&self) {
        *self.online.write().await = None;
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Drop any queued messages (explicit disconnect).
    pub async fn clear_queue(&self) {
        self.queue.lock().await.clear();
    }

    async fn transmit(
        writer: &mpsc::Sender<String>,
        destination: String,
        body: Value,
    ) -> Result<(), SyncError> {
        let frame = Frame::Send { destination, body };
        let text = frame.encode()?;
        writer
            .send(text)
            .await
            .map_err(|e| SyncError::Send(e.to_string()))
    }
}

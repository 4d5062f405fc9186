//! Subscription router: one logical channel per (entity-kind ×
//! operation-kind) pair, fanned out to registered sinks in
//! registration order.
//!
//! Re-subscription after a reconnect must not stack handlers: a
//! registration is keyed by label and replaced, never duplicated.
//! Messages arriving for a channel with no registration (a disconnect
//! race) are logged and dropped without touching state.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::RwLock;

use shelfsync_core::{EntityKind, OpKind};

use crate::protocol::{Channel, InboundMessage, ProtocolError, RoomId};

/// Where decoded messages are delivered.
pub type InboundSink = mpsc::UnboundedSender<InboundMessage>;

struct Registration {
    label: String,
    sink: InboundSink,
}

#[derive(Default)]
struct RouterState {
    room: Option<RoomId>,
    registrations: HashMap<(EntityKind, OpKind), Vec<Registration>>,
}

/// Dispatches inbound broadcasts to typed sinks.
pub struct SubscriptionRouter {
    state: RwLock<RouterState>,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RouterState::default()),
        }
    }

    /// Register `sink` under `label` for every (entity, operation)
    /// pair, scoped to `room`. Existing registrations with the same
    /// label are replaced. Returns the channels to subscribe on the
    /// wire, in registration order.
    pub async fn subscribe_all(
        &self,
        room: &RoomId,
        label: &str,
        sink: InboundSink,
    ) -> Vec<Channel> {
        let mut state = self.state.write().await;
        state.room = Some(room.clone());

        let mut channels = Vec::with_capacity(EntityKind::ALL.len() * OpKind::ALL.len());
        for kind in EntityKind::ALL {
            for op in OpKind::ALL {
                let entries = state.registrations.entry((kind, op)).or_default();
                entries.retain(|r| r.label != label);
                entries.push(Registration {
                    label: label.to_string(),
                    sink: sink.clone(),
                });
                channels.push(Channel::new(room.clone(), op, kind));
            }
        }
        log::debug!("router: subscribed {} channels for room {room}", channels.len());
        channels
    }

    /// Register a sink for a single (entity, operation) pair.
    pub async fn register(
        &self,
        kind: EntityKind,
        op: OpKind,
        label: &str,
        sink: InboundSink,
    ) {
        let mut state = self.state.write().await;
        let entries = state.registrations.entry((kind, op)).or_default();
        entries.retain(|r| r.label != label);
        entries.push(Registration {
            label: label.to_string(),
            sink,
        });
    }

    /// Tear down all registrations. Returns the channels to
    /// unsubscribe on the wire, if a room was active.
    pub async fn unsubscribe_all(&self) -> Vec<Channel> {
        let mut state = self.state.write().await;
        state.registrations.clear();
        let Some(room) = state.room.take() else {
            return Vec::new();
        };
        let mut channels = Vec::new();
        for kind in EntityKind::ALL {
            for op in OpKind::ALL {
                channels.push(Channel::new(room.clone(), op, kind));
            }
        }
        channels
    }

    /// Decode and deliver one inbound broadcast. Returns the number of
    /// sinks reached; a message for an unsubscribed channel or a stale
    /// room is dropped (count 0), never an error.
    pub async fn dispatch(&self, channel: &str, body: Value) -> Result<usize, ProtocolError> {
        let message = InboundMessage::decode(channel, body)?;

        let state = self.state.read().await;
        match &state.room {
            Some(room) if *room == message.channel.room => {}
            _ => {
                log::warn!("router: dropping message for inactive room on {channel}");
                return Ok(0);
            }
        }

        let Some(entries) = state
            .registrations
            .get(&(message.kind(), message.op()))
            .filter(|e| !e.is_empty())
        else {
            log::warn!("router: dropping message for unsubscribed channel {channel}");
            return Ok(0);
        };

        let mut delivered = 0;
        for entry in entries {
            if entry.sink.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Registered sink count for one pair (test/diagnostic hook).
    pub async fn handler_count(&self, kind: EntityKind, op: OpKind) -> usize {
        self.state
            .read()
            .await
            .registrations
            .get(&(kind, op))
            .map_or(0, |e| e.len())
    }
}

impl Default for SubscriptionRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sink() -> (InboundSink, mpsc::UnboundedReceiver<InboundMessage>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn test_subscribe_all_covers_every_pair() {
        let router = SubscriptionRouter::new();
        let (tx, _rx) = sink();
        let channels = router.subscribe_all(&RoomId::from(42), "engine", tx).await;

        // 2 entity kinds × 4 operations.
        assert_eq!(channels.len(), 8);
        for kind in EntityKind::ALL {
            for op in OpKind::ALL {
                assert_eq!(router.handler_count(kind, op).await, 1);
            }
        }
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_not_stacks() {
        let router = SubscriptionRouter::new();
        let room = RoomId::from(42);

        let (tx1, _rx1) = sink();
        router.subscribe_all(&room, "engine", tx1).await;
        let (tx2, mut rx2) = sink();
        router.subscribe_all(&room, "engine", tx2).await;

        assert_eq!(
            router.handler_count(EntityKind::Memo, OpKind::Create).await,
            1
        );

        // Exactly one delivery to the surviving registration.
        let delivered = router
            .dispatch("42/create/memo", json!({"cacheMemoId": 9}))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert!(rx2.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fan_out_in_registration_order() {
        let router = SubscriptionRouter::new();
        let room = RoomId::from(42);
        let (tx1, mut rx1) = sink();
        let (tx2, mut rx2) = sink();
        router.subscribe_all(&room, "first", tx1).await;
        router.subscribe_all(&room, "second", tx2).await;

        let delivered = router
            .dispatch("42/update/memo", json!({"cacheMemoId": 9, "content": "x"}))
            .await
            .unwrap();
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_message_after_unsubscribe_is_dropped() {
        let router = SubscriptionRouter::new();
        let (tx, mut rx) = sink();
        router.subscribe_all(&RoomId::from(42), "engine", tx).await;
        router.unsubscribe_all().await;

        let delivered = router
            .dispatch("42/create/memo", json!({"cacheMemoId": 9}))
            .await
            .unwrap();
        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_room_is_dropped() {
        let router = SubscriptionRouter::new();
        let (tx, _rx) = sink();
        router.subscribe_all(&RoomId::from(42), "engine", tx).await;

        let delivered = router
            .dispatch("99/create/memo", json!({"cacheMemoId": 9}))
            .await
            .unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_malformed_body_is_an_error_not_a_panic() {
        let router = SubscriptionRouter::new();
        let (tx, _rx) = sink();
        router.subscribe_all(&RoomId::from(42), "engine", tx).await;

        let result = router
            .dispatch("42/create/memo", json!({"cacheMemoId": "nine"}))
            .await;
        assert!(result.is_err());

        // Subscription health is unaffected.
        let delivered = router
            .dispatch("42/create/memo", json!({"cacheMemoId": 9}))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
    }
}

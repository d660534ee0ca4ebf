//! Process-local pub/sub for order rooms and middleman GPS streams.
//!
//! One mutex covers both indexes. Broadcast serializes the event once,
//! snapshots the room under the lock, then delivers outside it — each
//! subscriber is an unbounded channel drained by its own socket task, so a
//! slow client never blocks the fan-out. Channels whose receiver is gone are
//! pruned after delivery; empty rooms are deleted.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::models::WsEvent;

pub type EventSender = mpsc::UnboundedSender<String>;

#[derive(Default)]
struct FabricInner {
    /// order_id → (connection_id → outbound channel)
    order_rooms: HashMap<Uuid, HashMap<Uuid, EventSender>>,
    /// middleman_id → connection_id of the active GPS push stream
    middleman_streams: HashMap<Uuid, Uuid>,
}

#[derive(Default)]
pub struct EventFabric {
    inner: Mutex<FabricInner>,
}

impl EventFabric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_to_order(&self, order_id: Uuid, connection_id: Uuid, sender: EventSender) {
        let mut inner = self.inner.lock();
        inner
            .order_rooms
            .entry(order_id)
            .or_default()
            .insert(connection_id, sender);
    }

    pub fn disconnect_from_order(&self, order_id: Uuid, connection_id: Uuid) {
        let mut inner = self.inner.lock();
        if let Some(room) = inner.order_rooms.get_mut(&order_id) {
            room.remove(&connection_id);
            if room.is_empty() {
                inner.order_rooms.remove(&order_id);
            }
        }
    }

    /// Fan an event out to every subscriber of the order room.
    ///
    /// Callers invoke this only after their transaction has committed.
    pub fn broadcast(&self, order_id: Uuid, event: &WsEvent) {
        let message = match serde_json::to_string(event) {
            Ok(m) => m,
            Err(e) => {
                debug!("failed to serialize ws event: {}", e);
                return;
            }
        };

        // Snapshot the room, then deliver without holding the lock.
        let room: Vec<(Uuid, EventSender)> = {
            let inner = self.inner.lock();
            match inner.order_rooms.get(&order_id) {
                Some(room) => room
                    .iter()
                    .map(|(id, sender)| (*id, sender.clone()))
                    .collect(),
                None => return,
            }
        };

        let mut dead: Vec<Uuid> = Vec::new();
        for (connection_id, sender) in room {
            if sender.send(message.clone()).is_err() {
                dead.push(connection_id);
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.lock();
            if let Some(room) = inner.order_rooms.get_mut(&order_id) {
                for connection_id in dead {
                    room.remove(&connection_id);
                }
                if room.is_empty() {
                    inner.order_rooms.remove(&order_id);
                }
            }
        }
    }

    pub fn broadcast_all(&self, order_id: Uuid, events: &[WsEvent]) {
        for event in events {
            self.broadcast(order_id, event);
        }
    }

    pub fn register_middleman_stream(&self, middleman_id: Uuid, connection_id: Uuid) {
        let mut inner = self.inner.lock();
        inner.middleman_streams.insert(middleman_id, connection_id);
    }

    /// Removes the stream entry only if it still belongs to this connection;
    /// a reconnect that replaced the entry is left alone.
    pub fn unregister_middleman_stream(&self, middleman_id: Uuid, connection_id: Uuid) {
        let mut inner = self.inner.lock();
        if inner.middleman_streams.get(&middleman_id) == Some(&connection_id) {
            inner.middleman_streams.remove(&middleman_id);
        }
    }

    pub fn middleman_streaming(&self, middleman_id: Uuid) -> bool {
        self.inner.lock().middleman_streams.contains_key(&middleman_id)
    }

    pub fn room_size(&self, order_id: Uuid) -> usize {
        self.inner
            .lock()
            .order_rooms
            .get(&order_id)
            .map(|room| room.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, WsEvent};
    use chrono::Utc;

    fn transition_event(order_id: Uuid) -> WsEvent {
        WsEvent::FsmTransition {
            order_id,
            from: OrderStatus::Listed,
            to: OrderStatus::Negotiating,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let fabric = EventFabric::new();
        let order_id = Uuid::new_v4();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        fabric.connect_to_order(order_id, Uuid::new_v4(), tx1);
        fabric.connect_to_order(order_id, Uuid::new_v4(), tx2);

        fabric.broadcast(order_id, &transition_event(order_id));

        let first = rx1.recv().await.unwrap();
        let second = rx2.recv().await.unwrap();
        assert_eq!(first, second);
        assert!(first.contains("FSM_TRANSITION"));
    }

    #[tokio::test]
    async fn test_broadcast_is_scoped_to_one_room() {
        let fabric = EventFabric::new();
        let order_a = Uuid::new_v4();
        let order_b = Uuid::new_v4();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        fabric.connect_to_order(order_a, Uuid::new_v4(), tx_a);
        fabric.connect_to_order(order_b, Uuid::new_v4(), tx_b);

        fabric.broadcast(order_a, &transition_event(order_a));

        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_subscribers_pruned_and_room_deleted() {
        let fabric = EventFabric::new();
        let order_id = Uuid::new_v4();

        let (tx, rx) = mpsc::unbounded_channel();
        fabric.connect_to_order(order_id, Uuid::new_v4(), tx);
        assert_eq!(fabric.room_size(order_id), 1);

        drop(rx);
        fabric.broadcast(order_id, &transition_event(order_id));
        assert_eq!(fabric.room_size(order_id), 0);
    }

    #[test]
    fn test_disconnect_removes_empty_room() {
        let fabric = EventFabric::new();
        let order_id = Uuid::new_v4();
        let connection_id = Uuid::new_v4();

        let (tx, _rx) = mpsc::unbounded_channel();
        fabric.connect_to_order(order_id, connection_id, tx);
        fabric.disconnect_from_order(order_id, connection_id);
        assert_eq!(fabric.room_size(order_id), 0);
    }

    #[test]
    fn test_middleman_stream_reconnect_safe_unregister() {
        let fabric = EventFabric::new();
        let middleman_id = Uuid::new_v4();
        let old_conn = Uuid::new_v4();
        let new_conn = Uuid::new_v4();

        fabric.register_middleman_stream(middleman_id, old_conn);
        fabric.register_middleman_stream(middleman_id, new_conn);

        // Stale disconnect from the first socket must not drop the new one.
        fabric.unregister_middleman_stream(middleman_id, old_conn);
        assert!(fabric.middleman_streaming(middleman_id));

        fabric.unregister_middleman_stream(middleman_id, new_conn);
        assert!(!fabric.middleman_streaming(middleman_id));
    }
}

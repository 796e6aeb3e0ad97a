use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use beacon_types::events::CoordinatorEvent;

/// Message delivered to one subscribed socket task.
#[derive(Debug, Clone)]
pub enum BrokerMessage {
    /// Pre-serialized event JSON.
    Event(String),
    /// Ask the socket task to close with the given code.
    Close(u16),
}

struct Subscriber {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

/// Per-principal WebSocket fan-out.
///
/// One lock over the whole map; `publish` snapshots subscribers under the
/// lock and sends outside it, then takes the lock a second time to reap
/// subscribers whose channel is gone. Events are delivered in publish order
/// per socket; there is no persistence, offline principals miss events.
#[derive(Clone)]
pub struct EventBroker {
    inner: Arc<Mutex<HashMap<String, Vec<Subscriber>>>>,
}

impl EventBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a socket for a principal. The caller owns the receive side
    /// and forwards messages onto the actual WebSocket.
    pub fn connect(&self, principal_id: &str) -> (Uuid, mpsc::UnboundedReceiver<BrokerMessage>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut map = self.inner.lock().expect("broker lock poisoned");
        map.entry(principal_id.to_string())
            .or_default()
            .push(Subscriber { conn_id, tx });
        (conn_id, rx)
    }

    pub fn disconnect(&self, principal_id: &str, conn_id: Uuid) {
        let mut map = self.inner.lock().expect("broker lock poisoned");
        if let Some(subscribers) = map.get_mut(principal_id) {
            subscribers.retain(|subscriber| subscriber.conn_id != conn_id);
            if subscribers.is_empty() {
                map.remove(principal_id);
            }
        }
    }

    /// Deliver an event to every socket of one principal. Send failures mark
    /// the socket stale; a second pass under the lock removes them.
    pub fn publish(&self, principal_id: &str, event: &CoordinatorEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Failed to serialize event: {}", err);
                return;
            }
        };

        let snapshot: Vec<(Uuid, mpsc::UnboundedSender<BrokerMessage>)> = {
            let map = self.inner.lock().expect("broker lock poisoned");
            match map.get(principal_id) {
                Some(subscribers) => subscribers
                    .iter()
                    .map(|subscriber| (subscriber.conn_id, subscriber.tx.clone()))
                    .collect(),
                None => return,
            }
        };

        let mut stale: Vec<Uuid> = Vec::new();
        for (conn_id, tx) in snapshot {
            if tx.send(BrokerMessage::Event(payload.clone())).is_err() {
                stale.push(conn_id);
            }
        }

        if !stale.is_empty() {
            let mut map = self.inner.lock().expect("broker lock poisoned");
            if let Some(subscribers) = map.get_mut(principal_id) {
                subscribers.retain(|subscriber| !stale.contains(&subscriber.conn_id));
                if subscribers.is_empty() {
                    map.remove(principal_id);
                }
            }
        }
    }

    /// Close every socket and clear the map; used on shutdown.
    pub fn close_all(&self, code: u16) {
        let drained: Vec<Subscriber> = {
            let mut map = self.inner.lock().expect("broker lock poisoned");
            map.drain().flat_map(|(_, subscribers)| subscribers).collect()
        };
        for subscriber in drained {
            let _ = subscriber.tx.send(BrokerMessage::Close(code));
        }
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_types::events::CoordinatorEvent;

    #[test]
    fn publish_reaches_only_the_principal() {
        let broker = EventBroker::new();
        let (_id_a, mut rx_a) = broker.connect("principal-a");
        let (_id_b, mut rx_b) = broker.connect("principal-b");

        broker.publish("principal-a", &CoordinatorEvent::Pong);

        assert!(matches!(rx_a.try_recv(), Ok(BrokerMessage::Event(_))));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn publish_preserves_order_per_socket() {
        let broker = EventBroker::new();
        let (_id, mut rx) = broker.connect("p");

        for _ in 0..3 {
            broker.publish("p", &CoordinatorEvent::Pong);
        }
        let mut received = 0;
        while let Ok(BrokerMessage::Event(_)) = rx.try_recv() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[test]
    fn stale_sockets_are_reaped_on_publish() {
        let broker = EventBroker::new();
        let (_id, rx) = broker.connect("p");
        drop(rx);

        broker.publish("p", &CoordinatorEvent::Pong);
        // The second publish finds no subscribers at all.
        let map = broker.inner.lock().unwrap();
        assert!(!map.contains_key("p"));
    }

    #[test]
    fn disconnect_drops_empty_entries() {
        let broker = EventBroker::new();
        let (conn_id, _rx) = broker.connect("p");
        broker.disconnect("p", conn_id);
        assert!(!broker.inner.lock().unwrap().contains_key("p"));
    }

    #[test]
    fn close_all_notifies_and_clears() {
        let broker = EventBroker::new();
        let (_id, mut rx) = broker.connect("p");
        broker.close_all(1001);
        assert!(matches!(rx.try_recv(), Ok(BrokerMessage::Close(1001))));
        assert!(broker.inner.lock().unwrap().is_empty());
    }
}

//! Live event delivery: case-scoped broadcasting and system-wide
//! notifications.
//!
//! Delivery is best-effort and at-most-once. Per-subscriber send order
//! is preserved (each subscriber owns a FIFO channel); ordering across
//! subscribers is not guaranteed. A failed send drops the subscriber.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// An event delivered to case subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseEvent {
    /// Discriminator (`progress`, `stage_complete`, `heartbeat`, ...)
    pub event: String,
    pub case_id: String,
    pub payload: Value,
}

impl CaseEvent {
    pub fn new(event: impl Into<String>, case_id: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            case_id: case_id.into(),
            payload,
        }
    }

    pub fn heartbeat(case_id: impl Into<String>) -> Self {
        Self::new(
            "heartbeat",
            case_id,
            json!({ "timestamp": Utc::now().to_rfc3339() }),
        )
    }

    pub fn connected(case_id: impl Into<String>) -> Self {
        let case_id = case_id.into();
        Self::new(
            "connected",
            case_id.clone(),
            json!({
                "case_id": case_id,
                "timestamp": Utc::now().to_rfc3339(),
                "message": "Connected to case event stream",
            }),
        )
    }
}

/// Handle for one case-scoped subscription.
pub struct CaseSubscription {
    pub receiver: UnboundedReceiver<CaseEvent>,
    pub case_id: String,
    subscriber_id: u64,
    hub: Arc<EventHubInner>,
}

impl CaseSubscription {
    /// Receive the next event, if the hub is still alive.
    pub async fn recv(&mut self) -> Option<CaseEvent> {
        self.receiver.recv().await
    }
}

impl Drop for CaseSubscription {
    fn drop(&mut self) {
        let hub = self.hub.clone();
        let case_id = self.case_id.clone();
        let subscriber_id = self.subscriber_id;
        // Best-effort cleanup; the next broadcast would drop the closed
        // sender anyway.
        if let Ok(mut subscribers) = hub.case_subscribers.try_lock() {
            if let Some(list) = subscribers.get_mut(&case_id) {
                list.retain(|(id, _)| *id != subscriber_id);
            }
        };
    }
}

struct EventHubInner {
    case_subscribers: Mutex<HashMap<String, Vec<(u64, UnboundedSender<CaseEvent>)>>>,
    notification_subscribers: Mutex<Vec<(u64, UnboundedSender<Value>)>>,
    recent_notifications: Mutex<VecDeque<Value>>,
    next_id: std::sync::atomic::AtomicU64,
    replay_count: usize,
}

/// Case-scoped and system-wide event fan-out.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<EventHubInner>,
}

impl EventHub {
    pub fn new(replay_count: usize) -> Self {
        Self {
            inner: Arc::new(EventHubInner {
                case_subscribers: Mutex::new(HashMap::new()),
                notification_subscribers: Mutex::new(Vec::new()),
                recent_notifications: Mutex::new(VecDeque::new()),
                next_id: std::sync::atomic::AtomicU64::new(1),
                replay_count,
            }),
        }
    }

    fn next_id(&self) -> u64 {
        self.inner
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    /// Subscribe to one case's events. A `connected` event is delivered
    /// immediately.
    pub async fn subscribe_case(&self, case_id: &str) -> CaseSubscription {
        let (sender, receiver) = unbounded_channel();
        let subscriber_id = self.next_id();

        let _ = sender.send(CaseEvent::connected(case_id));
        self.inner
            .case_subscribers
            .lock()
            .await
            .entry(case_id.to_string())
            .or_default()
            .push((subscriber_id, sender));

        info!(case_id, subscriber_id, "case subscriber connected");
        CaseSubscription {
            receiver,
            case_id: case_id.to_string(),
            subscriber_id,
            hub: self.inner.clone(),
        }
    }

    /// Broadcast an event to a case's subscribers; failed sends drop
    /// the subscriber.
    pub async fn broadcast_case(&self, event: CaseEvent) {
        let mut subscribers = self.inner.case_subscribers.lock().await;
        let Some(list) = subscribers.get_mut(&event.case_id) else {
            return;
        };
        let before = list.len();
        list.retain(|(_, sender)| sender.send(event.clone()).is_ok());
        if list.len() < before {
            debug!(
                case_id = %event.case_id,
                dropped = before - list.len(),
                "dropped dead case subscribers"
            );
        }
    }

    /// Send a heartbeat to every subscriber of every case. Intended to
    /// be driven by a 30-second interval while connections are idle.
    pub async fn heartbeat_all(&self) {
        let mut subscribers = self.inner.case_subscribers.lock().await;
        for (case_id, list) in subscribers.iter_mut() {
            let event = CaseEvent::heartbeat(case_id.clone());
            list.retain(|(_, sender)| sender.send(event.clone()).is_ok());
        }
        subscribers.retain(|_, list| !list.is_empty());
    }

    /// Number of live subscribers for a case.
    pub async fn case_subscriber_count(&self, case_id: &str) -> usize {
        self.inner
            .case_subscribers
            .lock()
            .await
            .get(case_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Subscribe to system-wide notifications; the most recent messages
    /// are replayed on connect.
    pub async fn subscribe_notifications(&self) -> UnboundedReceiver<Value> {
        let (sender, receiver) = unbounded_channel();
        {
            let recent = self.inner.recent_notifications.lock().await;
            for message in recent.iter() {
                let _ = sender.send(message.clone());
            }
        }
        let subscriber_id = self.next_id();
        self.inner
            .notification_subscribers
            .lock()
            .await
            .push((subscriber_id, sender));
        receiver
    }

    /// Broadcast a system-wide notification, retaining it for replay.
    pub async fn notify(&self, message: Value) {
        {
            let mut recent = self.inner.recent_notifications.lock().await;
            recent.push_back(message.clone());
            while recent.len() > self.inner.replay_count {
                recent.pop_front();
            }
        }
        let mut subscribers = self.inner.notification_subscribers.lock().await;
        subscribers.retain(|(_, sender)| sender.send(message.clone()).is_ok());
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_case_scoped_delivery() {
        let hub = EventHub::default();
        let mut sub_a = hub.subscribe_case("CASE-A").await;
        let mut sub_b = hub.subscribe_case("CASE-B").await;

        // Both get their connected events first.
        assert_eq!(sub_a.recv().await.unwrap().event, "connected");
        assert_eq!(sub_b.recv().await.unwrap().event, "connected");

        hub.broadcast_case(CaseEvent::new("progress", "CASE-A", json!({"percent": 40})))
            .await;

        let event = sub_a.recv().await.unwrap();
        assert_eq!(event.event, "progress");
        assert_eq!(event.payload["percent"], 40);

        // CASE-B subscriber sees nothing beyond its connect.
        assert!(sub_b.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_per_subscriber_order_preserved() {
        let hub = EventHub::default();
        let mut sub = hub.subscribe_case("CASE-A").await;
        let _ = sub.recv().await; // connected

        for i in 0..5 {
            hub.broadcast_case(CaseEvent::new("progress", "CASE-A", json!({"i": i})))
                .await;
        }
        for i in 0..5 {
            assert_eq!(sub.recv().await.unwrap().payload["i"], i);
        }
    }

    #[tokio::test]
    async fn test_dropped_subscriber_removed_on_broadcast() {
        let hub = EventHub::default();
        {
            let _sub = hub.subscribe_case("CASE-A").await;
            assert_eq!(hub.case_subscriber_count("CASE-A").await, 1);
        }
        // Subscription dropped; the next broadcast prunes it (the Drop
        // impl may have already done so).
        hub.broadcast_case(CaseEvent::new("progress", "CASE-A", json!({})))
            .await;
        assert_eq!(hub.case_subscriber_count("CASE-A").await, 0);
    }

    #[tokio::test]
    async fn test_notification_replay_on_connect() {
        let hub = EventHub::new(3);
        for i in 0..5 {
            hub.notify(json!({"n": i})).await;
        }

        // Only the last 3 are replayed.
        let mut receiver = hub.subscribe_notifications().await;
        assert_eq!(receiver.recv().await.unwrap()["n"], 2);
        assert_eq!(receiver.recv().await.unwrap()["n"], 3);
        assert_eq!(receiver.recv().await.unwrap()["n"], 4);
        assert!(receiver.try_recv().is_err());

        // Live messages follow replay.
        hub.notify(json!({"n": 5})).await;
        assert_eq!(receiver.recv().await.unwrap()["n"], 5);
    }

    #[tokio::test]
    async fn test_heartbeat_reaches_all_case_subscribers() {
        let hub = EventHub::default();
        let mut sub = hub.subscribe_case("CASE-A").await;
        let _ = sub.recv().await; // connected

        hub.heartbeat_all().await;
        let event = sub.recv().await.unwrap();
        assert_eq!(event.event, "heartbeat");
        assert!(event.payload["timestamp"].is_string());
    }
}

//! In-process pub/sub for anomaly events.
//!
//! Publishers hand durable anomalies to the bus; each subscriber owns a
//! bounded queue and a filter. A subscriber whose queue saturates is
//! disconnected with reason `slow_consumer` so one stalled client never
//! affects the others. Control frames (heartbeat, stats, connected,
//! subscribed, pong) share the same envelope as anomaly payloads.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{Anomaly, AnomalyKind};

/// Per-subscriber queue capacity; overflow disconnects the subscriber.
pub const SUBSCRIBER_QUEUE_CAP: usize = 256;

/// Subscription filter; every present field must match for delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    pub line: Option<String>,
    pub station: Option<String>,
    pub severity_min: Option<f64>,
    pub kinds: Option<Vec<AnomalyKind>>,
}

impl SubscriptionFilter {
    pub fn matches(&self, anomaly: &Anomaly) -> bool {
        if let Some(line) = &self.line {
            if anomaly.line.as_deref() != Some(line.as_str()) {
                return false;
            }
        }
        if let Some(station) = &self.station {
            if anomaly.station_id.as_deref() != Some(station.as_str()) {
                return false;
            }
        }
        if let Some(min) = self.severity_min {
            if anomaly.severity < min {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&anomaly.kind) {
                return false;
            }
        }
        true
    }
}

/// The wire envelope shared by data and control frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl BusMessage {
    pub fn new(kind: &str, data: Option<serde_json::Value>) -> Self {
        Self {
            kind: kind.to_string(),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn anomaly(anomaly: &Anomaly) -> Self {
        Self::new("anomaly", serde_json::to_value(anomaly).ok())
    }
}

/// Why a subscriber was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    SlowConsumer,
    Shutdown,
    ClientClosed,
}

struct Subscriber {
    filter: SubscriptionFilter,
    sender: mpsc::Sender<BusMessage>,
}

/// In-process anomaly pub/sub with bounded per-subscriber queues.
pub struct EventBus {
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    max_connections: usize,
}

/// Handle returned to a new subscriber.
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<BusMessage>,
}

impl EventBus {
    pub fn new(max_connections: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            max_connections,
        })
    }

    /// Register a subscriber; `None` when the connection cap is reached.
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Option<Subscription> {
        let mut subscribers = self.subscribers.write();
        if subscribers.len() >= self.max_connections {
            warn!(cap = self.max_connections, "subscriber cap reached");
            return None;
        }
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_CAP);
        subscribers.insert(id, Subscriber { filter, sender });
        debug!(subscriber = %id, "subscriber connected");
        Some(Subscription { id, receiver })
    }

    /// Replace a subscriber's filter.
    pub fn update_filter(&self, id: Uuid, filter: SubscriptionFilter) -> bool {
        let mut subscribers = self.subscribers.write();
        match subscribers.get_mut(&id) {
            Some(subscriber) => {
                subscriber.filter = filter;
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe(&self, id: Uuid, reason: DisconnectReason) {
        if self.subscribers.write().remove(&id).is_some() {
            info!(subscriber = %id, ?reason, "subscriber removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Publish a durable anomaly to all matching subscribers. Returns the
    /// ids of slow consumers that were disconnected.
    pub fn publish_anomaly(&self, anomaly: &Anomaly) -> Vec<Uuid> {
        let message = BusMessage::anomaly(anomaly);
        let mut slow = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (id, subscriber) in subscribers.iter() {
                if !subscriber.filter.matches(anomaly) {
                    continue;
                }
                if let Err(mpsc::error::TrySendError::Full(_)) =
                    subscriber.sender.try_send(message.clone())
                {
                    slow.push(*id);
                }
            }
        }
        for id in &slow {
            warn!(subscriber = %id, "queue saturated, disconnecting slow consumer");
            self.unsubscribe(*id, DisconnectReason::SlowConsumer);
        }
        slow
    }

    /// Broadcast a control frame to every subscriber, regardless of
    /// filter. Slow consumers are disconnected exactly as for data.
    pub fn broadcast_control(&self, message: &BusMessage) -> Vec<Uuid> {
        let mut slow = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (id, subscriber) in subscribers.iter() {
                if let Err(mpsc::error::TrySendError::Full(_)) =
                    subscriber.sender.try_send(message.clone())
                {
                    slow.push(*id);
                }
            }
        }
        for id in &slow {
            self.unsubscribe(*id, DisconnectReason::SlowConsumer);
        }
        slow
    }

    /// Drop all subscribers, used on graceful shutdown. A final
    /// `shutdown` frame is offered to each queue (best effort) so the
    /// socket layer can close with the right reason.
    pub fn close_all(&self) {
        let mut subscribers = self.subscribers.write();
        let count = subscribers.len();
        let goodbye = BusMessage::new("shutdown", None);
        for subscriber in subscribers.values() {
            let _ = subscriber.sender.try_send(goodbye.clone());
        }
        subscribers.clear();
        if count > 0 {
            info!(count, "subscribers closed on shutdown");
        }
    }
}

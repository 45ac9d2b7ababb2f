//! Service Events
//!
//! Device announcements, telemetry and command traffic travel between
//! services as events. The runtime routes on `event_type` only; payloads are
//! opaque JSON.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use wildmatch::WildMatch;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Slash separated kind, e.g. `"device/telemetry"`
    pub event_type: String,
    /// Who produced it: a service id or an external origin
    pub source: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Glob match against a subscription pattern: `"device/*"` takes every
    /// device event, `"*"` takes everything.
    pub fn matches(&self, pattern: &str) -> bool {
        WildMatch::new(pattern).matches(&self.event_type)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key)?.as_str()
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.data.get(key)?.as_i64()
    }

    /// Deserialize the payload into a typed message
    pub fn parse_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// Sending side of the manager's event bus. Cheap to clone; background tasks
/// each keep their own.
#[derive(Clone)]
pub struct EventPublisher {
    bus: broadcast::Sender<Event>,
}

impl EventPublisher {
    pub fn new(bus: broadcast::Sender<Event>) -> Self {
        Self { bus }
    }

    /// Standalone bus, for wiring components without a manager
    pub fn channel(capacity: usize) -> Self {
        Self::new(broadcast::channel(capacity).0)
    }

    /// Returns how many receivers saw the event. Zero means it was dropped.
    pub fn publish(&self, event: Event) -> usize {
        match self.bus.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                tracing::trace!(event_type = %event.event_type, "Event dropped, no subscribers");
                0
            }
        }
    }

    pub fn emit(&self, event_type: impl Into<String>, source: impl Into<String>, data: serde_json::Value) -> usize {
        self.publish(Event::new(event_type, source, data))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_subscription_patterns() {
        let event = Event::new("device/telemetry", "mqtt", json!({}));

        assert!(event.matches("device/telemetry"));
        assert!(event.matches("device/*"));
        assert!(event.matches("*"));
        assert!(!event.matches("device/command"));
        assert!(!event.matches("bus/*"));
    }

    #[test]
    fn test_payload_access() {
        #[derive(Deserialize)]
        struct Reading {
            device_id: String,
            value: i64,
        }

        let event = Event::new("device/telemetry", "mqtt", json!({"device_id": "dev1", "value": 75}));

        assert_eq!(event.get_str("device_id"), Some("dev1"));
        assert_eq!(event.get_i64("value"), Some(75));
        assert_eq!(event.get_i64("attribute"), None);

        let reading: Reading = event.parse_data().unwrap();
        assert_eq!((reading.device_id.as_str(), reading.value), ("dev1", 75));
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let publisher = EventPublisher::channel(8);
        assert_eq!(publisher.emit("bus/device-registered", "bus/observer", json!({})), 0);

        let mut rx = publisher.subscribe();
        let delivered = publisher.emit(
            "bus/device-registered",
            "bus/observer",
            json!({"address": "169.254.20.84"}),
        );
        assert_eq!(delivered, 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.source, "bus/observer");
        assert_eq!(event.get_str("address"), Some("169.254.20.84"));
    }
}

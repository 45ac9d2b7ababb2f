//! Command service: the event-bus face of the reconciliation tracker
//!
//! - `device/command` `{device_id, attribute?, value}` issues a command
//! - `device/telemetry` `{device_id, attribute?, value}` reports a reading
//! - `device/command-accepted` and `device/command-resolved` are published
//!   back, keyed by the command id
//!
//! `attribute` defaults to `"output"`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buspoller_service::{Event, Service, ServiceContext, ServiceError, ServiceResult, ServiceSpec};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::CommandConfig;
use crate::reconcile::{CommandStatus, PendingCommand, ReconciliationTracker};

pub const COMMAND_SERVICE_ID: &str = "commands";

pub const EVENT_COMMAND: &str = "device/command";
pub const EVENT_TELEMETRY: &str = "device/telemetry";
pub const EVENT_COMMAND_ACCEPTED: &str = "device/command-accepted";
pub const EVENT_COMMAND_RESOLVED: &str = "device/command-resolved";

pub const DEFAULT_ATTRIBUTE: &str = "output";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CommandKey {
    pub device_id: String,
    pub attribute: String,
}

impl CommandKey {
    pub fn new(device_id: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            attribute: attribute.into(),
        }
    }
}

/// Commanded or reported attribute value. Numbers compare by value, so a
/// reading of `75.0` confirms a command for `75`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandValue(pub serde_json::Value);

impl PartialEq for CommandValue {
    fn eq(&self, other: &Self) -> bool {
        match (self.0.as_f64(), other.0.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self.0 == other.0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeviceValue {
    device_id: String,
    #[serde(default = "default_attribute")]
    attribute: String,
    value: CommandValue,
}

fn default_attribute() -> String {
    DEFAULT_ATTRIBUTE.to_string()
}

pub type CommandTracker = ReconciliationTracker<CommandKey, CommandValue>;

pub struct CommandService {
    tracker: Arc<Mutex<CommandTracker>>,
    sweep_interval: Duration,
}

impl CommandService {
    pub fn new(config: &CommandConfig) -> Self {
        Self {
            tracker: Arc::new(Mutex::new(ReconciliationTracker::new(config.convergence_window()))),
            sweep_interval: config.sweep_interval(),
        }
    }

    /// Shared tracker, for status queries from outside the service
    pub fn tracker(&self) -> Arc<Mutex<CommandTracker>> {
        Arc::clone(&self.tracker)
    }

    fn parse(event: &Event) -> ServiceResult<DeviceValue> {
        event.parse_data().map_err(|e| ServiceError::InvalidEvent {
            event_type: event.event_type.clone(),
            reason: e.to_string(),
        })
    }

    fn publish_resolution(ctx: &ServiceContext, command: &PendingCommand<CommandKey, CommandValue>) {
        match command.status {
            CommandStatus::Achieved => tracing::info!(
                device_id = %command.key.device_id,
                attribute = %command.key.attribute,
                command_id = %command.command_id,
                "Command achieved"
            ),
            _ => tracing::warn!(
                device_id = %command.key.device_id,
                attribute = %command.key.attribute,
                command_id = %command.command_id,
                "Command timed out"
            ),
        }

        ctx.emit(
            EVENT_COMMAND_RESOLVED,
            json!({
                "device_id": command.key.device_id,
                "attribute": command.key.attribute,
                "command_id": command.command_id,
                "status": command.status,
                "target": command.target,
            }),
        );
    }
}

#[async_trait]
impl Service for CommandService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new(COMMAND_SERVICE_ID, "Command Reconciliation")
            .subscribe(EVENT_COMMAND)
            .subscribe(EVENT_TELEMETRY)
            .tick_every(self.sweep_interval)
    }

    async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        tracing::info!(
            window_secs = self.tracker.lock().window().as_secs(),
            "Command service started"
        );
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        let pending = self.tracker.lock().pending_count();
        if pending > 0 {
            tracing::info!(pending, "Command service stopped with unresolved commands");
        }
        Ok(())
    }

    async fn on_event(&mut self, ctx: &ServiceContext, event: Event) -> ServiceResult<()> {
        let DeviceValue {
            device_id,
            attribute,
            value,
        } = Self::parse(&event)?;
        let key = CommandKey::new(device_id, attribute);

        match event.event_type.as_str() {
            EVENT_COMMAND => {
                let command = self.tracker.lock().issue(key, value);
                tracing::debug!(
                    device_id = %command.key.device_id,
                    attribute = %command.key.attribute,
                    command_id = %command.command_id,
                    "Command issued"
                );
                ctx.emit(
                    EVENT_COMMAND_ACCEPTED,
                    json!({
                        "device_id": command.key.device_id,
                        "attribute": command.key.attribute,
                        "command_id": command.command_id,
                        "target": command.target,
                    }),
                );
            }
            EVENT_TELEMETRY => {
                let resolved = self.tracker.lock().observe(&key, &value);
                if let Some(command) = resolved {
                    Self::publish_resolution(ctx, &command);
                }
            }
            other => tracing::trace!(event_type = other, "Ignoring event"),
        }
        Ok(())
    }

    async fn on_tick(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        let expired = self.tracker.lock().sweep();
        for command in &expired {
            Self::publish_resolution(ctx, command);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use buspoller_service::ServiceManager;
    use tokio::sync::broadcast;

    use super::*;

    async fn next_of(events: &mut broadcast::Receiver<Event>, event_type: &str) -> Event {
        loop {
            let event = events.recv().await.unwrap();
            if event.event_type == event_type {
                return event;
            }
        }
    }

    #[test]
    fn test_numeric_values_compare_by_value() {
        assert_eq!(CommandValue(json!(75)), CommandValue(json!(75.0)));
        assert_ne!(CommandValue(json!(75)), CommandValue(json!(40)));
        assert_eq!(CommandValue(json!("on")), CommandValue(json!("on")));
        assert_ne!(CommandValue(json!("75")), CommandValue(json!(75)));
    }

    #[tokio::test]
    async fn test_telemetry_confirms_command() {
        let manager = ServiceManager::new();
        let mut events = manager.event_publisher().subscribe();
        let service = CommandService::new(&CommandConfig::default());
        let tracker = service.tracker();
        let handle = manager.spawn(service).await.unwrap();
        handle.request_state().await.unwrap();

        manager.publish_event(Event::new(EVENT_COMMAND, "api", json!({"device_id": "dev1", "value": 75})));
        let accepted = next_of(&mut events, EVENT_COMMAND_ACCEPTED).await;
        let command_id = accepted.get_str("command_id").unwrap().to_string();

        manager.publish_event(Event::new(EVENT_TELEMETRY, "mqtt", json!({"device_id": "dev1", "value": 40})));
        manager.publish_event(Event::new(EVENT_TELEMETRY, "mqtt", json!({"device_id": "dev1", "value": 75})));

        let resolved = next_of(&mut events, EVENT_COMMAND_RESOLVED).await;
        assert_eq!(resolved.get_str("status"), Some("achieved"));
        assert_eq!(resolved.get_str("command_id"), Some(command_id.as_str()));
        assert_eq!(resolved.get_str("attribute"), Some(DEFAULT_ATTRIBUTE));
        assert_eq!(resolved.get_i64("target"), Some(75));

        let key = CommandKey::new("dev1", DEFAULT_ATTRIBUTE);
        assert_eq!(tracker.lock().status(&key), Some(CommandStatus::Achieved));

        manager.shutdown_all().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out_on_sweep() {
        let manager = ServiceManager::new();
        let mut events = manager.event_publisher().subscribe();
        let service = CommandService::new(&CommandConfig::default());
        let tracker = service.tracker();
        let handle = manager.spawn(service).await.unwrap();
        handle.request_state().await.unwrap();

        manager.publish_event(Event::new(
            EVENT_COMMAND,
            "api",
            json!({"device_id": "dev1", "attribute": "setpoint", "value": 21}),
        ));
        next_of(&mut events, EVENT_COMMAND_ACCEPTED).await;

        tokio::time::sleep(Duration::from_secs(32)).await;
        let resolved = next_of(&mut events, EVENT_COMMAND_RESOLVED).await;
        assert_eq!(resolved.get_str("status"), Some("timed_out"));
        assert_eq!(resolved.get_str("attribute"), Some("setpoint"));

        // A late matching reading changes nothing.
        manager.publish_event(Event::new(
            EVENT_TELEMETRY,
            "mqtt",
            json!({"device_id": "dev1", "attribute": "setpoint", "value": 21}),
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let key = CommandKey::new("dev1", "setpoint");
        assert_eq!(tracker.lock().status(&key), Some(CommandStatus::TimedOut));

        manager.shutdown_all().await.unwrap();
    }

    #[test]
    fn test_malformed_event_rejected() {
        let service = CommandService::new(&CommandConfig::default());
        let event = Event::new(EVENT_COMMAND, "api", json!({"value": 1}));
        assert!(matches!(
            CommandService::parse(&event),
            Err(ServiceError::InvalidEvent { .. })
        ));
        assert_eq!(service.tracker().lock().pending_count(), 0);
    }
}

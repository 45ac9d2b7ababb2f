//! Line Observer
//!
//! Passively watches the link. Every inbound frame drives the response
//! signal; announcement frames are also offered to the device registry.
//! Frames we transmitted ourselves are ignored.

use std::sync::Arc;

use buspoller_service::{EventPublisher, StopSignal};
use chrono::Utc;
use serde_json::json;

use crate::device::{LinkAddress, SerialNumber};
use crate::error::LinkError;
use crate::frame::Announcement;
use crate::link::{CapturedFrame, Direction, LineEvent, LinkRx};
use crate::registry::{DeviceRegistry, Registration};
use crate::signal::ResponseSignal;

pub const EVENT_DEVICE_REGISTERED: &str = "bus/device-registered";
pub const EVENT_DUPLICATE_ADDRESS: &str = "bus/duplicate-address";

const EVENT_SOURCE: &str = "bus/observer";

pub struct LineObserver {
    registry: Arc<dyn DeviceRegistry>,
    signal: ResponseSignal,
    publisher: Option<EventPublisher>,
}

impl LineObserver {
    pub fn new(registry: Arc<dyn DeviceRegistry>, signal: ResponseSignal) -> Self {
        Self {
            registry,
            signal,
            publisher: None,
        }
    }

    /// Publish registrations and duplicate claims as service events
    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Observe `rx` until the link closes or `stop` fires
    pub async fn run<R: LinkRx>(self, mut rx: R, mut stop: StopSignal) {
        tracing::info!("Line observer started");

        loop {
            let next = tokio::select! {
                next = rx.next_event() => next,
                _ = stop.stopped() => break,
            };

            match next {
                Ok(event) => {
                    self.handle_event(event);
                }
                Err(LinkError::Closed) => {
                    tracing::warn!("Link closed, line observer exiting");
                    break;
                }
                // The link paces its own retries.
                Err(e) => tracing::warn!("Link read error: {}", e),
            }
        }

        tracing::info!("Line observer stopped");
    }

    /// Apply one line event. Returns the registry outcome when the event
    /// carried an announcement.
    pub fn handle_event(&self, event: LineEvent) -> Option<Registration> {
        match event {
            LineEvent::FrameStarted => {
                self.signal.frame_started();
                None
            }
            LineEvent::Frame(CapturedFrame {
                direction: Direction::Outgoing,
                bytes,
            }) => {
                tracing::trace!(len = bytes.len(), "Ignoring our own frame");
                None
            }
            LineEvent::Frame(CapturedFrame {
                direction: Direction::Inbound,
                bytes,
            }) => {
                self.signal.frame_ended();
                let announcement = Announcement::parse(&bytes)?;
                Some(self.register(announcement))
            }
        }
    }

    fn register(&self, announcement: Announcement) -> Registration {
        let Announcement { address, serial } = announcement;
        let registration = self.registry.register(address, serial, Utc::now());

        match &registration {
            Registration::New(device) => {
                tracing::info!(
                    address = %address,
                    serial = %serial,
                    devices = self.registry.len(),
                    "Device registered"
                );
                self.emit(EVENT_DEVICE_REGISTERED, address, serial, None, device.duplicate);
            }
            Registration::Known => {
                tracing::trace!(address = %address, "Repeat announcement");
            }
            Registration::Duplicate {
                existing,
                newly_flagged: true,
            } => {
                tracing::warn!(
                    address = %address,
                    existing = %existing,
                    claimant = %serial,
                    "Duplicate link address claimed"
                );
                self.emit(EVENT_DUPLICATE_ADDRESS, address, *existing, Some(serial), true);
            }
            Registration::Duplicate { .. } => {
                tracing::debug!(address = %address, claimant = %serial, "Duplicate claim repeated");
            }
            Registration::Full => {
                tracing::warn!(address = %address, serial = %serial, "Device registry full, announcement dropped");
            }
        }

        registration
    }

    fn emit(
        &self,
        event_type: &str,
        address: LinkAddress,
        serial: SerialNumber,
        claimant: Option<SerialNumber>,
        duplicate: bool,
    ) {
        if let Some(publisher) = &self.publisher {
            let mut data = json!({
                "address": address,
                "serial": serial,
                "duplicate": duplicate,
            });
            if let Some(claimant) = claimant {
                data["claimant"] = json!(claimant);
            }
            publisher.emit(event_type, EVENT_SOURCE, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use buspoller_service::stop_pair;

    use super::*;
    use crate::link::memory_link;
    use crate::registry::MemoryRegistry;

    fn announcement(high: u8, low: u8, serial: &[u8; 18]) -> Vec<u8> {
        Announcement {
            address: LinkAddress::new(high, low),
            serial: SerialNumber(*serial),
        }
        .to_frame(Ipv4Addr::new(169, 254, 255, 255), 30000)
    }

    fn observer() -> (LineObserver, Arc<MemoryRegistry>, ResponseSignal) {
        let registry = Arc::new(MemoryRegistry::new());
        let signal = ResponseSignal::new();
        let observer = LineObserver::new(registry.clone(), signal.clone());
        (observer, registry, signal)
    }

    #[test]
    fn test_announcement_registers_device() {
        let (observer, registry, _) = observer();

        let outcome = observer.handle_event(LineEvent::inbound(announcement(20, 84, b"SN0000000000000001")));

        assert!(matches!(outcome, Some(Registration::New(_))));
        let device = registry.get(LinkAddress::new(20, 84)).unwrap();
        assert_eq!(device.serial.to_string(), "SN0000000000000001");
        assert!(!device.duplicate);
    }

    #[test]
    fn test_conflicting_announcement_flags_duplicate() {
        let (observer, registry, _) = observer();

        observer.handle_event(LineEvent::inbound(announcement(20, 84, b"SN0000000000000001")));
        let outcome = observer.handle_event(LineEvent::inbound(announcement(20, 84, b"SN0000000000000002")));

        assert!(matches!(
            outcome,
            Some(Registration::Duplicate {
                newly_flagged: true,
                ..
            })
        ));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(LinkAddress::new(20, 84)).unwrap().duplicate);
    }

    #[test]
    fn test_malformed_frames_only_mark_activity() {
        let (observer, registry, signal) = observer();
        signal.begin(LinkAddress::new(20, 84));

        let mut frame = announcement(20, 84, b"SN0000000000000001");
        frame.truncate(59);
        observer.handle_event(LineEvent::FrameStarted);
        assert!(observer.handle_event(LineEvent::inbound(frame)).is_none());

        assert!(registry.is_empty());
        let state = signal.state();
        assert!(state.response_started && state.response_ended);
    }

    #[test]
    fn test_outgoing_frames_ignored() {
        let (observer, registry, signal) = observer();
        signal.begin(LinkAddress::new(20, 84));

        observer.handle_event(LineEvent::Frame(CapturedFrame {
            direction: Direction::Outgoing,
            bytes: announcement(1, 1, b"SN0000000000000009").into(),
        }));

        assert!(registry.is_empty());
        assert!(!signal.state().response_ended);
    }

    #[tokio::test]
    async fn test_run_publishes_and_exits_on_close() {
        let publisher = EventPublisher::channel(16);
        let mut events = publisher.subscribe();

        let (observer, registry, _) = observer();
        let observer = observer.with_publisher(publisher);
        let (_link_tx, rx, mut sim) = memory_link();

        sim.reply(announcement(20, 84, b"SN0000000000000001"));
        sim.reply(announcement(20, 84, b"SN0000000000000002"));
        sim.echo(announcement(1, 1, b"SN0000000000000009"));
        sim.close();

        observer.run(rx, StopSignal::never()).await;

        // The echoed announcement is ours and registers nothing.
        assert_eq!(registry.len(), 1);
        let registered = events.recv().await.unwrap();
        assert_eq!(registered.event_type, EVENT_DEVICE_REGISTERED);
        assert_eq!(registered.get_str("address"), Some("169.254.20.84"));
        let duplicate = events.recv().await.unwrap();
        assert_eq!(duplicate.event_type, EVENT_DUPLICATE_ADDRESS);
        assert_eq!(duplicate.get_str("claimant"), Some("SN0000000000000002"));
    }

    #[tokio::test]
    async fn test_read_errors_do_not_stop_observer() {
        let (observer, registry, _) = observer();
        let (_link_tx, rx, sim) = memory_link();
        let (trigger, stop) = stop_pair();

        sim.read_error(std::io::ErrorKind::Other);
        sim.reply(announcement(20, 84, b"SN0000000000000001"));

        let task = tokio::spawn(observer.run(rx, stop));
        while registry.is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.len(), 1);

        trigger.trigger();
        task.await.unwrap();
    }
}

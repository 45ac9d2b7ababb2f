//! Device Registry
//!
//! In-memory roster of bus participants keyed by link address. Entries are
//! appended in discovery order and never removed within a run; the only
//! mutation after insertion is the duplicate flag and `last_seen`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::device::{Device, LinkAddress, SerialNumber};

/// Roster capacity of the reference poller, and the most a u8 count can
/// describe comfortably within one datagram
pub const MAX_DEVICES: usize = 64;

/// Result of offering an announcement to the registry
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// First announcement for this address; the device was inserted
    New(Device),
    /// Repeat announcement from the registered device
    Known,
    /// A different serial claims a registered address. `newly_flagged` is
    /// true only for the claim that set the flag.
    Duplicate {
        existing: SerialNumber,
        newly_flagged: bool,
    },
    /// The roster is at capacity; the announcement was dropped
    Full,
}

/// Storage for the device roster.
///
/// The observer is the only writer; the broadcaster and status readers take
/// snapshots. Implementations must keep registration order stable.
pub trait DeviceRegistry: Send + Sync + 'static {
    fn register(&self, address: LinkAddress, serial: SerialNumber, now: DateTime<Utc>) -> Registration;

    /// Consistent copy of the roster in registration order
    fn snapshot(&self) -> Vec<Device>;

    fn get(&self, address: LinkAddress) -> Option<Device>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lock-protected in-memory registry
#[derive(Debug)]
pub struct MemoryRegistry {
    devices: RwLock<Vec<Device>>,
    capacity: usize,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::with_capacity(MAX_DEVICES)
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            devices: RwLock::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }
}

impl DeviceRegistry for MemoryRegistry {
    fn register(&self, address: LinkAddress, serial: SerialNumber, now: DateTime<Utc>) -> Registration {
        let mut devices = self.devices.write();

        if let Some(device) = devices.iter_mut().find(|d| d.link_address == address) {
            device.last_seen = now;
            if device.serial == serial {
                return Registration::Known;
            }
            let newly_flagged = !device.duplicate;
            device.duplicate = true;
            return Registration::Duplicate {
                existing: device.serial,
                newly_flagged,
            };
        }

        if devices.len() >= self.capacity {
            return Registration::Full;
        }

        let device = Device {
            link_address: address,
            serial,
            duplicate: false,
            registered_at: now,
            last_seen: now,
        };
        devices.push(device.clone());
        Registration::New(device)
    }

    fn snapshot(&self) -> Vec<Device> {
        self.devices.read().clone()
    }

    fn get(&self, address: LinkAddress) -> Option<Device> {
        self.devices
            .read()
            .iter()
            .find(|d| d.link_address == address)
            .cloned()
    }

    fn len(&self) -> usize {
        self.devices.read().len()
    }
}

//! Topology message: the roster and time-sync broadcast that opens each
//! poll cycle
//!
//! ```text
//! 0..4   sender seconds (LE)
//! 4..8   sender nanoseconds (LE)
//! 8..10  command port (LE)
//! 10     device count
//! 11     format version
//! 12..   count * 22-byte entries: low, high, duplicate, serial[18], reserved
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::device::{Device, LinkAddress, SERIAL_LEN, SerialNumber};

pub const FORMAT_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 12;
pub const ENTRY_LEN: usize = 22;
/// The roster count is a single byte
pub const MAX_ENTRIES: usize = u8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyEntry {
    pub link_address: LinkAddress,
    pub duplicate: bool,
    pub serial: SerialNumber,
}

impl From<&Device> for TopologyEntry {
    fn from(device: &Device) -> Self {
        Self {
            link_address: device.link_address,
            duplicate: device.duplicate,
            serial: device.serial,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyMessage {
    pub sent_at_seconds: u32,
    pub sent_at_nanos: u32,
    pub command_port: u16,
    pub format_version: u8,
    pub entries: Vec<TopologyEntry>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Topology message truncated: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
}

impl TopologyMessage {
    /// Build from one registry snapshot. The count field is a single byte,
    /// so at most 255 entries are carried.
    pub fn from_snapshot(devices: &[Device], sent_at: DateTime<Utc>, command_port: u16) -> Self {
        Self {
            // Seconds wrap in 2106; receivers only use them for relative sync.
            sent_at_seconds: sent_at.timestamp() as u32,
            sent_at_nanos: sent_at.timestamp_subsec_nanos(),
            command_port,
            format_version: FORMAT_VERSION,
            entries: devices
                .iter()
                .take(MAX_ENTRIES)
                .map(TopologyEntry::from)
                .collect(),
        }
    }

    pub fn device_count(&self) -> u8 {
        u8::try_from(self.entries.len()).unwrap_or(u8::MAX)
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + usize::from(self.device_count()) * ENTRY_LEN
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(self.sent_at_seconds);
        buf.put_u32_le(self.sent_at_nanos);
        buf.put_u16_le(self.command_port);
        buf.put_u8(self.device_count());
        buf.put_u8(self.format_version);

        for entry in self.entries.iter().take(usize::from(self.device_count())) {
            buf.put_u8(entry.link_address.low);
            buf.put_u8(entry.link_address.high);
            buf.put_u8(u8::from(entry.duplicate));
            buf.put_slice(entry.serial.as_bytes());
            buf.put_u8(0);
        }
        buf.freeze()
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, TopologyError> {
        let actual = bytes.len();
        if actual < HEADER_LEN {
            return Err(TopologyError::Truncated {
                needed: HEADER_LEN,
                actual,
            });
        }

        let sent_at_seconds = bytes.get_u32_le();
        let sent_at_nanos = bytes.get_u32_le();
        let command_port = bytes.get_u16_le();
        let count = usize::from(bytes.get_u8());
        let format_version = bytes.get_u8();

        let needed = HEADER_LEN + count * ENTRY_LEN;
        if actual < needed {
            return Err(TopologyError::Truncated { needed, actual });
        }

        let entries = (0..count)
            .map(|_| {
                let low = bytes.get_u8();
                let high = bytes.get_u8();
                let duplicate = bytes.get_u8() != 0;
                let mut serial = [0u8; SERIAL_LEN];
                bytes.copy_to_slice(&mut serial);
                bytes.advance(1);
                TopologyEntry {
                    link_address: LinkAddress::new(high, low),
                    duplicate,
                    serial: SerialNumber(serial),
                }
            })
            .collect();

        Ok(Self {
            sent_at_seconds,
            sent_at_nanos,
            command_port,
            format_version,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn device(high: u8, low: u8, serial: &[u8; SERIAL_LEN], duplicate: bool) -> Device {
        let now = Utc::now();
        Device {
            link_address: LinkAddress::new(high, low),
            serial: SerialNumber(*serial),
            duplicate,
            registered_at: now,
            last_seen: now,
        }
    }

    #[test]
    fn test_header_layout() {
        let sent_at = Utc.timestamp_opt(0x0102_0304, 0x0A0B_0C0D).unwrap();
        let message = TopologyMessage::from_snapshot(&[], sent_at, 1883);
        let bytes = message.encode();

        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[4..8], &[0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(&bytes[8..10], &[0x5B, 0x07]);
        assert_eq!(bytes[10], 0);
        assert_eq!(bytes[11], FORMAT_VERSION);
    }

    #[test]
    fn test_entry_layout_and_round_trip() {
        let devices = vec![
            device(20, 84, b"SN0000000000000001", false),
            device(20, 85, b"SN0000000000000002", true),
        ];
        let message = TopologyMessage::from_snapshot(&devices, Utc::now(), 1883);
        let bytes = message.encode();

        assert_eq!(bytes.len(), HEADER_LEN + 2 * ENTRY_LEN);
        assert_eq!(bytes[10], 2);
        let second = &bytes[HEADER_LEN + ENTRY_LEN..];
        assert_eq!(&second[..3], &[85, 20, 1]);
        assert_eq!(&second[3..21], b"SN0000000000000002");
        assert_eq!(second[21], 0);

        let decoded = TopologyMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.device_count(), 2);
    }

    #[test]
    fn test_decode_rejects_short_roster() {
        let devices = vec![device(1, 2, b"SN0000000000000009", false)];
        let bytes = TopologyMessage::from_snapshot(&devices, Utc::now(), 1883).encode();

        assert_eq!(
            TopologyMessage::decode(&bytes[..bytes.len() - 1]),
            Err(TopologyError::Truncated {
                needed: HEADER_LEN + ENTRY_LEN,
                actual: HEADER_LEN + ENTRY_LEN - 1,
            })
        );
        assert!(TopologyMessage::decode(&bytes[..5]).is_err());
    }
}

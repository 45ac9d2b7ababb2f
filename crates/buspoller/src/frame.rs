//! Fixed-layout bus frames: device self-announcements and addressed polls
//!
//! An announcement is captured as a whole IPv4/UDP datagram off the line:
//! 20 bytes IPv4 header, 8 bytes UDP header, 32 bytes payload. All offsets
//! below are relative to the start of that captured frame.

use std::net::Ipv4Addr;

use crate::device::{LINK_PREFIX, LinkAddress, SERIAL_LEN, SerialNumber};
use crate::link::datagram::{self, UDP_PAYLOAD_OFFSET};

pub const ANNOUNCE_FRAME_LEN: usize = 60;
pub const ANNOUNCE_MAGIC: u8 = 0x55;

const MAGIC_OFFSET: usize = 28;
const ADDRESS_LOW_OFFSET: usize = 29;
const ADDRESS_HIGH_OFFSET: usize = 30;
const SERIAL_OFFSET: usize = 32;

const ANNOUNCE_PAYLOAD_LEN: usize = ANNOUNCE_FRAME_LEN - UDP_PAYLOAD_OFFSET;

/// A device declaring its link address and serial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    pub address: LinkAddress,
    pub serial: SerialNumber,
}

impl Announcement {
    /// Decode a captured frame. Anything that is not exactly an announcement
    /// yields `None`.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let frame: &[u8; ANNOUNCE_FRAME_LEN] = frame.try_into().ok()?;
        if frame[MAGIC_OFFSET] != ANNOUNCE_MAGIC {
            return None;
        }

        let mut serial = [0u8; SERIAL_LEN];
        serial.copy_from_slice(&frame[SERIAL_OFFSET..SERIAL_OFFSET + SERIAL_LEN]);

        Some(Self {
            address: LinkAddress::new(frame[ADDRESS_HIGH_OFFSET], frame[ADDRESS_LOW_OFFSET]),
            serial: SerialNumber(serial),
        })
    }

    /// Build the frame a device would put on the line, addressed to `dest`.
    /// Used by bus simulators and tests.
    pub fn to_frame(&self, dest: Ipv4Addr, port: u16) -> Vec<u8> {
        let mut payload = [0u8; ANNOUNCE_PAYLOAD_LEN];
        payload[MAGIC_OFFSET - UDP_PAYLOAD_OFFSET] = ANNOUNCE_MAGIC;
        payload[ADDRESS_LOW_OFFSET - UDP_PAYLOAD_OFFSET] = self.address.low;
        payload[ADDRESS_HIGH_OFFSET - UDP_PAYLOAD_OFFSET] = self.address.high;
        let serial_at = SERIAL_OFFSET - UDP_PAYLOAD_OFFSET;
        payload[serial_at..serial_at + SERIAL_LEN].copy_from_slice(self.serial.as_bytes());

        // An announcement payload always fits a datagram.
        datagram::encapsulate(self.address.to_ipv4(), dest, port, port, 0, &payload)
            .unwrap_or_default()
    }
}

pub const POLL_FRAME_LEN: usize = 4;

/// Addressed poll granting one device the bus: `169 254 high low`
pub fn encode_poll(address: LinkAddress) -> [u8; POLL_FRAME_LEN] {
    [LINK_PREFIX[0], LINK_PREFIX[1], address.high, address.low]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce_bytes(low: u8, high: u8, serial: &[u8; SERIAL_LEN]) -> Vec<u8> {
        let mut frame = vec![0u8; ANNOUNCE_FRAME_LEN];
        frame[MAGIC_OFFSET] = ANNOUNCE_MAGIC;
        frame[ADDRESS_LOW_OFFSET] = low;
        frame[ADDRESS_HIGH_OFFSET] = high;
        frame[SERIAL_OFFSET..SERIAL_OFFSET + SERIAL_LEN].copy_from_slice(serial);
        frame
    }

    #[test]
    fn test_parse_announcement() {
        let frame = announce_bytes(84, 20, b"SN0000000000000001");
        let announcement = Announcement::parse(&frame).unwrap();

        assert_eq!(announcement.address, LinkAddress::new(20, 84));
        assert_eq!(announcement.serial.to_string(), "SN0000000000000001");
    }

    #[test]
    fn test_parse_rejects_wrong_length_or_magic() {
        let frame = announce_bytes(84, 20, b"SN0000000000000001");

        assert!(Announcement::parse(&frame[..59]).is_none());
        let mut long = frame.clone();
        long.push(0);
        assert!(Announcement::parse(&long).is_none());

        let mut bad_magic = frame;
        bad_magic[MAGIC_OFFSET] = 0x54;
        assert!(Announcement::parse(&bad_magic).is_none());

        assert!(Announcement::parse(&[]).is_none());
    }

    #[test]
    fn test_device_frame_matches_capture_layout() {
        let announcement = Announcement {
            address: LinkAddress::new(20, 84),
            serial: SerialNumber(*b"SN0000000000000001"),
        };
        let frame = announcement.to_frame(Ipv4Addr::new(169, 254, 255, 255), 30000);

        assert_eq!(frame.len(), ANNOUNCE_FRAME_LEN);
        assert_eq!(frame[MAGIC_OFFSET], ANNOUNCE_MAGIC);
        assert_eq!(frame[ADDRESS_LOW_OFFSET], 84);
        assert_eq!(frame[ADDRESS_HIGH_OFFSET], 20);
        assert_eq!(Announcement::parse(&frame), Some(announcement));
    }

    #[test]
    fn test_poll_frame() {
        let address = LinkAddress::new(20, 84);
        assert_eq!(encode_poll(address), [169, 254, 20, 84]);
    }
}

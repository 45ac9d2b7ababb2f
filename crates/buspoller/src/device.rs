//! Bus participant identity types

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// First two octets of every address on the bus (169.254.0.0/16)
pub const LINK_PREFIX: [u8; 2] = [169, 254];

/// Length of the opaque device serial carried in announcements and rosters
pub const SERIAL_LEN: usize = 18;

/// Two-byte device identifier: the low two octets of `169.254.high.low`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkAddress {
    pub high: u8,
    pub low: u8,
}

impl LinkAddress {
    pub const fn new(high: u8, low: u8) -> Self {
        Self { high, low }
    }

    pub fn to_ipv4(self) -> Ipv4Addr {
        Ipv4Addr::new(LINK_PREFIX[0], LINK_PREFIX[1], self.high, self.low)
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ipv4())
    }
}

impl Serialize for LinkAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// 18-byte opaque device serial
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SerialNumber(pub [u8; SERIAL_LEN]);

impl SerialNumber {
    pub fn as_bytes(&self) -> &[u8; SERIAL_LEN] {
        &self.0
    }
}

impl From<[u8; SERIAL_LEN]> for SerialNumber {
    fn from(bytes: [u8; SERIAL_LEN]) -> Self {
        Self(bytes)
    }
}

// Serials are usually printable ASCII; fall back to hex otherwise.
impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.iter().all(|b| b.is_ascii_graphic()) {
            self.0.iter().try_for_each(|&b| write!(f, "{}", b as char))
        } else {
            self.0.iter().try_for_each(|b| write!(f, "{b:02x}"))
        }
    }
}

impl fmt::Debug for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerialNumber({self})")
    }
}

impl Serialize for SerialNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A registered bus participant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub link_address: LinkAddress,
    pub serial: SerialNumber,
    /// Set once a second device claimed the same link address
    pub duplicate: bool,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_address_ipv4_mapping() {
        let addr = LinkAddress::new(20, 84);
        assert_eq!(addr.to_ipv4(), Ipv4Addr::new(169, 254, 20, 84));
        assert_eq!(addr.to_string(), "169.254.20.84");
    }

    #[test]
    fn test_serial_display() {
        let printable = SerialNumber(*b"SN0000000000000001");
        assert_eq!(printable.to_string(), "SN0000000000000001");

        let mut raw = [0u8; SERIAL_LEN];
        raw[0] = 0xAB;
        assert!(SerialNumber(raw).to_string().starts_with("ab00"));
    }
}

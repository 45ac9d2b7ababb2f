//! Minimal IPv4/UDP encapsulation for datagrams written straight onto the
//! serial line. No options, no fragmentation, UDP checksum left at zero.

use std::net::Ipv4Addr;

use crate::error::{LinkError, LinkResult};

pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const UDP_PAYLOAD_OFFSET: usize = IPV4_HEADER_LEN + UDP_HEADER_LEN;

const IP_VERSION_IHL: u8 = 0x45;
const DEFAULT_TTL: u8 = 64;
const PROTO_UDP: u8 = 17;

/// Wrap `payload` in IPv4 and UDP headers
pub fn encapsulate(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    source_port: u16,
    destination_port: u16,
    identification: u16,
    payload: &[u8],
) -> LinkResult<Vec<u8>> {
    let total_len = UDP_PAYLOAD_OFFSET + payload.len();
    let total = u16::try_from(total_len).map_err(|_| LinkError::PayloadTooLarge(payload.len()))?;
    let udp_len = total - IPV4_HEADER_LEN as u16;

    let mut frame = Vec::with_capacity(total_len);
    frame.push(IP_VERSION_IHL);
    frame.push(0); // DSCP/ECN
    frame.extend_from_slice(&total.to_be_bytes());
    frame.extend_from_slice(&identification.to_be_bytes());
    frame.extend_from_slice(&[0, 0]); // flags + fragment offset
    frame.push(DEFAULT_TTL);
    frame.push(PROTO_UDP);
    frame.extend_from_slice(&[0, 0]); // checksum placeholder
    frame.extend_from_slice(&source.octets());
    frame.extend_from_slice(&destination.octets());

    let checksum = header_checksum(&frame[..IPV4_HEADER_LEN]);
    frame[10..12].copy_from_slice(&checksum.to_be_bytes());

    frame.extend_from_slice(&source_port.to_be_bytes());
    frame.extend_from_slice(&destination_port.to_be_bytes());
    frame.extend_from_slice(&udp_len.to_be_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(payload);

    Ok(frame)
}

/// RFC 1071 ones' complement sum over the header
pub fn header_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|pair| u32::from(pair[0]) << 8 | u32::from(*pair.get(1).unwrap_or(&0)))
        .sum();
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

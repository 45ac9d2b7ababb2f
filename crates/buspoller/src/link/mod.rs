//! Link transport
//!
//! The shared bus is a half-duplex serial line carrying SLIP-framed IPv4/UDP
//! datagrams. The core only sees two halves:
//!
//! - [`LinkTx`]: send a payload as a broadcast datagram, or a raw legacy
//!   frame at another line speed
//! - [`LinkRx`]: observe line activity as [`LineEvent`]s
//!
//! There is no reliability layer; lost frames are recovered by the next
//! broadcast cycle.

pub mod datagram;
pub mod memory;
pub mod serial;
pub mod slip;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{LinkError, LinkResult};

pub use memory::{BusSim, MemoryRx, MemoryTx, SentFrame, memory_link};
pub use serial::{SerialLink, SerialRx, SerialTx};

/// Who put a captured frame on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    /// Our own transmission looped back by the transceiver
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub direction: Direction,
    pub bytes: Bytes,
}

/// Line activity as seen by the observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// An inbound frame began arriving
    FrameStarted,
    /// A frame was fully captured
    Frame(CapturedFrame),
}

impl LineEvent {
    pub fn inbound(bytes: impl Into<Bytes>) -> Self {
        LineEvent::Frame(CapturedFrame {
            direction: Direction::Inbound,
            bytes: bytes.into(),
        })
    }
}

/// Transmit half of the link
#[async_trait]
pub trait LinkTx: Send + Sync + 'static {
    /// Broadcast `payload` to every listener on the bus
    async fn send(&self, payload: &[u8]) -> LinkResult<()>;

    /// Write `frame` unframed at `baud`, hold the line for `settle`, then
    /// restore the bus speed
    async fn send_legacy(&self, _frame: &[u8], _baud: u32, _settle: Duration) -> LinkResult<()> {
        Err(LinkError::Unsupported("legacy polling"))
    }
}

/// Receive half of the link
#[async_trait]
pub trait LinkRx: Send + 'static {
    /// Wait for the next line event. `Err(LinkError::Closed)` is terminal;
    /// any other error is transient.
    async fn next_event(&mut self) -> LinkResult<LineEvent>;
}

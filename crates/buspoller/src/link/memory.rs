//! In-memory bus for tests and dry runs
//!
//! [`memory_link`] returns the two link halves plus a [`BusSim`] that plays
//! the devices: it injects line events and sees every transmission.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{CapturedFrame, Direction, LineEvent, LinkRx, LinkTx};
use crate::error::{LinkError, LinkResult};

/// A transmission recorded by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentFrame {
    Datagram(Bytes),
    Legacy { frame: Bytes, baud: u32 },
}

pub struct MemoryTx {
    sent: mpsc::UnboundedSender<SentFrame>,
    fail_sends: Arc<AtomicBool>,
}

pub struct MemoryRx {
    events: mpsc::UnboundedReceiver<LinkResult<LineEvent>>,
}

/// Device side of the in-memory bus
pub struct BusSim {
    events: Option<mpsc::UnboundedSender<LinkResult<LineEvent>>>,
    sent: mpsc::UnboundedReceiver<SentFrame>,
    fail_sends: Arc<AtomicBool>,
}

pub fn memory_link() -> (MemoryTx, MemoryRx, BusSim) {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let fail_sends = Arc::new(AtomicBool::new(false));

    (
        MemoryTx {
            sent: sent_tx,
            fail_sends: Arc::clone(&fail_sends),
        },
        MemoryRx { events: event_rx },
        BusSim {
            events: Some(event_tx),
            sent: sent_rx,
            fail_sends,
        },
    )
}

impl MemoryTx {
    fn record(&self, frame: SentFrame) -> LinkResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(LinkError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated send failure",
            )));
        }
        self.sent.send(frame).map_err(|_| LinkError::Closed)
    }
}

#[async_trait]
impl LinkTx for MemoryTx {
    async fn send(&self, payload: &[u8]) -> LinkResult<()> {
        self.record(SentFrame::Datagram(Bytes::copy_from_slice(payload)))
    }

    async fn send_legacy(&self, frame: &[u8], baud: u32, settle: Duration) -> LinkResult<()> {
        self.record(SentFrame::Legacy {
            frame: Bytes::copy_from_slice(frame),
            baud,
        })?;
        tokio::time::sleep(settle).await;
        Ok(())
    }
}

#[async_trait]
impl LinkRx for MemoryRx {
    async fn next_event(&mut self) -> LinkResult<LineEvent> {
        self.events.recv().await.unwrap_or(Err(LinkError::Closed))
    }
}

impl BusSim {
    fn inject(&self, event: LinkResult<LineEvent>) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    pub fn start_frame(&self) {
        self.inject(Ok(LineEvent::FrameStarted));
    }

    pub fn end_frame(&self, bytes: impl Into<Bytes>) {
        self.inject(Ok(LineEvent::inbound(bytes)));
    }

    /// A complete inbound frame: start then end
    pub fn reply(&self, bytes: impl Into<Bytes>) {
        self.start_frame();
        self.end_frame(bytes);
    }

    /// Our own transmission echoed back
    pub fn echo(&self, bytes: impl Into<Bytes>) {
        self.inject(Ok(LineEvent::Frame(CapturedFrame {
            direction: Direction::Outgoing,
            bytes: bytes.into(),
        })));
    }

    pub fn read_error(&self, kind: std::io::ErrorKind) {
        self.inject(Err(LinkError::Io(kind.into())));
    }

    /// Drop the event side; the receiver then reports `Closed`
    pub fn close(&mut self) {
        self.events = None;
    }

    pub fn set_send_failure(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub async fn next_sent(&mut self) -> Option<SentFrame> {
        self.sent.recv().await
    }

    /// Everything transmitted so far
    pub fn drain_sent(&mut self) -> Vec<SentFrame> {
        std::iter::from_fn(|| self.sent.try_recv().ok()).collect()
    }
}

//! SLIP (RFC 1055) framing for the serial line

use bytes::{BufMut, Bytes, BytesMut};

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// Frames longer than this are line noise or a lost END; drop them
pub const MAX_FRAME_LEN: usize = 2048;

/// Encode one frame as `END payload END`, escaping as needed
pub fn encode(payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() * 2 + 2);
    out.put_u8(END);
    for &byte in payload {
        match byte {
            END => out.put_slice(&[ESC, ESC_END]),
            ESC => out.put_slice(&[ESC, ESC_ESC]),
            other => out.put_u8(other),
        }
    }
    out.put_u8(END);
    out.freeze()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlipEvent {
    /// The first payload byte of a new frame arrived
    Started,
    /// A frame closed with END
    Frame(Bytes),
}

/// Streaming decoder, fed one byte at a time
#[derive(Debug, Default)]
pub struct SlipDecoder {
    buf: BytesMut,
    escaped: bool,
    overflowed: bool,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of the frame currently being received
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn feed(&mut self, byte: u8) -> Option<SlipEvent> {
        if byte == END {
            self.escaped = false;
            if std::mem::take(&mut self.overflowed) {
                self.buf.clear();
                return None;
            }
            if self.buf.is_empty() {
                return None;
            }
            return Some(SlipEvent::Frame(self.buf.split().freeze()));
        }

        let decoded = if self.escaped {
            self.escaped = false;
            match byte {
                ESC_END => END,
                ESC_ESC => ESC,
                // Invalid escape: keep the raw byte.
                other => other,
            }
        } else if byte == ESC {
            self.escaped = true;
            return None;
        } else {
            byte
        };

        if self.overflowed {
            return None;
        }
        if self.buf.len() >= MAX_FRAME_LEN {
            tracing::debug!(len = self.buf.len(), "Oversized SLIP frame discarded");
            self.overflowed = true;
            self.buf.clear();
            return None;
        }

        let started = self.buf.is_empty();
        self.buf.put_u8(decoded);
        started.then_some(SlipEvent::Started)
    }
}

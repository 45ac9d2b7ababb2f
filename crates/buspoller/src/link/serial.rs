//! Serial line worker
//!
//! A single task owns the serial stream. Transmissions arrive over a command
//! channel and line events leave over an event channel, so reads never block
//! writes and the port is never shared.

use std::net::Ipv4Addr;
use std::pin::pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

use super::slip::{self, SlipDecoder, SlipEvent};
use super::{CapturedFrame, Direction, LineEvent, LinkRx, LinkTx, datagram};
use crate::config::{NetworkConfig, SerialConfig};
use crate::error::{LinkError, LinkResult};

const COMMAND_CHANNEL_SIZE: usize = 16;
const EVENT_CHANNEL_SIZE: usize = 256;
const READ_BUF_LEN: usize = 512;

/// Line speed control for the worker's stream
pub trait LineSpeed {
    fn baud_rate(&self) -> LinkResult<u32>;
    fn set_baud_rate(&mut self, baud: u32) -> LinkResult<()>;
}

impl LineSpeed for SerialStream {
    fn baud_rate(&self) -> LinkResult<u32> {
        Ok(SerialPort::baud_rate(self)?)
    }

    fn set_baud_rate(&mut self, baud: u32) -> LinkResult<()> {
        Ok(SerialPort::set_baud_rate(self, baud)?)
    }
}

/// Datagram addressing used for every transmission
#[derive(Debug, Clone, Copy)]
pub struct Addressing {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub port: u16,
}

impl From<&NetworkConfig> for Addressing {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            source: network.host_address,
            destination: network.broadcast_address,
            port: network.udp_port,
        }
    }
}

/// Worker settings
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub addressing: Addressing,
    /// Treat frames that replay our last transmission as loopback
    pub echo_suppression: bool,
    pub read_backoff: Duration,
}

enum WorkerCommand {
    Send {
        payload: Bytes,
        reply: oneshot::Sender<LinkResult<()>>,
    },
    Legacy {
        frame: Bytes,
        baud: u32,
        settle: Duration,
        reply: oneshot::Sender<LinkResult<()>>,
    },
}

pub struct SerialLink;

impl SerialLink {
    /// Open the serial device and start its worker
    pub fn open(serial: &SerialConfig, network: &NetworkConfig) -> LinkResult<(SerialTx, SerialRx)> {
        let port = tokio_serial::new(serial.path.as_str(), serial.baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .open_native_async()
            .map_err(|source| LinkError::Open {
                path: serial.path.clone(),
                source,
            })?;

        tracing::info!(path = %serial.path, baud = serial.baud, "Serial link opened");

        Ok(spawn_worker(
            port,
            WorkerOptions {
                addressing: network.into(),
                echo_suppression: serial.echo_suppression,
                read_backoff: serial.read_backoff(),
            },
        ))
    }
}

/// Start a worker over any byte stream with line speed control
pub fn spawn_worker<P>(port: P, options: WorkerOptions) -> (SerialTx, SerialRx)
where
    P: AsyncRead + AsyncWrite + LineSpeed + Unpin + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

    let worker = SerialWorker {
        port,
        cmd_rx,
        event_tx,
        decoder: SlipDecoder::new(),
        options,
        identification: 0,
        last_sent: None,
        start_withheld: false,
    };
    tokio::spawn(worker.run());

    (SerialTx { cmd_tx }, SerialRx { event_rx })
}

struct SerialWorker<P> {
    port: P,
    cmd_rx: mpsc::Receiver<WorkerCommand>,
    event_tx: mpsc::Sender<LinkResult<LineEvent>>,
    decoder: SlipDecoder,
    options: WorkerOptions,
    /// IPv4 identification for the next datagram
    identification: u16,
    /// Last datagram written, for echo suppression
    last_sent: Option<Bytes>,
    /// A frame start held back while the frame still looks like our echo
    start_withheld: bool,
}

impl<P> SerialWorker<P>
where
    P: AsyncRead + AsyncWrite + LineSpeed + Unpin + Send + 'static,
{
    async fn run(mut self) {
        tracing::debug!("Serial worker started");
        let mut buf = [0u8; READ_BUF_LEN];

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                read = self.port.read(&mut buf) => match read {
                    Ok(0) => {
                        tracing::warn!("Serial stream reached end of file");
                        break;
                    }
                    Ok(n) => {
                        let mut events = Vec::new();
                        for &byte in &buf[..n] {
                            self.decode(byte, &mut events);
                        }
                        for event in events {
                            if self.event_tx.send(Ok(event)).await.is_err() {
                                tracing::debug!("Line event receiver dropped");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Serial read failed: {}", e);
                        if self.event_tx.send(Err(LinkError::Io(e))).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(self.options.read_backoff).await;
                    }
                },
            }
        }

        tracing::debug!("Serial worker stopped");
    }

    async fn handle_command(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::Send { payload, reply } => {
                let _ = reply.send(self.write_datagram(&payload).await);
            }
            WorkerCommand::Legacy {
                frame,
                baud,
                settle,
                reply,
            } => {
                let _ = reply.send(self.write_legacy(&frame, baud, settle).await);
            }
        }
    }

    async fn write_datagram(&mut self, payload: &[u8]) -> LinkResult<()> {
        let addressing = self.options.addressing;
        let datagram = datagram::encapsulate(
            addressing.source,
            addressing.destination,
            addressing.port,
            addressing.port,
            self.identification,
            payload,
        )?;
        self.identification = self.identification.wrapping_add(1);

        self.port.write_all(&slip::encode(&datagram)).await?;
        self.port.flush().await?;

        if self.options.echo_suppression {
            self.last_sent = Some(Bytes::from(datagram));
        }
        Ok(())
    }

    async fn write_legacy(&mut self, frame: &[u8], baud: u32, settle: Duration) -> LinkResult<()> {
        let bus_baud = self.port.baud_rate()?;
        self.port.set_baud_rate(baud)?;

        let written: LinkResult<()> = async {
            self.port.write_all(frame).await?;
            self.port.flush().await?;
            self.drain_for(settle).await;
            Ok(())
        }
        .await;

        // Legacy replies are not SLIP; start the next bus frame clean.
        self.decoder = SlipDecoder::new();
        self.start_withheld = false;

        let restored = self.port.set_baud_rate(bus_baud);
        written.and(restored)
    }

    /// Read and discard line input for `period`
    async fn drain_for(&mut self, period: Duration) {
        let mut scratch = [0u8; READ_BUF_LEN];
        let mut deadline = pin!(tokio::time::sleep(period));
        loop {
            tokio::select! {
                _ = &mut deadline => return,
                read = self.port.read(&mut scratch) => match read {
                    Ok(0) => return,
                    Ok(n) => tracing::trace!(bytes = n, "Discarded legacy reply bytes"),
                    Err(e) => {
                        tracing::debug!("Read during legacy settle failed: {}", e);
                        return;
                    }
                },
            }
        }
    }

    fn echo_in_progress(&self) -> bool {
        self.last_sent
            .as_ref()
            .is_some_and(|sent| sent.starts_with(self.decoder.pending()))
    }

    fn decode(&mut self, byte: u8, events: &mut Vec<LineEvent>) {
        match self.decoder.feed(byte) {
            Some(SlipEvent::Started) => {
                if self.echo_in_progress() {
                    self.start_withheld = true;
                } else {
                    events.push(LineEvent::FrameStarted);
                }
            }
            Some(SlipEvent::Frame(bytes)) => {
                let withheld = std::mem::take(&mut self.start_withheld);
                if self.last_sent.as_ref() == Some(&bytes) {
                    self.last_sent = None;
                    events.push(LineEvent::Frame(CapturedFrame {
                        direction: Direction::Outgoing,
                        bytes,
                    }));
                } else {
                    if withheld {
                        events.push(LineEvent::FrameStarted);
                    }
                    events.push(LineEvent::inbound(bytes));
                }
            }
            None => {
                if self.start_withheld && !self.echo_in_progress() {
                    self.start_withheld = false;
                    events.push(LineEvent::FrameStarted);
                }
            }
        }
    }
}

/// Transmit half of a serial link
#[derive(Clone)]
pub struct SerialTx {
    cmd_tx: mpsc::Sender<WorkerCommand>,
}

impl SerialTx {
    async fn request(&self, build: impl FnOnce(oneshot::Sender<LinkResult<()>>) -> WorkerCommand) -> LinkResult<()> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .await
            .map_err(|_| LinkError::Closed)?;
        response.await.map_err(|_| LinkError::Closed)?
    }
}

#[async_trait]
impl LinkTx for SerialTx {
    async fn send(&self, payload: &[u8]) -> LinkResult<()> {
        let payload = Bytes::copy_from_slice(payload);
        self.request(|reply| WorkerCommand::Send { payload, reply }).await
    }

    async fn send_legacy(&self, frame: &[u8], baud: u32, settle: Duration) -> LinkResult<()> {
        let frame = Bytes::copy_from_slice(frame);
        self.request(|reply| WorkerCommand::Legacy {
            frame,
            baud,
            settle,
            reply,
        })
        .await
    }
}

/// Receive half of a serial link
pub struct SerialRx {
    event_rx: mpsc::Receiver<LinkResult<LineEvent>>,
}

#[async_trait]
impl LinkRx for SerialRx {
    async fn next_event(&mut self) -> LinkResult<LineEvent> {
        self.event_rx.recv().await.unwrap_or(Err(LinkError::Closed))
    }
}

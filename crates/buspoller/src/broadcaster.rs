//! Topology/Poll Broadcaster
//!
//! The topology broadcast is also the bus-access grant: devices stay quiet
//! until they hear it or their own poll. Each cycle therefore runs strictly
//! in this order, never overlapped:
//!
//! 1. broadcast the roster with the current time
//! 2. let the line settle
//! 3. poll every registered device in registry order, one at a time, until
//!    the next broadcast is due
//!
//! A device that does not answer is simply retried in the next round.

use std::sync::Arc;

use buspoller_service::StopSignal;
use bytes::Bytes;
use chrono::Utc;
use tokio::time::{Duration, Instant};

use crate::config::{LegacyConfig, PollTiming};
use crate::device::Device;
use crate::error::{LinkError, LinkResult};
use crate::frame::encode_poll;
use crate::link::LinkTx;
use crate::registry::DeviceRegistry;
use crate::signal::{PollAttempt, PollOutcome, ReplyWindow, ResponseSignal, await_reply};
use crate::topology::TopologyMessage;

/// Enquiry understood by pre-bus devices on the slow line
pub const LEGACY_ENQUIRY: [u8; 7] = [0x10, 0x02, 0x78, 0x00, 0x8A, 0x10, 0x03];

/// Slow-speed probe sent after each poll round
#[derive(Debug, Clone)]
pub struct LegacyProbe {
    pub frame: Bytes,
    pub baud: u32,
    pub settle: Duration,
}

impl LegacyProbe {
    pub fn from_config(config: &LegacyConfig) -> Option<Self> {
        config.enabled.then(|| Self {
            frame: Bytes::from_static(&LEGACY_ENQUIRY),
            baud: config.baud,
            settle: config.settle(),
        })
    }
}

/// Tally of one pass over the roster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundStats {
    pub polled: usize,
    pub replied: usize,
    pub timed_out: usize,
    pub send_failures: usize,
}

pub struct TopologyBroadcaster {
    tx: Arc<dyn LinkTx>,
    registry: Arc<dyn DeviceRegistry>,
    signal: ResponseSignal,
    timing: PollTiming,
    window: ReplyWindow,
    command_port: u16,
    legacy: Option<LegacyProbe>,
}

impl TopologyBroadcaster {
    pub fn new(
        tx: Arc<dyn LinkTx>,
        registry: Arc<dyn DeviceRegistry>,
        signal: ResponseSignal,
        timing: PollTiming,
        command_port: u16,
    ) -> Self {
        Self {
            tx,
            registry,
            signal,
            window: ReplyWindow::from(&timing),
            timing,
            command_port,
            legacy: None,
        }
    }

    pub fn with_legacy_probe(mut self, probe: Option<LegacyProbe>) -> Self {
        self.legacy = probe;
        self
    }

    /// Run broadcast cycles until `stop` fires
    pub async fn run(mut self, mut stop: StopSignal) {
        tracing::info!(
            period_ms = self.timing.topology_period_ms,
            legacy = self.legacy.is_some(),
            "Topology broadcaster started"
        );

        while !stop.is_stopped() {
            let next_broadcast = Instant::now() + self.timing.topology_period();

            if let Err(e) = self.broadcast_topology().await {
                tracing::warn!("Topology broadcast failed: {}", e);
            }
            if !sleep_or_stop(self.timing.settle(), &mut stop).await {
                break;
            }
            if !self.poll_until(next_broadcast, &mut stop).await {
                break;
            }
        }

        self.signal.finish();
        tracing::info!("Topology broadcaster stopped");
    }

    /// Snapshot the registry and send the roster. Returns the message sent.
    pub async fn broadcast_topology(&self) -> LinkResult<TopologyMessage> {
        let roster = self.registry.snapshot();
        let message = TopologyMessage::from_snapshot(&roster, Utc::now(), self.command_port);
        self.tx.send(&message.encode()).await?;

        tracing::debug!(devices = message.device_count(), "Topology broadcast sent");
        Ok(message)
    }

    /// Repeat poll rounds until `deadline`. Returns false if stopped.
    async fn poll_until(&mut self, deadline: Instant, stop: &mut StopSignal) -> bool {
        loop {
            let roster = self.registry.snapshot();
            if roster.is_empty() {
                return sleep_until_or_stop(deadline, stop).await;
            }

            let Some(stats) = self.poll_round(&roster, stop).await else {
                return false;
            };
            tracing::debug!(
                polled = stats.polled,
                replied = stats.replied,
                timed_out = stats.timed_out,
                send_failures = stats.send_failures,
                "Poll round complete"
            );

            // Nothing reached the wire; idle until the next broadcast.
            if stats.polled == 0 && stats.send_failures > 0 {
                tracing::warn!(
                    failures = stats.send_failures,
                    "Link rejected every poll, pausing until the next broadcast"
                );
                return sleep_until_or_stop(deadline, stop).await;
            }

            if !self.probe_legacy(stop).await {
                return false;
            }
            if Instant::now() >= deadline {
                return true;
            }
        }
    }

    /// Poll each device in order. `None` if stopped mid-round.
    pub async fn poll_round(&self, roster: &[Device], stop: &mut StopSignal) -> Option<RoundStats> {
        let mut stats = RoundStats::default();

        for device in roster {
            let attempt = match self.poll_device(device, stop).await {
                Ok(attempt) => attempt,
                Err(e) => {
                    tracing::warn!(address = %device.link_address, "Poll send failed: {}", e);
                    stats.send_failures += 1;
                    continue;
                }
            };

            stats.polled += 1;
            match attempt.outcome {
                PollOutcome::Replied => stats.replied += 1,
                PollOutcome::NoResponse | PollOutcome::Incomplete => stats.timed_out += 1,
                PollOutcome::Cancelled => return None,
            }
        }

        Some(stats)
    }

    /// Grant the bus to one device and wait for its reply
    pub async fn poll_device(&self, device: &Device, stop: &mut StopSignal) -> LinkResult<PollAttempt> {
        let target = device.link_address;
        self.signal.begin(target);

        if let Err(e) = self.tx.send(&encode_poll(target)).await {
            self.signal.finish();
            return Err(e);
        }

        let attempt = await_reply(&self.signal, target, &self.window, stop).await;
        self.signal.finish();

        tracing::debug!(
            address = %target,
            outcome = ?attempt.outcome,
            ticks = attempt.elapsed_ticks,
            "Poll attempt finished"
        );
        Ok(attempt)
    }

    /// Send the legacy probe if configured. Returns false if stopped.
    async fn probe_legacy(&mut self, stop: &mut StopSignal) -> bool {
        let Some(probe) = &self.legacy else {
            return true;
        };

        let result = tokio::select! {
            result = self.tx.send_legacy(&probe.frame, probe.baud, probe.settle) => result,
            _ = stop.stopped() => return false,
        };

        match result {
            Ok(()) => {}
            Err(LinkError::Unsupported(what)) => {
                tracing::warn!("Link does not support {}, disabling legacy probe", what);
                self.legacy = None;
            }
            Err(e) => tracing::warn!("Legacy probe failed: {}", e),
        }
        true
    }
}

async fn sleep_or_stop(duration: Duration, stop: &mut StopSignal) -> bool {
    sleep_until_or_stop(Instant::now() + duration, stop).await
}

async fn sleep_until_or_stop(deadline: Instant, stop: &mut StopSignal) -> bool {
    tokio::select! {
        _ = tokio::time::sleep_until(deadline) => true,
        _ = stop.stopped() => false,
    }
}

//! Response signal shared by the line observer and the poll loop
//!
//! The broadcaster arms the signal for one target before each poll; the
//! observer marks frame activity. Marks made while the signal is disarmed
//! are dropped. Marks are not attributed to a sender, so a straggling reply
//! that lands after the next `begin` counts toward that attempt.

use std::sync::Arc;
use std::time::Duration;

use buspoller_service::StopSignal;
use tokio::sync::watch;

use crate::config::PollTiming;
use crate::device::LinkAddress;

/// Snapshot of the current poll attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalState {
    /// Device being polled; `None` while disarmed
    pub target: Option<LinkAddress>,
    pub response_started: bool,
    /// Implies `response_started`
    pub response_ended: bool,
}

#[derive(Debug, Clone)]
pub struct ResponseSignal {
    state: Arc<watch::Sender<SignalState>>,
}

impl Default for ResponseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SignalState::default());
        Self { state: Arc::new(tx) }
    }

    /// Arm for a new attempt at `target`, clearing both flags
    pub fn begin(&self, target: LinkAddress) {
        self.state.send_replace(SignalState {
            target: Some(target),
            ..SignalState::default()
        });
    }

    /// Disarm, returning the attempt's final state
    pub fn finish(&self) -> SignalState {
        self.state.send_replace(SignalState::default())
    }

    /// An inbound frame began arriving
    pub fn frame_started(&self) {
        self.state.send_if_modified(|state| {
            if state.target.is_none() || state.response_started {
                return false;
            }
            state.response_started = true;
            true
        });
    }

    /// An inbound frame completed
    pub fn frame_ended(&self) {
        self.state.send_if_modified(|state| {
            if state.target.is_none() || state.response_ended {
                return false;
            }
            state.response_started = true;
            state.response_ended = true;
            true
        });
    }

    pub fn state(&self) -> SignalState {
        *self.state.borrow()
    }
}

/// Tick budget for one poll attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyWindow {
    pub tick: Duration,
    /// Ticks allowed before a reply starts
    pub idle_ticks: u32,
    /// Ticks allowed once a reply has started
    pub max_response_ticks: u32,
}

impl From<&PollTiming> for ReplyWindow {
    fn from(timing: &PollTiming) -> Self {
        Self {
            tick: timing.tick(),
            idle_ticks: timing.idle_ticks(),
            max_response_ticks: timing.max_response_ticks(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The reply started and finished inside the window
    Replied,
    /// Nothing started within the idle budget
    NoResponse,
    /// A reply started but did not finish within the response budget
    Incomplete,
    /// Stopped while waiting
    Cancelled,
}

/// Record of one poll attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollAttempt {
    pub target: LinkAddress,
    pub response_started: bool,
    pub response_ended: bool,
    pub elapsed_ticks: u32,
    pub outcome: PollOutcome,
}

/// Wait for the armed attempt to complete.
///
/// Each tick sleeps once, then checks the flags. The budget is the idle
/// window until a reply starts and the full response window after; the
/// wait ends early once the reply has both started and ended.
pub async fn await_reply(
    signal: &ResponseSignal,
    target: LinkAddress,
    window: &ReplyWindow,
    stop: &mut StopSignal,
) -> PollAttempt {
    let mut elapsed_ticks = 0u32;

    let outcome = loop {
        let state = signal.state();
        let budget = if state.response_started {
            window.max_response_ticks
        } else {
            window.idle_ticks
        };
        if elapsed_ticks >= budget {
            break if state.response_started {
                PollOutcome::Incomplete
            } else {
                PollOutcome::NoResponse
            };
        }

        tokio::select! {
            _ = tokio::time::sleep(window.tick) => {}
            _ = stop.stopped() => break PollOutcome::Cancelled,
        }
        elapsed_ticks += 1;

        let state = signal.state();
        if state.response_started && state.response_ended {
            break PollOutcome::Replied;
        }
    };

    let state = signal.state();
    PollAttempt {
        target,
        response_started: state.response_started,
        response_ended: state.response_ended,
        elapsed_ticks,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use buspoller_service::stop_pair;
    use tokio::time::Instant;

    use super::*;

    const TARGET: LinkAddress = LinkAddress::new(20, 84);

    fn window() -> ReplyWindow {
        ReplyWindow::from(&PollTiming::default())
    }

    #[test]
    fn test_marks_ignored_while_disarmed() {
        let signal = ResponseSignal::new();
        signal.frame_started();
        signal.frame_ended();
        assert_eq!(signal.state(), SignalState::default());
    }

    #[test]
    fn test_end_implies_start_and_begin_resets() {
        let signal = ResponseSignal::new();
        signal.begin(TARGET);
        signal.frame_ended();

        let state = signal.state();
        assert!(state.response_started && state.response_ended);

        signal.begin(LinkAddress::new(20, 85));
        let state = signal.state();
        assert_eq!(state.target, Some(LinkAddress::new(20, 85)));
        assert!(!state.response_started && !state.response_ended);

        let last = signal.finish();
        assert_eq!(last.target, Some(LinkAddress::new(20, 85)));
        assert_eq!(signal.state().target, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_waits_idle_budget() {
        let signal = ResponseSignal::new();
        let mut stop = StopSignal::never();
        signal.begin(TARGET);

        let started = Instant::now();
        let attempt = await_reply(&signal, TARGET, &window(), &mut stop).await;

        assert_eq!(attempt.outcome, PollOutcome::NoResponse);
        assert_eq!(attempt.elapsed_ticks, 150);
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_reply_extends_to_max_response() {
        let signal = ResponseSignal::new();
        let mut stop = StopSignal::never();
        signal.begin(TARGET);
        signal.frame_started();

        let attempt = await_reply(&signal, TARGET, &window(), &mut stop).await;

        assert_eq!(attempt.outcome, PollOutcome::Incomplete);
        assert_eq!(attempt.elapsed_ticks, 600);
        assert!(attempt.response_started && !attempt.response_ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_starting_mid_idle_switches_budget() {
        let signal = ResponseSignal::new();
        let mut stop = StopSignal::never();
        signal.begin(TARGET);

        let observer = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            observer.frame_started();
        });

        let started = Instant::now();
        let attempt = await_reply(&signal, TARGET, &window(), &mut stop).await;

        // Past the 150 tick idle budget, capped by the 600 tick response budget.
        assert_eq!(attempt.outcome, PollOutcome::Incomplete);
        assert_eq!(attempt.elapsed_ticks, 600);
        assert!(attempt.response_started && !attempt.response_ended);
        assert!(started.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_reply_ends_wait_early() {
        let signal = ResponseSignal::new();
        let mut stop = StopSignal::never();
        signal.begin(TARGET);

        let observer = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            observer.frame_started();
            tokio::time::sleep(Duration::from_millis(5)).await;
            observer.frame_ended();
        });

        let attempt = await_reply(&signal, TARGET, &window(), &mut stop).await;

        assert_eq!(attempt.outcome, PollOutcome::Replied);
        assert!(attempt.response_ended);
        assert!(attempt.elapsed_ticks > 0 && attempt.elapsed_ticks < 150);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_wait() {
        let signal = ResponseSignal::new();
        let (trigger, mut stop) = stop_pair();
        signal.begin(TARGET);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger();
        });

        let attempt = await_reply(&signal, TARGET, &window(), &mut stop).await;
        assert_eq!(attempt.outcome, PollOutcome::Cancelled);
        assert!(attempt.elapsed_ticks < 150);
    }
}

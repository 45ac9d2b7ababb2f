//! Stop Signal
//!
//! Cooperative cancellation for background tasks. Wait loops select on
//! [`StopSignal::stopped`] so they exit at their next tick instead of
//! running out their full timeout.

use tokio::sync::watch;

/// Owning side of a stop signal
#[derive(Debug)]
pub struct StopTrigger {
    tx: watch::Sender<bool>,
}

/// Cloneable observer of a [`StopTrigger`]
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected trigger/signal pair
pub fn stop_pair() -> (StopTrigger, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopTrigger { tx }, StopSignal { rx })
}

impl StopTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl StopSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Dropping the sender leaves the receiver parked on `false` forever.
        drop(tx);
        Self { rx }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the trigger fires. Never resolves if the trigger was
    /// dropped without firing.
    pub async fn stopped(&mut self) {
        if self.rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_all_clones() {
        let (trigger, signal) = stop_pair();
        let mut a = signal.clone();
        let mut b = trigger.signal();

        assert!(!a.is_stopped());
        trigger.trigger();

        a.stopped().await;
        b.stopped().await;
        assert!(signal.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_signal_does_not_fire() {
        let mut signal = StopSignal::never();
        let fired = tokio::time::timeout(Duration::from_secs(60), signal.stopped()).await;
        assert!(fired.is_err());
        assert!(!signal.is_stopped());
    }
}

//! Command Reconciliation Tracker
//!
//! Devices never acknowledge commands. A command is confirmed only when
//! later telemetry reports the commanded value, or given up on once the
//! convergence window passes. At most one command is pending per key; a
//! new command for the same key replaces it.

use std::collections::HashMap;
use std::hash::Hash;

use serde::Serialize;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

pub const DEFAULT_CONVERGENCE_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Achieved,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand<K, V> {
    pub command_id: Uuid,
    pub key: K,
    pub target: V,
    pub issued_at: Instant,
    pub status: CommandStatus,
}

pub struct ReconciliationTracker<K, V> {
    window: Duration,
    pending: HashMap<K, PendingCommand<K, V>>,
    /// Most recent resolution per key, kept for status queries
    resolved: HashMap<K, PendingCommand<K, V>>,
}

impl<K, V> Default for ReconciliationTracker<K, V>
where
    K: Eq + Hash + Clone,
    V: PartialEq + Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_CONVERGENCE_WINDOW)
    }
}

impl<K, V> ReconciliationTracker<K, V>
where
    K: Eq + Hash + Clone,
    V: PartialEq + Clone,
{
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            resolved: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn issue(&mut self, key: K, target: V) -> PendingCommand<K, V> {
        self.issue_at(key, target, Instant::now())
    }

    /// Record a command, replacing any pending one for `key`
    pub fn issue_at(&mut self, key: K, target: V, now: Instant) -> PendingCommand<K, V> {
        let command = PendingCommand {
            command_id: Uuid::new_v4(),
            key: key.clone(),
            target,
            issued_at: now,
            status: CommandStatus::Pending,
        };

        self.resolved.remove(&key);
        if let Some(previous) = self.pending.insert(key, command.clone()) {
            tracing::debug!(
                superseded = %previous.command_id,
                command_id = %command.command_id,
                "Pending command superseded"
            );
        }
        command
    }

    pub fn observe(&mut self, key: &K, actual: &V) -> Option<PendingCommand<K, V>> {
        self.observe_at(key, actual, Instant::now())
    }

    /// Apply a telemetry reading. Returns the command it resolved, if any.
    ///
    /// An expired command times out even when the reading matches.
    pub fn observe_at(&mut self, key: &K, actual: &V, now: Instant) -> Option<PendingCommand<K, V>> {
        let command = self.pending.get(key)?;
        let status = if self.is_expired(command, now) {
            CommandStatus::TimedOut
        } else if command.target == *actual {
            CommandStatus::Achieved
        } else {
            return None;
        };
        self.resolve(key, status)
    }

    pub fn sweep(&mut self) -> Vec<PendingCommand<K, V>> {
        self.sweep_at(Instant::now())
    }

    /// Time out every command whose window has passed
    pub fn sweep_at(&mut self, now: Instant) -> Vec<PendingCommand<K, V>> {
        let expired: Vec<K> = self
            .pending
            .values()
            .filter(|command| self.is_expired(command, now))
            .map(|command| command.key.clone())
            .collect();

        expired
            .iter()
            .filter_map(|key| self.resolve(key, CommandStatus::TimedOut))
            .collect()
    }

    /// Current status for `key`: pending, or the last resolution
    pub fn status(&self, key: &K) -> Option<CommandStatus> {
        self.pending
            .get(key)
            .or_else(|| self.resolved.get(key))
            .map(|command| command.status)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn is_expired(&self, command: &PendingCommand<K, V>, now: Instant) -> bool {
        now.saturating_duration_since(command.issued_at) > self.window
    }

    fn resolve(&mut self, key: &K, status: CommandStatus) -> Option<PendingCommand<K, V>> {
        let mut command = self.pending.remove(key)?;
        command.status = status;
        self.resolved.insert(key.clone(), command.clone());
        Some(command)
    }
}

//! Service Lifecycle Runtime
//!
//! Hosts the long-running pieces of the bus poller (line observer, topology
//! broadcaster, command intake) as services with a uniform lifecycle.
//!
//! # Lifecycle
//!
//! - `on_start`: acquire resources and spawn background tasks
//! - `on_event`: handle an event matching one of the service's subscriptions
//! - `on_tick`: periodic work, if the spec sets a tick interval
//! - `on_stop`: join background tasks; the context's [`StopSignal`] has
//!   already fired by the time this runs

mod event;
mod handle;
mod manager;
mod stop;

pub use event::*;
pub use handle::*;
pub use manager::*;
pub use stop::*;

use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("service failed to start: {0}")]
    StartFailed(String),

    #[error("a service with id {0} is already registered")]
    DuplicateId(String),

    #[error("{0} is not running")]
    NotRunning(String),

    #[error("invalid {event_type} event: {reason}")]
    InvalidEvent { event_type: String, reason: String },

    #[error("service did not stop in time")]
    StopTimedOut,

    #[error("service loop went away before replying")]
    ChannelClosed,

    #[error("service task panicked: {0}")]
    Panicked(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// ─────────────────────────────────────────────────────────────────────────────
// Service Specification
// ─────────────────────────────────────────────────────────────────────────────

/// What the manager needs to know to host a service
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub id: String,
    pub label: String,
    /// Period of `on_tick`; no ticks when unset
    pub tick: Option<Duration>,
    /// Glob patterns over event types, e.g. `"device/*"`
    pub patterns: Vec<String>,
    /// How long `on_stop` may take before the service is marked failed
    pub stop_budget: Duration,
}

impl ServiceSpec {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            tick: None,
            patterns: Vec::new(),
            stop_budget: Duration::from_secs(5),
        }
    }

    pub fn tick_every(self, period: Duration) -> Self {
        Self {
            tick: Some(period),
            ..self
        }
    }

    pub fn subscribe(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn stop_within(self, budget: Duration) -> Self {
        Self {
            stop_budget: budget,
            ..self
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Context
// ─────────────────────────────────────────────────────────────────────────────

/// Per-service view of the runtime, handed to every lifecycle method
pub struct ServiceContext {
    pub service_id: String,

    publisher: EventPublisher,
    stop: StopSignal,
}

impl ServiceContext {
    pub fn new(service_id: String, publisher: EventPublisher, stop: StopSignal) -> Self {
        Self {
            service_id,
            publisher,
            stop,
        }
    }

    /// Publish an event on behalf of this service
    pub fn emit(&self, event_type: impl Into<String>, data: serde_json::Value) {
        self.publisher
            .publish(Event::new(event_type, &self.service_id, data));
    }

    /// A publisher that background tasks can own
    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    /// A signal that fires when this service is asked to stop
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Long-running component hosted by a [`ServiceManager`]
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn spec(&self) -> ServiceSpec;

    /// Called once before the event loop starts. An error marks the service failed.
    async fn on_start(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    /// Called once after the stop signal fired.
    async fn on_stop(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    async fn on_event(&mut self, _ctx: &ServiceContext, _event: Event) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_tick(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }
}

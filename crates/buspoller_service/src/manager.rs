//! Service Manager
//!
//! Owns every spawned service, fans events out to matching subscriptions and
//! drives the shutdown sequence.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Interval;

use super::{
    Event, EventPublisher, Service, ServiceCommand, ServiceContext, ServiceError, ServiceHandle,
    ServiceResult, ServiceState, StopSignal, StopTrigger, stop_pair,
};

const EVENT_BUS_CAPACITY: usize = 1024;
const COMMAND_QUEUE: usize = 256;

struct Entry {
    handle: ServiceHandle,
    task: JoinHandle<ServiceResult<()>>,
    stop_budget: Duration,
}

/// Central owner of every running service
pub struct ServiceManager {
    services: DashMap<String, Entry>,
    shutdown: StopTrigger,
    events: broadcast::Sender<Event>,
    shutdown_timeout: Duration,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        let (shutdown, _) = stop_pair();
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);

        Self {
            services: DashMap::new(),
            shutdown,
            events,
            shutdown_timeout: Duration::from_secs(10),
        }
    }

    pub fn event_publisher(&self) -> EventPublisher {
        EventPublisher::new(self.events.clone())
    }

    pub fn publish_event(&self, event: Event) {
        self.event_publisher().publish(event);
    }

    /// Spawn a service onto the runtime and return its handle.
    ///
    /// `on_start` runs inside the spawned task; a failure there shows up as
    /// [`ServiceState::Failed`] on the handle.
    pub async fn spawn<S: Service>(&self, service: S) -> ServiceResult<ServiceHandle> {
        let spec = service.spec();
        if self.services.contains_key(&spec.id) {
            return Err(ServiceError::DuplicateId(spec.id));
        }

        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (state, state_rx) = watch::channel(ServiceState::Starting);
        let handle = ServiceHandle::new(spec.id.clone(), commands, state_rx);
        let (stop, stop_signal) = stop_pair();

        let runner = ServiceLoop {
            ctx: ServiceContext::new(spec.id.clone(), self.event_publisher(), stop_signal),
            stop,
            commands: command_rx,
            global_stop: self.shutdown.signal(),
            events: self.events.subscribe(),
            state,
            ticker: spec.tick.map(ticker),
            patterns: spec.patterns,
            stop_budget: spec.stop_budget,
        };

        self.services.insert(
            spec.id,
            Entry {
                handle: handle.clone(),
                task: tokio::spawn(runner.run(service)),
                stop_budget: spec.stop_budget,
            },
        );
        Ok(handle)
    }

    pub fn get(&self, service_id: &str) -> Option<ServiceHandle> {
        self.services.get(service_id).map(|entry| entry.handle.clone())
    }

    /// Stop one service and wait for its loop to return
    pub async fn stop(&self, service_id: &str) -> ServiceResult<()> {
        let (_, entry) = self
            .services
            .remove(service_id)
            .ok_or_else(|| ServiceError::NotRunning(service_id.to_string()))?;

        // The loop may already be gone; its join result says how it ended.
        let _ = entry.handle.shutdown().await;

        let grace = entry.stop_budget + Duration::from_secs(1);
        match tokio::time::timeout(grace, entry.task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::error!(service_id, error = ?e, "Service task panicked");
                Err(ServiceError::Panicked(format!("{e:?}")))
            }
            Err(_) => {
                tracing::warn!(service_id, "Service shutdown timed out");
                Err(ServiceError::StopTimedOut)
            }
        }
    }

    /// Signal every service to stop and wait until each reports a terminal
    /// state
    pub async fn shutdown_all(&self) -> ServiceResult<()> {
        tracing::info!(services = self.services.len(), "Shutting down all services");
        self.shutdown.trigger();

        let handles: Vec<ServiceHandle> = self.services.iter().map(|e| e.handle.clone()).collect();
        let waited = tokio::time::timeout(self.shutdown_timeout, async {
            for handle in &handles {
                let state = handle.terminated().await;
                tracing::debug!(service_id = %handle.service_id, %state, "Service finished");
            }
        })
        .await;

        self.services.retain(|_, entry| !entry.handle.state().is_terminal());
        if waited.is_err() {
            tracing::warn!(remaining = self.services.len(), "Some services did not stop within timeout");
            return Err(ServiceError::StopTimedOut);
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<(String, ServiceState)> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), entry.handle.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Task Loop
// ─────────────────────────────────────────────────────────────────────────────

struct ServiceLoop {
    ctx: ServiceContext,
    stop: StopTrigger,
    commands: mpsc::Receiver<ServiceCommand>,
    global_stop: StopSignal,
    events: broadcast::Receiver<Event>,
    state: watch::Sender<ServiceState>,
    ticker: Option<Interval>,
    patterns: Vec<String>,
    stop_budget: Duration,
}

impl ServiceLoop {
    fn subscribed(&self, event: &Event) -> bool {
        self.patterns.iter().any(|pattern| event.matches(pattern))
    }

    async fn run<S: Service>(mut self, mut service: S) -> ServiceResult<()> {
        let id = self.ctx.service_id.clone();

        if let Err(e) = service.on_start(&self.ctx).await {
            tracing::error!(service_id = %id, error = %e, "Service failed to start");
            self.stop.trigger();
            self.state.send_replace(ServiceState::Failed);
            return Err(e);
        }
        self.state.send_replace(ServiceState::Running);
        tracing::info!(service_id = %id, "Service started");

        loop {
            let event = tokio::select! {
                _ = self.global_stop.stopped() => break,
                command = self.commands.recv() => match command {
                    Some(ServiceCommand::Flush(done)) => {
                        let _ = done.send(());
                        continue;
                    }
                    Some(ServiceCommand::Stop) | None => break,
                },
                received = self.events.recv() => match received {
                    Ok(event) if self.subscribed(&event) => event,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(service_id = %id, skipped, "Event receiver lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = next_tick(&mut self.ticker) => {
                    if let Err(e) = service.on_tick(&self.ctx).await {
                        tracing::warn!(service_id = %id, error = %e, "Error during tick");
                    }
                    continue;
                }
            };

            if let Err(e) = service.on_event(&self.ctx, event).await {
                tracing::warn!(service_id = %id, error = %e, "Error handling event");
            }
        }

        tracing::debug!(service_id = %id, "Service stopping");
        self.state.send_replace(ServiceState::Stopping);
        self.stop.trigger();

        let (outcome, result) = match tokio::time::timeout(self.stop_budget, service.on_stop(&self.ctx)).await {
            Ok(Ok(())) => (ServiceState::Stopped, Ok(())),
            Ok(Err(e)) => (ServiceState::Failed, Err(e)),
            Err(_) => (ServiceState::Failed, Err(ServiceError::StopTimedOut)),
        };
        match &result {
            Ok(()) => tracing::info!(service_id = %id, "Service stopped"),
            Err(e) => tracing::error!(service_id = %id, error = %e, "Service stop failed"),
        }
        self.state.send_replace(outcome);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::ServiceSpec;

    #[derive(Default)]
    struct Counters {
        started: AtomicUsize,
        stopped: AtomicUsize,
        events: AtomicUsize,
        background_exits: AtomicUsize,
    }

    struct CountingService {
        id: String,
        counters: Arc<Counters>,
        background: Option<JoinHandle<()>>,
    }

    impl CountingService {
        fn new(id: &str) -> (Self, Arc<Counters>) {
            let counters = Arc::new(Counters::default());
            (
                Self {
                    id: id.to_string(),
                    counters: Arc::clone(&counters),
                    background: None,
                },
                counters,
            )
        }
    }

    #[async_trait]
    impl Service for CountingService {
        fn spec(&self) -> ServiceSpec {
            ServiceSpec::new(&self.id, "Counting Service").subscribe("device/*")
        }

        async fn on_start(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
            self.counters.started.fetch_add(1, Ordering::SeqCst);
            let mut stop = ctx.stop_signal();
            let counters = Arc::clone(&self.counters);
            self.background = Some(tokio::spawn(async move {
                stop.stopped().await;
                counters.background_exits.fetch_add(1, Ordering::SeqCst);
            }));
            Ok(())
        }

        async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            if let Some(task) = self.background.take() {
                let _ = task.await;
            }
            self.counters.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_event(&mut self, _ctx: &ServiceContext, _event: Event) -> ServiceResult<()> {
            self.counters.events.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_spawn_and_stop_service() {
        let manager = ServiceManager::new();
        let (service, counters) = CountingService::new("counting");

        let handle = manager.spawn(service).await.unwrap();
        assert_eq!(handle.request_state().await.unwrap(), ServiceState::Running);
        assert_eq!(counters.started.load(Ordering::SeqCst), 1);

        manager.stop("counting").await.unwrap();

        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(counters.background_exits.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_event_routing_respects_subscriptions() {
        let manager = ServiceManager::new();
        let (service, counters) = CountingService::new("routing");
        let handle = manager.spawn(service).await.unwrap();
        handle.request_state().await.unwrap();

        manager.publish_event(Event::new("device/telemetry", "test", serde_json::json!({})));
        manager.publish_event(Event::new("bus/device-registered", "test", serde_json::json!({})));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(counters.events.load(Ordering::SeqCst), 1);
        manager.shutdown_all().await.unwrap();
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_service_id_rejected() {
        let manager = ServiceManager::new();
        let (first, _) = CountingService::new("single");
        let (second, _) = CountingService::new("single");

        manager.spawn(first).await.unwrap();
        let result = manager.spawn(second).await;
        assert!(matches!(result, Err(ServiceError::DuplicateId(_))));

        manager.shutdown_all().await.unwrap();
    }

    struct FailingService;

    #[async_trait]
    impl Service for FailingService {
        fn spec(&self) -> ServiceSpec {
            ServiceSpec::new("failing", "Failing Service")
        }

        async fn on_start(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            Err(ServiceError::StartFailed("no link".into()))
        }

        async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_start_is_terminal() {
        let manager = ServiceManager::new();
        let handle = manager.spawn(FailingService).await.unwrap();

        assert_eq!(handle.terminated().await, ServiceState::Failed);
        assert!(matches!(
            manager.stop("failing").await,
            Err(ServiceError::StartFailed(_))
        ));
    }
}

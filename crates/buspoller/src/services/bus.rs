//! Bus service: runs the line observer and the topology broadcaster as two
//! background tasks sharing the registry and the response signal.

use std::sync::Arc;

use async_trait::async_trait;
use buspoller_service::{Service, ServiceContext, ServiceError, ServiceResult, ServiceSpec};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::broadcaster::{LegacyProbe, TopologyBroadcaster};
use crate::config::BusConfig;
use crate::link::{LinkRx, LinkTx};
use crate::observer::LineObserver;
use crate::registry::DeviceRegistry;
use crate::signal::ResponseSignal;

pub const BUS_SERVICE_ID: &str = "bus";

pub struct BusService<R> {
    tx: Arc<dyn LinkTx>,
    rx: Mutex<Option<R>>,
    registry: Arc<dyn DeviceRegistry>,
    signal: ResponseSignal,
    config: BusConfig,
    tasks: Vec<JoinHandle<()>>,
}

impl<R: LinkRx> BusService<R> {
    pub fn new(tx: Arc<dyn LinkTx>, rx: R, registry: Arc<dyn DeviceRegistry>, config: BusConfig) -> Self {
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            registry,
            signal: ResponseSignal::new(),
            config,
            tasks: Vec::new(),
        }
    }
}

#[async_trait]
impl<R: LinkRx> Service for BusService<R> {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new(BUS_SERVICE_ID, "Bus Link")
    }

    async fn on_start(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| ServiceError::StartFailed(format!("{BUS_SERVICE_ID}: link receiver already taken")))?;

        let observer = LineObserver::new(Arc::clone(&self.registry), self.signal.clone())
            .with_publisher(ctx.publisher());

        let broadcaster = TopologyBroadcaster::new(
            Arc::clone(&self.tx),
            Arc::clone(&self.registry),
            self.signal.clone(),
            self.config.timing.clone(),
            self.config.network.command_port,
        )
        .with_legacy_probe(LegacyProbe::from_config(&self.config.legacy));

        self.tasks.push(tokio::spawn(observer.run(rx, ctx.stop_signal())));
        self.tasks.push(tokio::spawn(broadcaster.run(ctx.stop_signal())));

        tracing::info!(
            command_port = self.config.network.command_port,
            max_devices = self.config.max_devices,
            "Bus service started"
        );
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = ?e, "Bus task panicked");
            }
        }
        tracing::info!(devices = self.registry.len(), "Bus service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use buspoller_service::{ServiceManager, ServiceState};

    use super::*;
    use crate::device::{LinkAddress, SerialNumber};
    use crate::frame::Announcement;
    use crate::link::memory_link;
    use crate::observer::EVENT_DEVICE_REGISTERED;
    use crate::registry::MemoryRegistry;

    #[tokio::test(start_paused = true)]
    async fn test_announced_device_is_polled() {
        let manager = ServiceManager::new();
        let mut events = manager.event_publisher().subscribe();
        let (tx, rx, mut sim) = memory_link();
        let registry = Arc::new(MemoryRegistry::new());
        let service = BusService::new(Arc::new(tx), rx, registry.clone(), BusConfig::default());

        let handle = manager.spawn(service).await.unwrap();
        assert_eq!(handle.request_state().await.unwrap(), ServiceState::Running);

        let address = LinkAddress::new(20, 84);
        let frame = Announcement {
            address,
            serial: SerialNumber(*b"SN0000000000000001"),
        }
        .to_frame(Ipv4Addr::new(169, 254, 255, 255), 30000);
        sim.reply(frame);

        let registered = events.recv().await.unwrap();
        assert_eq!(registered.event_type, EVENT_DEVICE_REGISTERED);
        assert_eq!(registry.len(), 1);

        // Polling starts once the settle time after the first broadcast has passed.
        tokio::time::sleep(Duration::from_millis(4600)).await;
        let poll = crate::link::SentFrame::Datagram(bytes::Bytes::from_static(&[169, 254, 20, 84]));
        assert!(sim.drain_sent().contains(&poll));

        manager.shutdown_all().await.unwrap();
        assert_eq!(handle.state(), ServiceState::Stopped);
    }
}

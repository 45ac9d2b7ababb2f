//! Service Handle

use tokio::sync::{mpsc, oneshot, watch};

use super::{ServiceError, ServiceResult};

/// Lifecycle position of a service. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ServiceState {
    pub fn is_terminal(self) -> bool {
        self >= ServiceState::Stopped
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        })
    }
}

/// Requests queued to one service loop, processed in order
pub(crate) enum ServiceCommand {
    Flush(oneshot::Sender<()>),
    Stop,
}

/// Cloneable handle to a spawned service
#[derive(Clone)]
pub struct ServiceHandle {
    pub service_id: String,
    commands: mpsc::Sender<ServiceCommand>,
    state: watch::Receiver<ServiceState>,
}

impl ServiceHandle {
    pub(crate) fn new(
        service_id: String,
        commands: mpsc::Sender<ServiceCommand>,
        state: watch::Receiver<ServiceState>,
    ) -> Self {
        Self {
            service_id,
            commands,
            state,
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    pub async fn shutdown(&self) -> ServiceResult<()> {
        self.send(ServiceCommand::Stop).await
    }

    /// Wait until the service loop has worked through everything queued
    /// before this call, then report its state
    pub async fn request_state(&self) -> ServiceResult<ServiceState> {
        let (tx, rx) = oneshot::channel();
        self.send(ServiceCommand::Flush(tx)).await?;
        rx.await.map_err(|_| ServiceError::ChannelClosed)?;
        Ok(self.state())
    }

    /// Resolve once the service reaches `Stopped` or `Failed`
    pub async fn terminated(&self) -> ServiceState {
        let mut state = self.state.clone();
        match state.wait_for(|s| s.is_terminal()).await {
            Ok(reached) => *reached,
            // The loop is gone without reporting; treat as failed.
            Err(_) => ServiceState::Failed,
        }
    }

    async fn send(&self, command: ServiceCommand) -> ServiceResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ServiceError::NotRunning(self.service_id.clone()))
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("service_id", &self.service_id)
            .field("state", &self.state())
            .finish()
    }
}

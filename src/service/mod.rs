//! Host-process lifecycle: a small service-control state machine that drives
//! a [`Lifecycle`] from control requests, plus the foreground runner.

#[cfg(windows)]
pub mod windows;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::sync::{Lifecycle, SyncError};

/// States reported to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Running,
    StopPending,
    Stopped,
}

/// Commands a host can send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Re-report the current status
    Interrogate,
    Stop,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    /// Whether Stop/Shutdown are accepted in this state
    pub accepts_stop: bool,
    /// Non-zero once stopped after a failure
    pub exit_code: u32,
}

impl ServiceStatus {
    fn new(state: ServiceState, exit_code: u32) -> Self {
        ServiceStatus {
            state,
            accepts_stop: state == ServiceState::Running,
            exit_code,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to start: {0}")]
    Start(#[source] SyncError),
    #[error("stopped unexpectedly: {0}")]
    Failed(#[source] SyncError),
    #[error("failed to stop cleanly: {0}")]
    Stop(#[source] SyncError),
}

/// Drives one [`Lifecycle`] through `Starting → Running → StopPending → Stopped`
pub struct ServiceHost<L> {
    lifecycle: L,
    status: mpsc::UnboundedSender<ServiceStatus>,
    current: ServiceStatus,
}

impl<L: Lifecycle> ServiceHost<L> {
    pub fn new(lifecycle: L, status: mpsc::UnboundedSender<ServiceStatus>) -> Self {
        ServiceHost {
            lifecycle,
            status,
            current: ServiceStatus::new(ServiceState::Starting, 0),
        }
    }

    /// Run until a stop request arrives, the request channel closes, or the
    /// lifecycle ends on its own.
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<ControlRequest>,
    ) -> Result<(), ServiceError> {
        self.report(ServiceState::Starting, 0);

        let cancel = CancellationToken::new();
        if let Err(e) = self.lifecycle.start(cancel.clone()).await {
            tracing::error!(error = %e, "error starting service");
            self.report(ServiceState::Stopped, 1);
            return Err(ServiceError::Start(e));
        }

        self.report(ServiceState::Running, 0);

        let failure = loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(ControlRequest::Interrogate) => {
                        let _ = self.status.send(self.current);
                    }
                    Some(ControlRequest::Stop) | Some(ControlRequest::Shutdown) => {
                        tracing::info!(?request, "stop requested");
                        break None;
                    }
                    None => {
                        tracing::info!("control channel closed");
                        break None;
                    }
                },
                ended = self.lifecycle.wait() => break ended.err(),
            }
        };

        self.report(ServiceState::StopPending, 0);
        cancel.cancel();
        let stopped = self.lifecycle.stop().await;

        let exit_code = if failure.is_some() || stopped.is_err() { 1 } else { 0 };
        self.report(ServiceState::Stopped, exit_code);

        match (failure, stopped) {
            (Some(e), _) => Err(ServiceError::Failed(e)),
            (None, Err(e)) => Err(ServiceError::Stop(e)),
            (None, Ok(())) => Ok(()),
        }
    }

    fn report(&mut self, state: ServiceState, exit_code: u32) {
        if state != self.current.state {
            tracing::info!(from = ?self.current.state, to = ?state, "service state changed");
        }
        self.current = ServiceStatus::new(state, exit_code);
        let _ = self.status.send(self.current);
    }
}

/// Run in the foreground until Ctrl+C (or SIGTERM on unix)
pub async fn run_foreground<L: Lifecycle>(lifecycle: L) -> Result<(), ServiceError> {
    let (request_tx, request_rx) = mpsc::channel(4);
    let (status_tx, mut status_rx) = mpsc::unbounded_channel::<ServiceStatus>();

    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutting down");
        let _ = request_tx.send(ControlRequest::Stop).await;
    });

    tokio::spawn(async move {
        while let Some(status) = status_rx.recv().await {
            if status.state == ServiceState::Running {
                tracing::info!("running, press Ctrl+C to stop");
            }
        }
    });

    ServiceHost::new(lifecycle, status_tx).run(request_rx).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

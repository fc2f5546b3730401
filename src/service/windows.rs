//! Windows Service Control Manager integration.
//!
//! SCM control events become [`ControlRequest`]s for the [`ServiceHost`], and
//! every status the host reports is forwarded back to the SCM.

use std::ffi::OsString;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::mpsc;
use windows_service::service::{
    ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState as ScmState,
    ServiceStatus as ScmStatus, ServiceType,
};
use windows_service::service_control_handler::{self, ServiceControlHandlerResult};
use windows_service::{define_windows_service, service_dispatcher};

use super::{ControlRequest, ServiceHost, ServiceState, ServiceStatus};
use crate::config::Config;

pub const SERVICE_NAME: &str = "SheetSync";

/// The process was not launched by the SCM
const ERROR_FAILED_SERVICE_CONTROLLER_CONNECT: i32 = 1063;

const PENDING_WAIT_HINT: Duration = Duration::from_secs(10);

// The dispatcher calls service_main without arguments we control
static SERVICE_CONFIG: OnceLock<Config> = OnceLock::new();

define_windows_service!(ffi_service_main, service_main);

/// Hand the process to the SCM dispatcher.
///
/// Returns `Ok(false)` when not started by the SCM, so the caller can run in
/// the foreground instead.
pub fn try_run_as_service(config: &Config) -> windows_service::Result<bool> {
    let _ = SERVICE_CONFIG.set(config.clone());

    match service_dispatcher::start(SERVICE_NAME, ffi_service_main) {
        Ok(()) => Ok(true),
        Err(windows_service::Error::Winapi(e))
            if e.raw_os_error() == Some(ERROR_FAILED_SERVICE_CONTROLLER_CONNECT) =>
        {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

fn service_main(_arguments: Vec<OsString>) {
    let Some(config) = SERVICE_CONFIG.get() else {
        return;
    };
    let config = with_service_log(config);
    let sink = crate::logging::init(&config);
    tracing::info!(log = ?sink, "{} service starting", SERVICE_NAME);

    if let Err(e) = run_service(&config) {
        tracing::error!(error = %e, "{} service failed", SERVICE_NAME);
    } else {
        tracing::info!("{} service stopped", SERVICE_NAME);
    }
}

/// Default the log file to the executable's directory
fn with_service_log(config: &Config) -> Config {
    let dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    match dir {
        Some(dir) => config.clone().with_default_log_path(&dir),
        None => config.clone(),
    }
}

fn run_service(config: &Config) -> anyhow::Result<()> {
    let (request_tx, request_rx) = mpsc::channel(4);

    let handler = move |control| {
        let request = match control {
            ServiceControl::Interrogate => ControlRequest::Interrogate,
            ServiceControl::Stop => ControlRequest::Stop,
            ServiceControl::Shutdown => ControlRequest::Shutdown,
            other => {
                tracing::warn!(?other, "unexpected control request");
                return ServiceControlHandlerResult::NotImplemented;
            }
        };
        let _ = request_tx.try_send(request);
        ServiceControlHandlerResult::NoError
    };
    let status_handle = service_control_handler::register(SERVICE_NAME, handler)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (status_tx, mut status_rx) = mpsc::unbounded_channel::<ServiceStatus>();
        let forward = tokio::spawn(async move {
            while let Some(status) = status_rx.recv().await {
                if let Err(e) = status_handle.set_service_status(to_scm(status)) {
                    tracing::warn!(error = %e, "failed to report service status");
                }
            }
        });

        let result = match crate::build_orchestrator(config) {
            Ok(orchestrator) => ServiceHost::new(orchestrator, status_tx)
                .run(request_rx)
                .await
                .map_err(anyhow::Error::from),
            Err(e) => {
                let _ = status_tx.send(ServiceStatus::new(ServiceState::Stopped, 1));
                drop(status_tx);
                Err(e.into())
            }
        };

        let _ = forward.await;
        result
    })
}

fn to_scm(status: ServiceStatus) -> ScmStatus {
    let current_state = match status.state {
        ServiceState::Starting => ScmState::StartPending,
        ServiceState::Running => ScmState::Running,
        ServiceState::StopPending => ScmState::StopPending,
        ServiceState::Stopped => ScmState::Stopped,
    };
    let controls_accepted = if status.accepts_stop {
        ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN
    } else {
        ServiceControlAccept::empty()
    };
    let wait_hint = match status.state {
        ServiceState::Starting | ServiceState::StopPending => PENDING_WAIT_HINT,
        _ => Duration::default(),
    };

    ScmStatus {
        service_type: ServiceType::OWN_PROCESS,
        current_state,
        controls_accepted,
        exit_code: ServiceExitCode::Win32(status.exit_code),
        checkpoint: 0,
        wait_hint,
        process_id: None,
    }
}

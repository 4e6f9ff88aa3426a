use std::time::Duration;

use berth_instance::{InstanceConfig, InstanceId};

use crate::paths::InstanceLayout;
use crate::registry::LogSink;

pub mod docker;
pub mod native;

pub use docker::DockerBackend;
pub use native::NativeBackend;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn graceful_stop_grace() -> Duration {
    Duration::from_secs(
        env_u64("BERTH_GRACEFUL_STOP_GRACE_SEC")
            .map(|v| v.clamp(1, 60))
            .unwrap_or(5),
    )
}

/// Backend-level bind conflict, carried through anyhow so the controller can
/// surface it as `PortUnavailable` rather than a generic start failure.
#[derive(Debug, thiserror::Error)]
#[error("port {0} is already in use")]
pub struct PortInUse(pub u16);

/// Live handle to a started backend. Exclusively owned by the registry
/// entry; never cloned or shared.
#[derive(Debug)]
pub enum BackendHandle {
    Process(tokio::process::Child),
    Container {
        name: String,
        /// `docker logs -f` child feeding the log buffer.
        log_pump: Option<tokio::process::Child>,
    },
}

impl BackendHandle {
    /// Pid (native) or container name (docker), for snapshots.
    pub fn label(&self) -> Option<String> {
        match self {
            Self::Process(child) => child.id().map(|pid| pid.to_string()),
            Self::Container { name, .. } => Some(name.clone()),
        }
    }
}

/// How a stop completed. `Forced` means the process ignored the termination
/// signal and had to be killed; the instance still ends up stopped. A forced
/// container removal is not an escalation worth reporting, so the docker
/// backend only ever returns `Graceful`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Graceful { exit_code: Option<i32> },
    Forced,
}

pub struct StartRequest<'a> {
    pub id: &'a InstanceId,
    pub config: &'a InstanceConfig,
    pub layout: &'a InstanceLayout,
    pub sink: LogSink,
}

/// Execution strategy for one instance, selected once at creation time.
/// All mode-specific behavior lives behind this trait; nothing outside the
/// implementations branches on the execution mode.
#[async_trait::async_trait]
pub trait InstanceBackend: Send + Sync {
    /// Spawn the instance and verify it came up. Failures must leave a
    /// diagnostic trail in the request's sink before returning.
    async fn start(&self, req: StartRequest<'_>) -> anyhow::Result<BackendHandle>;

    /// Graceful stop with bounded wait, escalating rather than hanging.
    async fn stop(
        &self,
        id: &InstanceId,
        handle: BackendHandle,
        sink: &LogSink,
    ) -> anyhow::Result<StopOutcome>;

    /// Whether the backing runtime is installed, and its version string.
    async fn installed(&self) -> (bool, Option<String>);
}

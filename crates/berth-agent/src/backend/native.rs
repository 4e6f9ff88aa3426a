use std::time::Duration;

use anyhow::Context as _;
use berth_instance::{InstanceId, LogSource};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::process::Command;

use super::{
    BackendHandle, InstanceBackend, StartRequest, StopOutcome, env_u64, graceful_stop_grace,
};
use crate::registry::LogSink;

fn start_grace() -> Duration {
    Duration::from_millis(
        env_u64("BERTH_START_GRACE_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(1500),
    )
}

#[cfg(unix)]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        // If the agent dies, make sure orphaned servers are terminated.
        let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
        if rc == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Runs instances as `redis-server <config>` OS processes.
pub struct NativeBackend {
    binary: String,
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self {
            binary: "redis-server".to_string(),
        }
    }
}

impl NativeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the spawned binary (test fixtures).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn pump_output(child: &mut tokio::process::Child, sink: &LogSink) {
        if let Some(out) = child.stdout.take() {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.emit(LogSource::Stdout, line).await;
                }
            });
        }
        if let Some(err) = child.stderr.take() {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.emit(LogSource::Stderr, line).await;
                }
            });
        }
    }
}

/// Validate availability of the declared port before spawning; redis-server
/// would otherwise exit during the grace window with a less useful message.
fn ensure_port_free(port: u16) -> anyhow::Result<()> {
    match std::net::TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => {
            l.set_nonblocking(true).ok();
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            Err(super::PortInUse(port).into())
        }
        Err(e) => Err(e).with_context(|| format!("bind port {port}")),
    }
}

#[async_trait::async_trait]
impl InstanceBackend for NativeBackend {
    async fn start(&self, req: StartRequest<'_>) -> anyhow::Result<BackendHandle> {
        ensure_port_free(req.config.port)?;

        let config_path = &req.layout.config_path;
        req.sink
            .emit(
                LogSource::Agent,
                format!("spawning {} {}", self.binary, config_path.display()),
            )
            .await;

        let mut cmd = Command::new(&self.binary);
        cmd.arg(config_path)
            .current_dir(&req.layout.instance_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {} (config {})", self.binary, config_path.display()))?;
        let pid = child.id();
        Self::pump_output(&mut child, &req.sink);

        req.sink
            .emit(
                LogSource::Agent,
                format!("process spawned (pid {})", pid.unwrap_or_default()),
            )
            .await;

        // Short liveness grace: a bad config or an occupied port makes
        // redis-server exit almost immediately.
        tokio::time::sleep(start_grace()).await;
        if let Some(status) = child.try_wait().context("check process liveness")? {
            let detail = format!(
                "process exited during startup (exit code {:?})",
                status.code()
            );
            req.sink.emit(LogSource::Agent, detail.clone()).await;
            anyhow::bail!("{detail}");
        }

        Ok(BackendHandle::Process(child))
    }

    async fn stop(
        &self,
        id: &InstanceId,
        handle: BackendHandle,
        sink: &LogSink,
    ) -> anyhow::Result<StopOutcome> {
        let BackendHandle::Process(mut child) = handle else {
            anyhow::bail!("native stop called with a container handle for {id}");
        };

        let grace = graceful_stop_grace();
        if let Some(pid) = child.id() {
            sink.emit(
                LogSource::Agent,
                format!("sending SIGTERM to pid {pid} (grace {}s)", grace.as_secs()),
            )
            .await;
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(res) => {
                let status = res.context("wait for process exit")?;
                sink.emit(
                    LogSource::Agent,
                    format!("process exited (exit code {:?})", status.code()),
                )
                .await;
                Ok(StopOutcome::Graceful {
                    exit_code: status.code(),
                })
            }
            Err(_) => {
                sink.emit(
                    LogSource::Agent,
                    "graceful stop timed out; sending SIGKILL",
                )
                .await;
                child.kill().await.context("kill process")?;
                Ok(StopOutcome::Forced)
            }
        }
    }

    async fn installed(&self) -> (bool, Option<String>) {
        crate::probe::redis_server_installed_at(&self.binary).await
    }
}

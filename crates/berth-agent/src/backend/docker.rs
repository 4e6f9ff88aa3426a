use std::process::Output;
use std::time::Duration;

use anyhow::Context as _;
use berth_instance::{InstanceConfig, InstanceId, LogSource};
use tokio::io::{AsyncBufReadExt as _, BufReader};

use super::{
    BackendHandle, InstanceBackend, StartRequest, StopOutcome, env_u64, graceful_stop_grace,
};
use crate::config::CONTAINER_INTERNAL_PORT;
use crate::paths::InstanceLayout;
use crate::registry::LogSink;

const CONTAINER_CONFIG_PATH: &str = "/usr/local/etc/redis/redis.conf";
const DEFAULT_IMAGE: &str = "redis:7-alpine";
const CLI_TIMEOUT: Duration = Duration::from_secs(30);
const PING_ATTEMPTS: u32 = 3;
const PING_BACKOFF: Duration = Duration::from_millis(500);
const DIAGNOSTIC_LOG_TAIL: usize = 50;

fn verify_settle() -> Duration {
    Duration::from_millis(
        env_u64("BERTH_VERIFY_SETTLE_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(1000),
    )
}

fn verify_retries() -> u32 {
    env_u64("BERTH_VERIFY_RETRIES")
        .map(|v| v.clamp(1, 100) as u32)
        .unwrap_or(10)
}

fn verify_retry_delay() -> Duration {
    Duration::from_millis(
        env_u64("BERTH_VERIFY_RETRY_DELAY_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(1000),
    )
}

fn redis_image() -> String {
    std::env::var("BERTH_REDIS_IMAGE").unwrap_or_else(|_| DEFAULT_IMAGE.to_string())
}

/// Deterministic container name; collisions across instances are impossible
/// because ids are unique.
pub fn container_name(id: &InstanceId) -> String {
    format!("berth-redis-{}", id.0)
}

fn run_args(name: &str, config: &InstanceConfig, layout: &InstanceLayout, image: &str) -> Vec<String> {
    vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        name.to_string(),
        "-p".to_string(),
        format!("{}:{CONTAINER_INTERNAL_PORT}", config.port),
        "-v".to_string(),
        format!("{}:/data", layout.data_dir.display()),
        "-v".to_string(),
        format!("{}:{CONTAINER_CONFIG_PATH}:ro", layout.config_path.display()),
        image.to_string(),
        "redis-server".to_string(),
        CONTAINER_CONFIG_PATH.to_string(),
    ]
}

/// Thin wrapper over the docker CLI. Every invocation carries a timeout so a
/// wedged daemon never hangs a lifecycle operation.
#[derive(Debug, Clone)]
pub struct DockerClient {
    program: String,
}

impl Default for DockerClient {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }
}

impl DockerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the invoked program (test fixtures).
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> anyhow::Result<Output> {
        let result = tokio::time::timeout(
            timeout,
            tokio::process::Command::new(&self.program)
                .args(args)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(e).with_context(|| format!("exec {} {}", self.program, args.join(" "))),
            Err(_) => anyhow::bail!(
                "{} {} timed out after {}ms",
                self.program,
                args.join(" "),
                timeout.as_millis()
            ),
        }
    }

    /// Force-remove a container. Missing container is not an error.
    pub async fn rm_force(&self, container: &str) -> anyhow::Result<()> {
        let output = self.run(&["rm", "-f", container], CLI_TIMEOUT).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            return Ok(());
        }
        anyhow::bail!("docker rm -f {container}: {}", stderr.trim());
    }

    /// Is the container present in the *running* set.
    pub async fn is_running(&self, container: &str) -> bool {
        let filter = format!("name=^{container}$");
        match self
            .run(&["ps", "-q", "--filter", &filter], CLI_TIMEOUT)
            .await
        {
            Ok(o) if o.status.success() => !o.stdout.is_empty(),
            _ => false,
        }
    }

    /// Does the container exist at all (running or exited).
    pub async fn exists(&self, container: &str) -> bool {
        let filter = format!("name=^{container}$");
        match self
            .run(&["ps", "-aq", "--filter", &filter], CLI_TIMEOUT)
            .await
        {
            Ok(o) if o.status.success() => !o.stdout.is_empty(),
            _ => false,
        }
    }

    pub async fn logs_tail(&self, container: &str, tail: usize) -> anyhow::Result<String> {
        let tail = tail.to_string();
        let output = self
            .run(&["logs", "--tail", &tail, container], CLI_TIMEOUT)
            .await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    /// `redis-cli ping` inside the container.
    pub async fn ping_inside(&self, container: &str) -> bool {
        match self
            .run(
                &["exec", container, "redis-cli", "ping"],
                Duration::from_secs(5),
            )
            .await
        {
            Ok(o) if o.status.success() => {
                String::from_utf8_lossy(&o.stdout).trim().eq_ignore_ascii_case("pong")
            }
            _ => false,
        }
    }

    pub async fn stop_graceful(&self, container: &str, grace: Duration) -> anyhow::Result<()> {
        let grace_secs = grace.as_secs().max(1).to_string();
        let timeout = grace + CLI_TIMEOUT;
        let output = self
            .run(&["stop", "-t", &grace_secs, container], timeout)
            .await?;
        if output.status.success() {
            return Ok(());
        }
        anyhow::bail!(
            "docker stop {container}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    pub async fn version(&self) -> Option<String> {
        let output = self.run(&["--version"], Duration::from_secs(5)).await.ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Timing knobs for start verification, resolved once from the environment.
#[derive(Debug, Clone)]
pub struct VerifyPolicy {
    pub settle: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
    pub ping_attempts: u32,
    pub ping_backoff: Duration,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            settle: verify_settle(),
            retries: verify_retries(),
            retry_delay: verify_retry_delay(),
            ping_attempts: PING_ATTEMPTS,
            ping_backoff: PING_BACKOFF,
        }
    }
}

/// Runs instances as port-mapped containers driven through the docker CLI.
pub struct DockerBackend {
    client: DockerClient,
    policy: VerifyPolicy,
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self {
            client: DockerClient::new(),
            policy: VerifyPolicy::default(),
        }
    }
}

impl DockerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: DockerClient) -> Self {
        Self {
            client,
            policy: VerifyPolicy::default(),
        }
    }

    /// Two-tier verification: container presence is fatal after exhausting
    /// retries, an unreachable ping is only a warning (some builds accept
    /// connections noticeably later than process start).
    async fn verify(&self, name: &str, sink: &LogSink) -> anyhow::Result<()> {
        tokio::time::sleep(self.policy.settle).await;

        let retries = self.policy.retries;
        for attempt in 1..=retries {
            if !self.client.is_running(name).await {
                if attempt == retries {
                    break;
                }
                tokio::time::sleep(self.policy.retry_delay).await;
                continue;
            }

            for ping in 1..=self.policy.ping_attempts {
                if self.client.ping_inside(name).await {
                    sink.emit(LogSource::Agent, "container verified (ping ok)").await;
                    return Ok(());
                }
                if ping < self.policy.ping_attempts {
                    tokio::time::sleep(self.policy.ping_backoff).await;
                }
            }

            // Container is up but not answering yet; treat as started.
            sink.emit(
                LogSource::Agent,
                format!(
                    "container is running but did not answer ping after {} attempts",
                    self.policy.ping_attempts
                ),
            )
            .await;
            return Ok(());
        }

        self.collect_diagnostics(name, sink).await;
        anyhow::bail!("container {name} did not appear in the running set after {retries} checks");
    }

    async fn collect_diagnostics(&self, name: &str, sink: &LogSink) {
        let exists = self.client.exists(name).await;
        sink.emit(
            LogSource::Agent,
            format!("container exists (any state): {exists}"),
        )
        .await;
        match self.client.logs_tail(name, DIAGNOSTIC_LOG_TAIL).await {
            Ok(logs) if !logs.trim().is_empty() => {
                for line in logs.lines() {
                    sink.emit(LogSource::Stdout, line).await;
                }
            }
            Ok(_) => sink.emit(LogSource::Agent, "container produced no logs").await,
            Err(e) => {
                sink.emit(
                    LogSource::Agent,
                    format!("failed to collect container logs: {e}"),
                )
                .await;
            }
        }
    }

    fn pump_container_logs(&self, name: &str, sink: &LogSink) -> Option<tokio::process::Child> {
        let mut child = tokio::process::Command::new(&self.client.program)
            .args(["logs", "-f", "--tail", "0", name])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .ok()?;

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
        Some(child)
    }
}

#[async_trait::async_trait]
impl InstanceBackend for DockerBackend {
    async fn start(&self, req: StartRequest<'_>) -> anyhow::Result<BackendHandle> {
        let name = container_name(req.id);
        let image = redis_image();

        // A stale container from a crashed agent would collide on the name.
        self.client
            .rm_force(&name)
            .await
            .context("remove stale container")?;

        let args = run_args(&name, req.config, req.layout, &image);
        req.sink
            .emit(LogSource::Agent, format!("docker {}", args.join(" ")))
            .await;

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self
            .client
            .run(&arg_refs, CLI_TIMEOUT)
            .await
            .context("run container")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            req.sink
                .emit(LogSource::Agent, format!("docker run failed: {stderr}"))
                .await;
            anyhow::bail!("docker run failed: {stderr}");
        }

        self.verify(&name, &req.sink).await?;

        let log_pump = self.pump_container_logs(&name, &req.sink);
        Ok(BackendHandle::Container { name, log_pump })
    }

    async fn stop(
        &self,
        id: &InstanceId,
        handle: BackendHandle,
        sink: &LogSink,
    ) -> anyhow::Result<StopOutcome> {
        let BackendHandle::Container { name, log_pump } = handle else {
            anyhow::bail!("docker stop called with a process handle for {id}");
        };

        if let Some(mut pump) = log_pump {
            let _ = pump.start_kill();
        }

        let grace = graceful_stop_grace();
        sink.emit(
            LogSource::Agent,
            format!("stopping container {name} (grace {}s)", grace.as_secs()),
        )
        .await;

        if let Err(e) = self.client.stop_graceful(&name, grace).await {
            sink.emit(
                LogSource::Agent,
                format!("graceful container stop failed ({e}); forcing removal"),
            )
            .await;
            self.client
                .rm_force(&name)
                .await
                .context("force-remove container")?;
            // Forced removal still tears the container down cleanly, so
            // from the caller's view the stop succeeded.
            return Ok(StopOutcome::Graceful { exit_code: None });
        }

        // The exited container would otherwise squat on the name.
        if let Err(e) = self.client.rm_force(&name).await {
            sink.emit(
                LogSource::Agent,
                format!("failed to remove stopped container: {e}"),
            )
            .await;
        }

        sink.emit(LogSource::Agent, "container stopped").await;
        Ok(StopOutcome::Graceful { exit_code: None })
    }

    async fn installed(&self) -> (bool, Option<String>) {
        match self.client.version().await {
            Some(v) => (true, Some(v)),
            None => (false, None),
        }
    }
}

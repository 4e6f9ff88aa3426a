use chrono::{DateTime, Utc};
use specta::Type;

/// Stable instance identifier. Generated by the agent, never user-supplied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Fixed at creation; the backend never changes for an instance's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Native,
    Docker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    Noeviction,
    AllkeysLru,
    VolatileLru,
    AllkeysRandom,
    VolatileRandom,
    VolatileTtl,
    AllkeysLfu,
    VolatileLfu,
}

impl EvictionPolicy {
    pub fn as_directive(&self) -> &'static str {
        match self {
            Self::Noeviction => "noeviction",
            Self::AllkeysLru => "allkeys-lru",
            Self::VolatileLru => "volatile-lru",
            Self::AllkeysRandom => "allkeys-random",
            Self::VolatileRandom => "volatile-random",
            Self::VolatileTtl => "volatile-ttl",
            Self::AllkeysLfu => "allkeys-lfu",
            Self::VolatileLfu => "volatile-lfu",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Verbose,
    Notice,
    Warning,
}

impl LogLevel {
    pub fn as_directive(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Verbose => "verbose",
            Self::Notice => "notice",
            Self::Warning => "warning",
        }
    }
}

/// Declared configuration for a managed Redis server.
///
/// Optional fields are only rendered into the generated config when present.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct InstanceConfig {
    pub port: u16,
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub maxmemory: Option<String>,
    #[serde(default)]
    pub eviction_policy: Option<EvictionPolicy>,
    #[serde(default)]
    pub appendonly: bool,
    #[serde(default = "default_true")]
    pub snapshotting: bool,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub databases: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u32>,
    #[serde(default)]
    pub log_level: Option<LogLevel>,
}

fn default_true() -> bool {
    true
}

impl InstanceConfig {
    pub fn new(port: u16, execution_mode: ExecutionMode) -> Self {
        Self {
            port,
            execution_mode,
            maxmemory: None,
            eviction_policy: None,
            appendonly: false,
            snapshotting: true,
            password: None,
            bind: None,
            databases: None,
            timeout_secs: None,
            log_level: None,
        }
    }

    /// Copy with the password blanked, for snapshots handed to the UI.
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        if out.password.is_some() {
            out.password = Some("<redacted>".to_string());
        }
        out
    }
}

/// Durable record, one per instance. `was_running` drives auto-start after
/// an agent restart.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub name: String,
    pub config: InstanceConfig,
    pub status: InstanceState,
    pub was_running: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    Agent,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub source: LogSource,
    pub text: String,
}

impl LogLine {
    pub fn now(source: LogSource, text: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            source,
            text: text.into(),
        }
    }
}

impl std::fmt::Display for LogLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.source {
            LogSource::Stdout => "stdout",
            LogSource::Stderr => "stderr",
            LogSource::Agent => "agent",
        };
        write!(f, "{} [{tag}] {}", self.at.to_rfc3339(), self.text)
    }
}

/// Point-in-time view of a runtime instance, safe to hand to the API layer.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub name: String,
    pub config: InstanceConfig,
    pub state: InstanceState,
    /// Pid (native) or container name (docker) while running.
    pub handle: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub config_path: String,
    pub data_dir: String,
    /// Externally managed entries cannot be started/stopped/deleted.
    pub managed: bool,
    pub message: Option<String>,
}

/// Lifecycle events fanned out to subscribers, keyed by instance id.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InstanceEvent {
    Created { id: InstanceId },
    Started { id: InstanceId },
    Stopped { id: InstanceId, exit_code: Option<i32> },
    Deleted { id: InstanceId },
    Error { id: InstanceId, message: String },
    Log { id: InstanceId, line: LogLine },
}

impl InstanceEvent {
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::Created { id }
            | Self::Started { id }
            | Self::Stopped { id, .. }
            | Self::Deleted { id }
            | Self::Error { id, .. }
            | Self::Log { id, .. } => id,
        }
    }
}

use std::{path::PathBuf, sync::Arc};

use berth_instance::{
    ExecutionMode, InstanceConfig, InstanceEvent, InstanceId, InstanceRecord, InstanceSnapshot,
    InstanceState, LogLine, LogSource,
};
use chrono::Utc;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use crate::backend::{
    DockerBackend, InstanceBackend, NativeBackend, PortInUse, StartRequest, StopOutcome,
    graceful_stop_grace,
};
use crate::config;
use crate::error::{LifecycleError, format_error_chain};
use crate::events::EventHub;
use crate::paths;
use crate::persist::PersistenceAdapter;
use crate::probe;
use crate::registry::{InstanceEntry, InstanceRegistry, LogSink};
use crate::settings::SettingsProvider;

/// Reserved id of the synthetic entry representing the operator's external
/// Redis server. Never persisted, never startable/deletable.
pub const DEFAULT_INSTANCE_ID: &str = "default";

/// Installation probes for both execution backends, used by the API layer
/// to gate UI affordances.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RuntimeSupport {
    pub native_installed: bool,
    pub native_version: Option<String>,
    pub docker_installed: bool,
    pub docker_version: Option<String>,
}

/// Orchestrating core: owns the registry, drives the backend fixed at each
/// instance's creation, syncs transitions to persistence and fans out events.
/// Explicitly constructed and injected; multiple independent controllers can
/// coexist in one process.
pub struct LifecycleController {
    pub(crate) root: PathBuf,
    pub(crate) registry: InstanceRegistry,
    pub(crate) events: Arc<EventHub>,
    pub(crate) persistence: Arc<dyn PersistenceAdapter>,
    pub(crate) settings: Arc<dyn SettingsProvider>,
    native: Arc<dyn InstanceBackend>,
    docker: Arc<dyn InstanceBackend>,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleController {
    pub fn new(
        root: impl Into<PathBuf>,
        persistence: Arc<dyn PersistenceAdapter>,
        settings: Arc<dyn SettingsProvider>,
    ) -> Arc<Self> {
        Self::with_backends(
            root,
            persistence,
            settings,
            Arc::new(NativeBackend::new()),
            Arc::new(DockerBackend::new()),
        )
    }

    /// Construct with explicit backends (tests swap in doubles here).
    pub fn with_backends(
        root: impl Into<PathBuf>,
        persistence: Arc<dyn PersistenceAdapter>,
        settings: Arc<dyn SettingsProvider>,
        native: Arc<dyn InstanceBackend>,
        docker: Arc<dyn InstanceBackend>,
    ) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            registry: InstanceRegistry::new(),
            events: Arc::new(EventHub::new()),
            persistence,
            settings,
            native,
            docker,
            detector: Mutex::new(None),
        })
    }

    /// The one place an execution mode is mapped to a backend; the choice is
    /// recorded in the entry and never revisited.
    fn backend_for(&self, mode: ExecutionMode) -> Arc<dyn InstanceBackend> {
        match mode {
            ExecutionMode::Native => self.native.clone(),
            ExecutionMode::Docker => self.docker.clone(),
        }
    }

    fn sink_for(&self, entry: &InstanceEntry) -> LogSink {
        LogSink::new(
            entry.record.id.clone(),
            entry.logs.clone(),
            self.events.clone(),
        )
    }

    async fn persist_status(&self, id: &InstanceId, status: InstanceState, was_running: Option<bool>) {
        if let Err(e) = self.persistence.update_status(id, status, was_running).await {
            tracing::warn!(
                instance = %id,
                error = %format_error_chain(&e),
                "failed to persist status transition"
            );
        }
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    pub async fn create(
        &self,
        name: &str,
        config: InstanceConfig,
    ) -> Result<InstanceSnapshot, LifecycleError> {
        let port = config.port;
        if self.registry.ports_in_use(None).await.contains(&port) {
            return Err(LifecycleError::PortUnavailable {
                port,
                detail: "declared port is held by a running instance".to_string(),
            });
        }

        let id = InstanceId::new();
        let mode = config.execution_mode;
        let generated = config::generate(&self.root, &id.0, &config);
        tokio::fs::create_dir_all(&generated.layout.data_dir).await?;
        tokio::fs::write(&generated.layout.config_path, generated.text.as_bytes()).await?;

        let now = Utc::now();
        let record = InstanceRecord {
            id: id.clone(),
            name: name.trim().to_string(),
            config,
            status: InstanceState::Stopped,
            was_running: false,
            created_at: now,
            updated_at: now,
        };
        self.persistence
            .save_record(&record)
            .await
            .map_err(LifecycleError::Persistence)?;

        let entry = InstanceEntry::new(record, generated.layout, self.backend_for(mode));
        let sink = self.sink_for(&entry);
        self.registry.insert(entry).await;

        sink.emit(LogSource::Agent, "instance created").await;
        self.events
            .publish(InstanceEvent::Created { id: id.clone() })
            .await;
        tracing::info!(instance = %id, name, port, ?mode, "instance created");

        self.registry
            .snapshot(&id)
            .await
            .ok_or(LifecycleError::NotFound(id))
    }

    pub async fn start(&self, id: &InstanceId) -> Result<InstanceSnapshot, LifecycleError> {
        // Guard and the transition to Starting are atomic under the registry
        // lock: a second concurrent start can never pass the state check.
        let (config, layout, logs, backend) = {
            let mut map = self.registry.inner.lock().await;
            {
                let entry = map
                    .get(&id.0)
                    .ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
                if !entry.managed {
                    return Err(LifecycleError::InvalidOperation(format!(
                        "instance {id} is externally managed and cannot be started"
                    )));
                }
                match entry.record.status {
                    InstanceState::Running
                    | InstanceState::Starting
                    | InstanceState::Stopping => {
                        return Err(LifecycleError::AlreadyRunning(id.clone()));
                    }
                    InstanceState::Stopped | InstanceState::Error => {}
                }
                let port = entry.record.config.port;
                let conflict = map.values().any(|e| {
                    e.record.id != *id
                        && e.managed
                        && matches!(
                            e.record.status,
                            InstanceState::Running | InstanceState::Starting
                        )
                        && e.record.config.port == port
                });
                if conflict {
                    return Err(LifecycleError::PortUnavailable {
                        port,
                        detail: "declared port is held by another running instance".to_string(),
                    });
                }
            }
            let Some(entry) = map.get_mut(&id.0) else {
                return Err(LifecycleError::NotFound(id.clone()));
            };
            let Some(backend) = entry.backend.clone() else {
                return Err(LifecycleError::InvalidOperation(format!(
                    "instance {id} has no execution backend"
                )));
            };
            entry.record.status = InstanceState::Starting;
            entry.message = None;
            (
                entry.record.config.clone(),
                entry.layout.clone(),
                entry.logs.clone(),
                backend,
            )
        };

        let sink = LogSink::new(id.clone(), logs, self.events.clone());
        let request = StartRequest {
            id,
            config: &config,
            layout: &layout,
            sink: sink.clone(),
        };

        match backend.start(request).await {
            Ok(handle) => {
                let mut handle = Some(handle);
                let inserted = {
                    let mut map = self.registry.inner.lock().await;
                    if let Some(entry) = map.get_mut(&id.0) {
                        entry.record.status = InstanceState::Running;
                        entry.handle = handle.take();
                        entry.started_at = Some(Utc::now());
                        entry.message = None;
                        true
                    } else {
                        false
                    }
                };
                if !inserted {
                    // The entry vanished while the backend was spawning.
                    // Stop the fresh handle instead of orphaning a live
                    // server nothing can reach anymore.
                    if let Some(handle) = handle {
                        sink.emit(
                            LogSource::Agent,
                            "instance removed during start; stopping fresh backend",
                        )
                        .await;
                        if let Err(e) = backend.stop(id, handle, &sink).await {
                            tracing::warn!(
                                instance = %id,
                                error = %format_error_chain(&e),
                                "failed to stop orphaned backend"
                            );
                        }
                    }
                    return Err(LifecycleError::NotFound(id.clone()));
                }
                self.persist_status(id, InstanceState::Running, Some(true)).await;
                self.events
                    .publish(InstanceEvent::Started { id: id.clone() })
                    .await;
                tracing::info!(instance = %id, "instance started");
                self.registry
                    .snapshot(id)
                    .await
                    .ok_or_else(|| LifecycleError::NotFound(id.clone()))
            }
            Err(err) => {
                if let Some(PortInUse(port)) = err.downcast_ref::<PortInUse>() {
                    // The spawn never happened; the instance is simply still stopped.
                    let port = *port;
                    sink.emit(LogSource::Agent, format!("start aborted: {err}"))
                        .await;
                    {
                        let mut map = self.registry.inner.lock().await;
                        if let Some(entry) = map.get_mut(&id.0) {
                            entry.record.status = InstanceState::Stopped;
                        }
                    }
                    return Err(LifecycleError::PortUnavailable {
                        port,
                        detail: err.to_string(),
                    });
                }

                let detail = format_error_chain(&err);
                sink.emit(LogSource::Agent, format!("start failed: {detail}"))
                    .await;
                {
                    let mut map = self.registry.inner.lock().await;
                    if let Some(entry) = map.get_mut(&id.0) {
                        entry.record.status = InstanceState::Error;
                        entry.message = Some(detail.clone());
                        entry.handle = None;
                    }
                }
                self.persist_status(id, InstanceState::Error, Some(false)).await;
                self.events
                    .publish(InstanceEvent::Error {
                        id: id.clone(),
                        message: detail.clone(),
                    })
                    .await;
                tracing::warn!(instance = %id, detail, "instance start failed");
                Err(LifecycleError::StartFailed {
                    id: id.clone(),
                    detail,
                })
            }
        }
    }

    pub async fn stop(&self, id: &InstanceId) -> Result<InstanceSnapshot, LifecycleError> {
        if id.0 == DEFAULT_INSTANCE_ID {
            return self.stop_default(id).await;
        }

        let (handle, backend, logs) = {
            let mut map = self.registry.inner.lock().await;
            let Some(entry) = map.get_mut(&id.0) else {
                return Err(LifecycleError::NotFound(id.clone()));
            };
            if entry.record.status != InstanceState::Running {
                return Err(LifecycleError::NotRunning(id.clone()));
            }
            let Some(backend) = entry.backend.clone() else {
                return Err(LifecycleError::InvalidOperation(format!(
                    "instance {id} is externally managed and cannot be stopped here"
                )));
            };
            entry.record.status = InstanceState::Stopping;
            (entry.handle.take(), backend, entry.logs.clone())
        };

        let sink = LogSink::new(id.clone(), logs, self.events.clone());
        let Some(handle) = handle else {
            // Running without a handle only happens for entries we do not
            // own; normalize to stopped.
            self.finish_stop(id, None).await;
            return self
                .registry
                .snapshot(id)
                .await
                .ok_or_else(|| LifecycleError::NotFound(id.clone()));
        };

        match backend.stop(id, handle, &sink).await {
            Ok(StopOutcome::Graceful { exit_code }) => {
                self.finish_stop(id, exit_code).await;
                self.registry
                    .snapshot(id)
                    .await
                    .ok_or_else(|| LifecycleError::NotFound(id.clone()))
            }
            Ok(StopOutcome::Forced) => {
                self.finish_stop(id, None).await;
                Err(LifecycleError::StopTimeout {
                    id: id.clone(),
                    grace_ms: graceful_stop_grace().as_millis() as u64,
                })
            }
            Err(err) => {
                let detail = format_error_chain(&err);
                sink.emit(LogSource::Agent, format!("stop failed: {detail}"))
                    .await;
                {
                    let mut map = self.registry.inner.lock().await;
                    if let Some(entry) = map.get_mut(&id.0) {
                        entry.record.status = InstanceState::Error;
                        entry.message = Some(detail.clone());
                    }
                }
                self.persist_status(id, InstanceState::Error, Some(false)).await;
                self.events
                    .publish(InstanceEvent::Error {
                        id: id.clone(),
                        message: detail.clone(),
                    })
                    .await;
                Err(LifecycleError::Io(std::io::Error::other(detail)))
            }
        }
    }

    async fn finish_stop(&self, id: &InstanceId, exit_code: Option<i32>) {
        {
            let mut map = self.registry.inner.lock().await;
            if let Some(entry) = map.get_mut(&id.0) {
                entry.record.status = InstanceState::Stopped;
                entry.handle = None;
                entry.started_at = None;
            }
        }
        self.persist_status(id, InstanceState::Stopped, Some(false)).await;
        self.events
            .publish(InstanceEvent::Stopped {
                id: id.clone(),
                exit_code,
            })
            .await;
        tracing::info!(instance = %id, "instance stopped");
    }

    /// Best-effort shutdown of the externally managed default server. It may
    /// be under systemd or another supervisor; a refusal surfaces as
    /// `ExternallyManaged` and leaves the recorded status untouched.
    async fn stop_default(&self, id: &InstanceId) -> Result<InstanceSnapshot, LifecycleError> {
        let snapshot = self
            .registry
            .snapshot(id)
            .await
            .ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
        if snapshot.state != InstanceState::Running {
            return Err(LifecycleError::NotRunning(id.clone()));
        }

        let settings = self.settings.default_redis_settings().await;
        if let Err(e) =
            probe::shutdown(&settings.host, settings.port, settings.password.as_deref()).await
        {
            return Err(LifecycleError::ExternallyManaged {
                id: id.clone(),
                detail: format_error_chain(&e),
            });
        }

        {
            let mut map = self.registry.inner.lock().await;
            if let Some(entry) = map.get_mut(&id.0) {
                entry.record.status = InstanceState::Stopped;
                entry.started_at = None;
            }
        }
        self.events
            .publish(InstanceEvent::Stopped {
                id: id.clone(),
                exit_code: None,
            })
            .await;
        self.registry
            .snapshot(id)
            .await
            .ok_or_else(|| LifecycleError::NotFound(id.clone()))
    }

    /// Stops first when running. The generated config file is removed; the
    /// data directory is deliberately preserved.
    pub async fn delete(&self, id: &InstanceId) -> Result<(), LifecycleError> {
        if id.0 == DEFAULT_INSTANCE_ID {
            return Err(LifecycleError::InvalidOperation(
                "the default instance cannot be deleted".to_string(),
            ));
        }

        let snapshot = self
            .registry
            .snapshot(id)
            .await
            .ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
        match snapshot.state {
            // A transition is in flight; deleting now would race the
            // task that holds the live backend handle.
            InstanceState::Starting | InstanceState::Stopping => {
                return Err(LifecycleError::InvalidOperation(format!(
                    "instance {id} has a start or stop in flight; retry once it settles"
                )));
            }
            InstanceState::Running => match self.stop(id).await {
                Ok(_) => {}
                // Forced kill still leaves the instance stopped.
                Err(LifecycleError::StopTimeout { .. }) => {}
                Err(e) => return Err(e),
            },
            InstanceState::Stopped | InstanceState::Error => {}
        }

        match tokio::fs::remove_file(&snapshot.config_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.persistence
            .delete_record(id)
            .await
            .map_err(LifecycleError::Persistence)?;
        self.registry.remove(id).await;

        self.events
            .publish(InstanceEvent::Deleted { id: id.clone() })
            .await;
        self.events.remove(id).await;
        tracing::info!(instance = %id, "instance deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_instance(&self, id: &InstanceId) -> Result<InstanceSnapshot, LifecycleError> {
        self.registry
            .snapshot(id)
            .await
            .ok_or_else(|| LifecycleError::NotFound(id.clone()))
    }

    pub async fn list_instances(&self) -> Vec<InstanceSnapshot> {
        self.registry.list().await
    }

    /// Buffered log history. For the default entry a freshly probed status
    /// line (or a probe warning) is appended to the returned lines; the
    /// recorded status is not touched by a probe failure here.
    pub async fn get_logs(&self, id: &InstanceId) -> Result<Vec<LogLine>, LifecycleError> {
        let mut lines = self
            .registry
            .logs(id)
            .await
            .ok_or_else(|| LifecycleError::NotFound(id.clone()))?;

        if id.0 == DEFAULT_INSTANCE_ID {
            let s = self.settings.default_redis_settings().await;
            match probe::server_info(&s.host, s.port, s.password.as_deref()).await {
                Ok(info) => lines.push(LogLine::now(
                    LogSource::Agent,
                    format!(
                        "default redis reachable: version {} uptime {}s",
                        info.version, info.uptime_secs
                    ),
                )),
                Err(e) => lines.push(LogLine::now(
                    LogSource::Agent,
                    format!("warning: default redis probe failed: {}", format_error_chain(&e)),
                )),
            }
        }
        Ok(lines)
    }

    /// Live event stream for one instance plus the buffered history to
    /// replay before tailing. Dropping the receiver unsubscribes.
    pub async fn subscribe(
        &self,
        id: &InstanceId,
    ) -> Result<(Vec<LogLine>, broadcast::Receiver<InstanceEvent>), LifecycleError> {
        if !self.registry.contains(id).await {
            return Err(LifecycleError::NotFound(id.clone()));
        }
        // Subscribe before reading history so no line falls between the two.
        let rx = self.events.subscribe(id).await;
        let history = self.registry.logs(id).await.unwrap_or_default();
        Ok((history, rx))
    }

    pub async fn runtime_support(&self) -> RuntimeSupport {
        let (native_installed, native_version) = self.native.installed().await;
        let (docker_installed, docker_version) = self.docker.installed().await;
        RuntimeSupport {
            native_installed,
            native_version,
            docker_installed,
            docker_version,
        }
    }

    // ------------------------------------------------------------------
    // Startup / background tasks
    // ------------------------------------------------------------------

    /// Rebuild the registry from persisted records. Every record comes back
    /// as `stopped` (a previous agent's handles are unrecoverable); records
    /// flagged `was_running` are started in the background, each one
    /// independently so one failure never aborts the others.
    pub async fn rehydrate(self: &Arc<Self>) -> Result<(), LifecycleError> {
        let records = self
            .persistence
            .list_records()
            .await
            .map_err(LifecycleError::Persistence)?;

        let mut autostart = Vec::new();
        for mut record in records {
            // Record files can be hand-edited; an id with a path separator
            // would escape the instances directory.
            if !paths::is_safe_id(&record.id.0) {
                tracing::warn!(instance = %record.id, "skipping record with unsafe id");
                continue;
            }
            let was_running = record.was_running;
            record.status = InstanceState::Stopped;
            let layout = paths::layout_under(&self.root, &record.id.0);
            let backend = self.backend_for(record.config.execution_mode);
            let id = record.id.clone();
            self.registry
                .insert(InstanceEntry::new(record, layout, backend))
                .await;
            if was_running {
                autostart.push(id);
            }
        }

        tracing::info!(
            rehydrated = self.registry.list().await.len(),
            autostart = autostart.len(),
            "registry rehydrated"
        );

        for id in autostart {
            let ctrl = Arc::clone(self);
            tokio::spawn(async move {
                // start() already records the failure in the instance's own
                // log buffer and flips it to error.
                if let Err(e) = ctrl.start(&id).await {
                    tracing::warn!(instance = %id, error = %e, "auto-start after rehydration failed");
                }
            });
        }
        Ok(())
    }

    /// Launch the default-instance poller. Idempotent; tied to this
    /// controller's lifetime and torn down by [`shutdown`](Self::shutdown).
    pub async fn start_default_detector(self: &Arc<Self>) {
        let mut guard = self.detector.lock().await;
        if guard.is_some() {
            return;
        }
        let ctrl = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            crate::detector::run(ctrl).await;
        }));
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.detector.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use berth_instance::ExecutionMode;

    use super::*;
    use crate::backend::BackendHandle;
    use crate::persist::JsonStore;
    use crate::settings::{DefaultRedisSettings, StaticSettings};

    struct FakeBackend {
        fail_start: bool,
        force_stop: bool,
        port_in_use: Option<u16>,
        start_delay: Duration,
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl FakeBackend {
        fn blank() -> Self {
            Self {
                fail_start: false,
                force_stop: false,
                port_in_use: None,
                start_delay: Duration::ZERO,
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            }
        }

        fn new() -> Arc<Self> {
            Arc::new(Self::blank())
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail_start: true,
                ..Self::blank()
            })
        }

        fn forcing() -> Arc<Self> {
            Arc::new(Self {
                force_stop: true,
                ..Self::blank()
            })
        }

        fn port_bound(port: u16) -> Arc<Self> {
            Arc::new(Self {
                port_in_use: Some(port),
                ..Self::blank()
            })
        }

        fn slow(start_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                start_delay,
                ..Self::blank()
            })
        }
    }

    #[async_trait::async_trait]
    impl InstanceBackend for FakeBackend {
        async fn start(&self, req: StartRequest<'_>) -> anyhow::Result<BackendHandle> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if let Some(port) = self.port_in_use {
                return Err(PortInUse(port).into());
            }
            if self.fail_start {
                anyhow::bail!("spawn refused");
            }
            if !self.start_delay.is_zero() {
                tokio::time::sleep(self.start_delay).await;
            }
            req.sink
                .emit(LogSource::Stdout, "Ready to accept connections")
                .await;
            Ok(BackendHandle::Container {
                name: format!("fake-{}", req.id),
                log_pump: None,
            })
        }

        async fn stop(
            &self,
            _id: &InstanceId,
            handle: BackendHandle,
            _sink: &LogSink,
        ) -> anyhow::Result<StopOutcome> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            drop(handle);
            if self.force_stop {
                Ok(StopOutcome::Forced)
            } else {
                Ok(StopOutcome::Graceful { exit_code: Some(0) })
            }
        }

        async fn installed(&self) -> (bool, Option<String>) {
            (true, Some("fake 0.0".to_string()))
        }
    }

    fn harness(
        backend: Arc<FakeBackend>,
    ) -> (Arc<LifecycleController>, Arc<JsonStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonStore::new(dir.path()));
        let settings = Arc::new(StaticSettings::new(DefaultRedisSettings::default()));
        let ctrl = LifecycleController::with_backends(
            dir.path(),
            store.clone(),
            settings,
            backend.clone(),
            backend,
        );
        (ctrl, store, dir)
    }

    fn native_config(port: u16) -> InstanceConfig {
        InstanceConfig::new(port, ExecutionMode::Native)
    }

    #[tokio::test]
    async fn create_start_stop_full_cycle() {
        let backend = FakeBackend::new();
        let (ctrl, store, _dir) = harness(backend.clone());

        let snap = ctrl.create("cache", native_config(6401)).await.unwrap();
        assert_eq!(snap.state, InstanceState::Stopped);
        assert!(snap.managed);
        assert!(tokio::fs::try_exists(&snap.config_path).await.unwrap());

        let id = snap.id.clone();
        let started = ctrl.start(&id).await.unwrap();
        assert_eq!(started.state, InstanceState::Running);
        assert!(started.handle.is_some());
        assert!(started.started_at.is_some());
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);

        let stopped = ctrl.stop(&id).await.unwrap();
        assert_eq!(stopped.state, InstanceState::Stopped);
        assert!(stopped.handle.is_none());
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);

        let records = store.list_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, InstanceState::Stopped);
        assert!(!records[0].was_running);
    }

    #[tokio::test]
    async fn start_twice_reports_already_running() {
        let (ctrl, _store, _dir) = harness(FakeBackend::new());
        let id = ctrl.create("a", native_config(6402)).await.unwrap().id;
        ctrl.start(&id).await.unwrap();
        let err = ctrl.start(&id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn stop_when_stopped_reports_not_running() {
        let (ctrl, _store, _dir) = harness(FakeBackend::new());
        let id = ctrl.create("a", native_config(6403)).await.unwrap().id;
        let err = ctrl.stop(&id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotRunning(_)));
    }

    #[tokio::test]
    async fn unknown_instance_reports_not_found() {
        let (ctrl, _store, _dir) = harness(FakeBackend::new());
        let ghost = InstanceId::new();
        assert!(matches!(
            ctrl.start(&ghost).await.unwrap_err(),
            LifecycleError::NotFound(_)
        ));
        assert!(matches!(
            ctrl.get_instance(&ghost).await.unwrap_err(),
            LifecycleError::NotFound(_)
        ));
        assert!(matches!(
            ctrl.get_logs(&ghost).await.unwrap_err(),
            LifecycleError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn start_failure_flips_to_error_with_logged_detail() {
        let (ctrl, store, _dir) = harness(FakeBackend::failing());
        let id = ctrl.create("broken", native_config(6404)).await.unwrap().id;

        let err = ctrl.start(&id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::StartFailed { .. }));

        let snap = ctrl.get_instance(&id).await.unwrap();
        assert_eq!(snap.state, InstanceState::Error);
        assert!(snap.message.as_deref().unwrap().contains("spawn refused"));

        let logs = ctrl.get_logs(&id).await.unwrap();
        assert!(logs.iter().any(|l| l.text.contains("start failed")));

        let records = store.list_records().await.unwrap();
        assert_eq!(records[0].status, InstanceState::Error);
        assert!(!records[0].was_running);
    }

    #[tokio::test]
    async fn duplicate_port_rejected_only_while_running() {
        let (ctrl, _store, _dir) = harness(FakeBackend::new());
        let a = ctrl.create("a", native_config(6405)).await.unwrap().id;

        // Port reuse across stopped instances is fine.
        let b = ctrl.create("b", native_config(6405)).await.unwrap().id;

        ctrl.start(&a).await.unwrap();
        let err = ctrl.start(&b).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::PortUnavailable { port: 6405, .. }
        ));

        let err = ctrl.create("c", native_config(6405)).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::PortUnavailable { port: 6405, .. }
        ));

        ctrl.stop(&a).await.unwrap();
        ctrl.start(&b).await.unwrap();
    }

    #[tokio::test]
    async fn forced_stop_surfaces_stop_timeout_but_ends_stopped() {
        let (ctrl, _store, _dir) = harness(FakeBackend::forcing());
        let id = ctrl.create("slow", native_config(6406)).await.unwrap().id;
        ctrl.start(&id).await.unwrap();

        let err = ctrl.stop(&id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::StopTimeout { .. }));
        let snap = ctrl.get_instance(&id).await.unwrap();
        assert_eq!(snap.state, InstanceState::Stopped);
    }

    #[tokio::test]
    async fn delete_running_instance_stops_and_removes_everything_but_data() {
        let backend = FakeBackend::new();
        let (ctrl, store, _dir) = harness(backend.clone());
        let snap = ctrl.create("victim", native_config(6407)).await.unwrap();
        let id = snap.id.clone();
        ctrl.start(&id).await.unwrap();

        ctrl.delete(&id).await.unwrap();
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
        assert!(matches!(
            ctrl.get_instance(&id).await.unwrap_err(),
            LifecycleError::NotFound(_)
        ));
        assert!(!tokio::fs::try_exists(&snap.config_path).await.unwrap());
        assert!(tokio::fs::try_exists(&snap.data_dir).await.unwrap());
        assert!(store.list_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_is_rejected_while_start_is_in_flight() {
        let backend = FakeBackend::slow(Duration::from_millis(200));
        let (ctrl, _store, _dir) = harness(backend.clone());
        let id = ctrl.create("busy", native_config(6408)).await.unwrap().id;

        let starter = {
            let ctrl = ctrl.clone();
            let id = id.clone();
            tokio::spawn(async move { ctrl.start(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            ctrl.get_instance(&id).await.unwrap().state,
            InstanceState::Starting
        );

        let err = ctrl.delete(&id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidOperation(_)));

        // The start proceeds unharmed and the delete works afterwards.
        let started = starter.await.unwrap().unwrap();
        assert_eq!(started.state, InstanceState::Running);
        ctrl.delete(&id).await.unwrap();
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_stops_fresh_handle_when_instance_vanishes_mid_spawn() {
        let backend = FakeBackend::slow(Duration::from_millis(200));
        let (ctrl, _store, _dir) = harness(backend.clone());
        let id = ctrl.create("gone", native_config(6409)).await.unwrap().id;

        let starter = {
            let ctrl = ctrl.clone();
            let id = id.clone();
            tokio::spawn(async move { ctrl.start(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctrl.registry.remove(&id).await;

        // The spawned backend must be stopped, not leaked.
        let err = starter.await.unwrap().unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(_)));
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn port_conflict_at_spawn_leaves_stopped_with_logged_reason() {
        let (ctrl, _store, _dir) = harness(FakeBackend::port_bound(6410));
        let id = ctrl.create("squatted", native_config(6410)).await.unwrap().id;

        let err = ctrl.start(&id).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::PortUnavailable { port: 6410, .. }
        ));

        let snap = ctrl.get_instance(&id).await.unwrap();
        assert_eq!(snap.state, InstanceState::Stopped);
        let logs = ctrl.get_logs(&id).await.unwrap();
        assert!(logs.iter().any(|l| l.text.contains("already in use")));
    }

    #[tokio::test]
    async fn default_instance_cannot_be_deleted() {
        let (ctrl, _store, _dir) = harness(FakeBackend::new());
        let err = ctrl
            .delete(&InstanceId(DEFAULT_INSTANCE_ID.to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn list_is_sorted_and_includes_all_entries() {
        let (ctrl, _store, _dir) = harness(FakeBackend::new());
        ctrl.create("zeta", native_config(6408)).await.unwrap();
        ctrl.create("alpha", native_config(6409)).await.unwrap();
        let names: Vec<_> = ctrl
            .list_instances()
            .await
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn subscribe_replays_history_then_streams_events() {
        let (ctrl, _store, _dir) = harness(FakeBackend::new());
        let id = ctrl.create("tail", native_config(6410)).await.unwrap().id;

        let (history, mut rx) = ctrl.subscribe(&id).await.unwrap();
        assert!(history.iter().any(|l| l.text.contains("instance created")));

        ctrl.start(&id).await.unwrap();
        let mut saw_started = false;
        for _ in 0..10 {
            match rx.try_recv() {
                Ok(InstanceEvent::Started { .. }) => {
                    saw_started = true;
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        assert!(saw_started);
    }

    #[tokio::test]
    async fn rehydrate_restores_records_and_restarts_was_running() {
        let backend = FakeBackend::new();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonStore::new(dir.path()));

        let now = Utc::now();
        for (name, port, was_running) in [("hot", 6411, true), ("cold", 6412, false)] {
            let record = InstanceRecord {
                id: InstanceId::new(),
                name: name.to_string(),
                config: native_config(port),
                status: if was_running {
                    InstanceState::Running
                } else {
                    InstanceState::Stopped
                },
                was_running,
                created_at: now,
                updated_at: now,
            };
            store.save_record(&record).await.unwrap();
        }

        let settings = Arc::new(StaticSettings::new(DefaultRedisSettings::default()));
        let ctrl = LifecycleController::with_backends(
            dir.path(),
            store.clone(),
            settings,
            backend.clone(),
            backend.clone(),
        );
        ctrl.rehydrate().await.unwrap();

        let mut hot_running = false;
        for _ in 0..100 {
            let list = ctrl.list_instances().await;
            let hot = list.iter().find(|s| s.name == "hot").unwrap();
            let cold = list.iter().find(|s| s.name == "cold").unwrap();
            assert_eq!(cold.state, InstanceState::Stopped);
            if hot.state == InstanceState::Running {
                hot_running = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(hot_running);
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn runtime_support_reports_both_backends() {
        let (ctrl, _store, _dir) = harness(FakeBackend::new());
        let support = ctrl.runtime_support().await;
        assert!(support.native_installed);
        assert_eq!(support.native_version.as_deref(), Some("fake 0.0"));
        assert!(support.docker_installed);
    }
}

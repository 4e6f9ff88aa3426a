//! Edge-triggered poller for the operator's external default Redis server.
//!
//! The default server is not spawned or supervised by the agent; it is only
//! observed. A synthetic registry entry mirrors its reachability so it shows
//! up in listings next to managed instances.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use berth_instance::{
    ExecutionMode, InstanceConfig, InstanceEvent, InstanceId, InstanceRecord, InstanceState,
    LogSource,
};
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::controller::{DEFAULT_INSTANCE_ID, LifecycleController};
use crate::paths;
use crate::probe::{self, PingOutcome};
use crate::registry::{InstanceEntry, LogBuffer, LogSink};
use crate::settings::DefaultRedisSettings;

const DEFAULT_INTERVAL_MS: u64 = 5000;

fn poll_interval() -> Duration {
    let ms = std::env::var("BERTH_DETECTOR_INTERVAL_MS")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_INTERVAL_MS)
        .clamp(500, 60_000);
    Duration::from_millis(ms)
}

pub(crate) async fn run(ctrl: Arc<LifecycleController>) {
    let mut ticker = tokio::time::interval(poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        poll_default_instance_once(&ctrl).await;
    }
}

/// One detector pass, factored out so tests can drive it deterministically.
pub async fn poll_default_instance_once(ctrl: &LifecycleController) {
    let id = InstanceId(DEFAULT_INSTANCE_ID.to_string());
    let settings = ctrl.settings.default_redis_settings().await;

    if !settings.enabled {
        if ctrl.registry.remove(&id).await.is_some() {
            ctrl.events.remove(&id).await;
            tracing::debug!("default redis tracking disabled; synthetic entry removed");
        }
        return;
    }

    let outcome = probe::ping(&settings.host, settings.port, settings.password.as_deref()).await;
    // A password refusal still means the probe failed; it only gets more
    // specific diagnostic text.
    let failure = match &outcome {
        PingOutcome::Pong => None,
        PingOutcome::AuthRequired(reply) => Some(format!("authentication required: {reply}")),
        PingOutcome::Failed(detail) => Some(detail.clone()),
    };

    enum Edge {
        Up,
        Down(String),
    }
    let (edge, sink) = {
        let mut map = ctrl.registry.inner.lock().await;
        // Only a successful probe materializes the synthetic entry; a
        // failed one merely transitions an entry that already exists.
        if failure.is_some() && !map.contains_key(&id.0) {
            return;
        }
        let entry = map
            .entry(id.0.clone())
            .or_insert_with(|| external_entry(&ctrl.root, &settings));
        // Settings can change between polls; keep the mirror current.
        entry.record.config.port = settings.port;
        entry.record.config.bind = Some(settings.host.clone());

        let previous = entry.record.status;
        let edge = match &failure {
            None => {
                entry.record.status = InstanceState::Running;
                if entry.started_at.is_none() {
                    entry.started_at = Some(Utc::now());
                }
                entry.message = None;
                (previous != InstanceState::Running).then_some(Edge::Up)
            }
            Some(detail) => {
                entry.record.status = InstanceState::Stopped;
                entry.started_at = None;
                entry.message = matches!(outcome, PingOutcome::AuthRequired(_))
                    .then(|| detail.clone());
                (previous == InstanceState::Running).then(|| Edge::Down(detail.clone()))
            }
        };
        if edge.is_some() {
            entry.record.updated_at = Utc::now();
        }
        let sink = LogSink::new(id.clone(), entry.logs.clone(), ctrl.events.clone());
        (edge, sink)
    };

    match edge {
        Some(Edge::Up) => {
            tracing::info!(host = %settings.host, port = settings.port, "default redis detected");
            sink.emit(
                LogSource::Agent,
                format!(
                    "default redis detected at {}:{}",
                    settings.host, settings.port
                ),
            )
            .await;
            ctrl.events
                .publish(InstanceEvent::Started { id: id.clone() })
                .await;
        }
        Some(Edge::Down(detail)) => {
            tracing::info!(host = %settings.host, port = settings.port, "default redis gone");
            sink.emit(
                LogSource::Agent,
                format!("default redis probe failed: {detail}"),
            )
            .await;
            ctrl.events
                .publish(InstanceEvent::Stopped {
                    id: id.clone(),
                    exit_code: None,
                })
                .await;
        }
        None => {}
    }
}

/// Synthetic entry for the external server. No backend, never persisted.
pub(crate) fn external_entry(root: &Path, settings: &DefaultRedisSettings) -> InstanceEntry {
    let now = Utc::now();
    let mut config = InstanceConfig::new(settings.port, ExecutionMode::Native);
    config.bind = Some(settings.host.clone());
    let record = InstanceRecord {
        id: InstanceId(DEFAULT_INSTANCE_ID.to_string()),
        name: "Default Redis".to_string(),
        config,
        status: InstanceState::Stopped,
        was_running: false,
        created_at: now,
        updated_at: now,
    };
    InstanceEntry {
        record,
        layout: paths::layout_under(root, DEFAULT_INSTANCE_ID),
        backend: None,
        handle: None,
        started_at: None,
        logs: Arc::new(Mutex::new(LogBuffer::default())),
        managed: false,
        message: None,
    }
}

#[cfg(test)]
mod tests {
    use berth_instance::InstanceEvent;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;
    use crate::backend::NativeBackend;
    use crate::persist::JsonStore;
    use crate::settings::StaticSettings;

    /// Minimal server speaking just enough RESP to answer any command with
    /// +PONG, standing in for an external redis.
    async fn fake_redis() -> (u16, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 512];
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        if sock.write_all(b"+PONG\r\n").await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (port, task)
    }

    fn harness(
        settings: DefaultRedisSettings,
    ) -> (
        Arc<LifecycleController>,
        Arc<StaticSettings>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonStore::new(dir.path()));
        let settings = Arc::new(StaticSettings::new(settings));
        let backend = Arc::new(NativeBackend::new());
        let ctrl = LifecycleController::with_backends(
            dir.path(),
            store,
            settings.clone(),
            backend.clone(),
            backend,
        );
        (ctrl, settings, dir)
    }

    #[tokio::test]
    async fn detector_tracks_reachability_edges() {
        let (port, server) = fake_redis().await;
        let (ctrl, _settings, _dir) = harness(DefaultRedisSettings {
            host: "127.0.0.1".to_string(),
            port,
            password: None,
            enabled: true,
        });
        let id = InstanceId(DEFAULT_INSTANCE_ID.to_string());

        poll_default_instance_once(&ctrl).await;
        let snap = ctrl.get_instance(&id).await.unwrap();
        assert_eq!(snap.state, InstanceState::Running);
        assert!(!snap.managed);

        // Steady state: a second successful poll publishes nothing.
        let (_, mut rx) = ctrl.subscribe(&id).await.unwrap();
        poll_default_instance_once(&ctrl).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        server.abort();
        let _ = server.await;
        poll_default_instance_once(&ctrl).await;

        let snap = ctrl.get_instance(&id).await.unwrap();
        assert_eq!(snap.state, InstanceState::Stopped);

        let mut saw_stopped = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, InstanceEvent::Stopped { .. }) {
                saw_stopped = true;
            }
        }
        assert!(saw_stopped);
    }

    #[tokio::test]
    async fn disabling_tracking_removes_the_synthetic_entry() {
        let (port, server) = fake_redis().await;
        let (ctrl, settings, _dir) = harness(DefaultRedisSettings {
            host: "127.0.0.1".to_string(),
            port,
            password: None,
            enabled: true,
        });
        let id = InstanceId(DEFAULT_INSTANCE_ID.to_string());

        poll_default_instance_once(&ctrl).await;
        assert!(ctrl.get_instance(&id).await.is_ok());

        settings
            .set(DefaultRedisSettings {
                host: "127.0.0.1".to_string(),
                port,
                password: None,
                enabled: false,
            })
            .await;
        poll_default_instance_once(&ctrl).await;
        assert!(ctrl.get_instance(&id).await.is_err());

        server.abort();
    }

    #[tokio::test]
    async fn unreachable_server_never_materializes_an_entry() {
        // Bind and drop to get a port nothing listens on.
        let dead_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (ctrl, _settings, _dir) = harness(DefaultRedisSettings {
            host: "127.0.0.1".to_string(),
            port: dead_port,
            password: None,
            enabled: true,
        });
        let id = InstanceId(DEFAULT_INSTANCE_ID.to_string());

        // Repeated failed polls leave no trace in the registry.
        poll_default_instance_once(&ctrl).await;
        poll_default_instance_once(&ctrl).await;
        assert!(matches!(
            ctrl.get_instance(&id).await,
            Err(crate::LifecycleError::NotFound(_))
        ));
        assert!(ctrl.list_instances().await.is_empty());
    }
}

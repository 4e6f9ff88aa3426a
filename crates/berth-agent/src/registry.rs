use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use berth_instance::{
    InstanceEvent, InstanceId, InstanceRecord, InstanceSnapshot, InstanceState, LogLine, LogSource,
};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::backend::{BackendHandle, InstanceBackend};
use crate::events::EventHub;
use crate::paths::InstanceLayout;

const DEFAULT_LOG_MAX_LINES: usize = 1000;

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
}

pub(crate) fn log_max_lines() -> usize {
    env_usize("BERTH_LOG_MAX_LINES")
        .map(|v| v.clamp(100, 50_000))
        .unwrap_or(DEFAULT_LOG_MAX_LINES)
}

/// Bounded per-instance log history. Oldest lines are evicted first.
#[derive(Debug)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<LogLine>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self {
            max_lines: log_max_lines(),
            lines: VecDeque::new(),
        }
    }
}

impl LogBuffer {
    #[cfg(test)]
    pub(crate) fn with_capacity(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::new(),
        }
    }

    pub fn push(&mut self, line: LogLine) {
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Write side of one instance's log stream: appends to the bounded buffer
/// and fans the line out to event subscribers.
#[derive(Clone)]
pub struct LogSink {
    id: InstanceId,
    buffer: Arc<Mutex<LogBuffer>>,
    events: Arc<EventHub>,
}

impl LogSink {
    pub fn new(id: InstanceId, buffer: Arc<Mutex<LogBuffer>>, events: Arc<EventHub>) -> Self {
        Self { id, buffer, events }
    }

    pub async fn emit(&self, source: LogSource, text: impl Into<String>) {
        let line = LogLine::now(source, text);
        self.buffer.lock().await.push(line.clone());
        self.events
            .publish(InstanceEvent::Log {
                id: self.id.clone(),
                line,
            })
            .await;
    }
}

/// One registered instance. The backend handle is exclusively owned here;
/// `record.status == Running` implies a live handle for managed entries.
/// The backend is fixed at creation; only the synthetic default entry,
/// which is externally driven, has none.
pub struct InstanceEntry {
    pub record: InstanceRecord,
    pub layout: InstanceLayout,
    pub backend: Option<Arc<dyn InstanceBackend>>,
    pub handle: Option<BackendHandle>,
    pub started_at: Option<DateTime<Utc>>,
    pub logs: Arc<Mutex<LogBuffer>>,
    /// False only for the synthetic default entry.
    pub managed: bool,
    pub message: Option<String>,
}

impl InstanceEntry {
    pub fn new(
        record: InstanceRecord,
        layout: InstanceLayout,
        backend: Arc<dyn InstanceBackend>,
    ) -> Self {
        Self {
            record,
            layout,
            backend: Some(backend),
            handle: None,
            started_at: None,
            logs: Arc::new(Mutex::new(LogBuffer::default())),
            managed: true,
            message: None,
        }
    }

    pub fn handle_label(&self) -> Option<String> {
        self.handle.as_ref().and_then(BackendHandle::label)
    }

    pub fn to_snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.record.id.clone(),
            name: self.record.name.clone(),
            config: self.record.config.redacted(),
            state: self.record.status,
            handle: self.handle_label(),
            started_at: self.started_at,
            config_path: self.layout.config_path.display().to_string(),
            data_dir: self.layout.data_dir.display().to_string(),
            managed: self.managed,
            message: self.message.clone(),
        }
    }
}

/// In-memory source of truth for runtime state. All mutations go through the
/// controller or backend callbacks; the lock is held only for short edits,
/// never across backend waits.
#[derive(Default)]
pub struct InstanceRegistry {
    pub(crate) inner: Mutex<HashMap<String, InstanceEntry>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, entry: InstanceEntry) {
        let mut map = self.inner.lock().await;
        map.insert(entry.record.id.0.clone(), entry);
    }

    pub async fn remove(&self, id: &InstanceId) -> Option<InstanceEntry> {
        self.inner.lock().await.remove(&id.0)
    }

    pub async fn contains(&self, id: &InstanceId) -> bool {
        self.inner.lock().await.contains_key(&id.0)
    }

    pub async fn snapshot(&self, id: &InstanceId) -> Option<InstanceSnapshot> {
        self.inner
            .lock()
            .await
            .get(&id.0)
            .map(InstanceEntry::to_snapshot)
    }

    pub async fn list(&self) -> Vec<InstanceSnapshot> {
        let map = self.inner.lock().await;
        let mut out: Vec<InstanceSnapshot> = map.values().map(InstanceEntry::to_snapshot).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.0.cmp(&b.id.0)));
        out
    }

    pub async fn logs(&self, id: &InstanceId) -> Option<Vec<LogLine>> {
        let buffer = {
            let map = self.inner.lock().await;
            map.get(&id.0).map(|e| e.logs.clone())
        }?;
        let logs = buffer.lock().await;
        Some(logs.snapshot())
    }

    /// Declared ports of currently running or starting managed instances,
    /// excluding `except`. Stopped instances don't hold their port.
    pub async fn ports_in_use(&self, except: Option<&InstanceId>) -> Vec<u16> {
        let map = self.inner.lock().await;
        map.values()
            .filter(|e| e.managed)
            .filter(|e| except.is_none_or(|id| e.record.id != *id))
            .filter(|e| {
                matches!(
                    e.record.status,
                    InstanceState::Running | InstanceState::Starting
                )
            })
            .map(|e| e.record.config.port)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_evicts_oldest_beyond_capacity() {
        let mut buf = LogBuffer::with_capacity(1000);
        for i in 0..1500 {
            buf.push(LogLine::now(LogSource::Agent, format!("line {i}")));
        }
        assert_eq!(buf.len(), 1000);
        let lines = buf.snapshot();
        assert_eq!(lines.first().unwrap().text, "line 500");
        assert_eq!(lines.last().unwrap().text, "line 1499");
    }

    #[tokio::test]
    async fn sink_appends_to_buffer() {
        let buffer = Arc::new(Mutex::new(LogBuffer::with_capacity(10)));
        let sink = LogSink::new(
            InstanceId("a".into()),
            buffer.clone(),
            Arc::new(EventHub::new()),
        );
        sink.emit(LogSource::Agent, "hello").await;
        let logs = buffer.lock().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs.snapshot()[0].source, LogSource::Agent);
    }
}

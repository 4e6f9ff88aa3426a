use std::path::PathBuf;

use anyhow::Context as _;
use berth_instance::{InstanceId, InstanceRecord, InstanceState};
use chrono::Utc;
use tokio::io::AsyncWriteExt as _;

const RECORDS_DIR: &str = "records";

/// Durable store of instance records. Must survive agent restarts;
/// `was_running` is the sole auto-start signal after a restart.
#[async_trait::async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn list_records(&self) -> anyhow::Result<Vec<InstanceRecord>>;
    async fn save_record(&self, record: &InstanceRecord) -> anyhow::Result<()>;
    async fn update_status(
        &self,
        id: &InstanceId,
        status: InstanceState,
        was_running: Option<bool>,
    ) -> anyhow::Result<()>;
    async fn delete_record(&self, id: &InstanceId) -> anyhow::Result<()>;
}

/// File-backed adapter: one JSON record per instance under
/// `<root>/records/`, written atomically (temp file, then rename) so a
/// crash mid-save never leaves a torn record.
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            dir: root.into().join(RECORDS_DIR),
        }
    }

    fn record_path(&self, id: &InstanceId) -> PathBuf {
        self.dir.join(format!("{}.json", id.0))
    }

    async fn load(&self, id: &InstanceId) -> anyhow::Result<Option<InstanceRecord>> {
        let path = self.record_path(id);
        let raw = match tokio::fs::read(&path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("read instance record"),
        };
        let record = serde_json::from_slice::<InstanceRecord>(&raw)
            .with_context(|| format!("parse instance record {}", path.display()))?;
        Ok(Some(record))
    }
}

#[async_trait::async_trait]
impl PersistenceAdapter for JsonStore {
    async fn list_records(&self) -> anyhow::Result<Vec<InstanceRecord>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e).context("read records dir"),
        };

        while let Some(entry) = entries.next_entry().await.context("read records dir")? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await.context("read instance record")?;
            match serde_json::from_slice::<InstanceRecord>(&raw) {
                Ok(record) => out.push(record),
                Err(e) => {
                    // A torn record should not take the whole agent down.
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable instance record");
                }
            }
        }

        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn save_record(&self, record: &InstanceRecord) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .context("create records dir")?;

        let path = self.record_path(&record.id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(record).context("serialize instance record")?;

        let mut f = tokio::fs::File::create(&tmp)
            .await
            .context("create record temp file")?;
        f.write_all(&data).await.context("write record temp file")?;
        f.flush().await.ok();
        tokio::fs::rename(&tmp, &path)
            .await
            .context("persist instance record")?;
        Ok(())
    }

    async fn update_status(
        &self,
        id: &InstanceId,
        status: InstanceState,
        was_running: Option<bool>,
    ) -> anyhow::Result<()> {
        // Unknown id is a no-op: the record may have been deleted while a
        // background transition was in flight.
        let Some(mut record) = self.load(id).await? else {
            return Ok(());
        };
        record.status = status;
        if let Some(flag) = was_running {
            record.was_running = flag;
        }
        record.updated_at = Utc::now();
        self.save_record(&record).await
    }

    async fn delete_record(&self, id: &InstanceId) -> anyhow::Result<()> {
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("delete instance record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_instance::{ExecutionMode, InstanceConfig};

    fn record(id: &str, port: u16) -> InstanceRecord {
        InstanceRecord {
            id: InstanceId(id.to_string()),
            name: format!("redis-{port}"),
            config: InstanceConfig::new(port, ExecutionMode::Native),
            status: InstanceState::Stopped,
            was_running: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn records_survive_save_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());

        store.save_record(&record("a", 7000)).await.unwrap();
        store.save_record(&record("b", 7001)).await.unwrap();

        let all = store.list_records().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|r| r.id.0 == "a" && r.config.port == 7000));
    }

    #[tokio::test]
    async fn update_status_persists_flags() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let id = InstanceId("a".to_string());

        store.save_record(&record("a", 7000)).await.unwrap();
        store
            .update_status(&id, InstanceState::Running, Some(true))
            .await
            .unwrap();

        let all = store.list_records().await.unwrap();
        assert_eq!(all[0].status, InstanceState::Running);
        assert!(all[0].was_running);

        // Unknown id must not error.
        store
            .update_status(&InstanceId("ghost".into()), InstanceState::Stopped, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let id = InstanceId("a".to_string());

        store.save_record(&record("a", 7000)).await.unwrap();
        store.delete_record(&id).await.unwrap();
        store.delete_record(&id).await.unwrap();
        assert!(store.list_records().await.unwrap().is_empty());
    }
}

// ABOUTME: Persistence adapter appending finished thread snapshots to a JSON-lines file.
// ABOUTME: One line per terminal thread; the file and its parent directory are created on demand.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use buildwire_core::{PersistenceStore, ThreadSnapshot};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct JsonlStore {
    path: PathBuf,
    // serializes appends from concurrent threads
    write_lock: Mutex<()>,
}

impl JsonlStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every recorded snapshot. A missing file reads as empty.
    pub async fn load(&self) -> Result<Vec<ThreadSnapshot>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.path.display()))
            }
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(n, line)| {
                serde_json::from_str(line).with_context(|| {
                    format!("bad snapshot on line {} of {}", n + 1, self.path.display())
                })
            })
            .collect()
    }
}

#[async_trait]
impl PersistenceStore for JsonlStore {
    async fn record_thread(&self, thread: &ThreadSnapshot) -> Result<()> {
        let mut line = serde_json::to_vec(thread).context("failed to serialize thread snapshot")?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(&line).await.context("failed to append snapshot")?;
        file.flush().await.context("failed to flush snapshot")?;

        tracing::debug!(thread_id = %thread.thread_id, path = %self.path.display(), "thread recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildwire_core::thread::Thread;
    use buildwire_proto::{Actor, Envelope, MessageType};
    use tempfile::TempDir;

    fn snapshot() -> ThreadSnapshot {
        let first = Envelope::start(Actor::User, MessageType::BuildFeature);
        Thread::new(&first).snapshot()
    }

    #[tokio::test]
    async fn test_appends_one_line_per_thread() {
        let dir = TempDir::new().unwrap();
        let store = JsonlStore::new(dir.path().join("nested").join("threads.jsonl"));

        let a = snapshot();
        let b = snapshot();
        store.record_thread(&a).await.unwrap();
        store.record_thread(&b).await.unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.lines().count(), 2);

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].thread_id, a.thread_id);
        assert_eq!(loaded[1].thread_id, b.thread_id);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonlStore::new(dir.path().join("absent.jsonl"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_reports_bad_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("threads.jsonl");
        std::fs::write(&path, "{not json}\n").unwrap();

        let err = JsonlStore::new(&path).load().await.unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }
}

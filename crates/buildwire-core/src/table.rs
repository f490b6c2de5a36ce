// ABOUTME: Concurrent table of active threads plus retained snapshots of archived ones.
// ABOUTME: The map lock is held only for lookup/insert; each thread has its own lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use buildwire_proto::Envelope;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::thread::{Direction, LoggedEnvelope, Thread, ThreadSnapshot};

/// Shared handle to one active thread.
pub type ThreadHandle = Arc<Mutex<Thread>>;

/// Result of looking up the thread for an envelope.
pub enum Opened {
    Active { handle: ThreadHandle, created: bool },
    Archived(ThreadSnapshot),
}

/// Result of adding a late envelope to an archived thread's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LateEntry {
    Logged,
    Duplicate,
    /// The snapshot already fell out of retention.
    Evicted,
}

#[derive(Default)]
struct Tables {
    active: HashMap<String, ThreadHandle>,
    archived: HashMap<String, ThreadSnapshot>,
    archive_order: VecDeque<String>,
}

/// Lock order: the table lock may be held while taking a thread lock,
/// never the reverse.
pub struct ThreadTable {
    inner: Mutex<Tables>,
    archive_retention: usize,
}

impl ThreadTable {
    pub fn new(archive_retention: usize) -> Self {
        Self {
            inner: Mutex::new(Tables::default()),
            archive_retention,
        }
    }

    /// Find the thread an envelope belongs to, creating it if unknown.
    pub async fn open(&self, env: &Envelope) -> Opened {
        let mut tables = self.inner.lock().await;
        if let Some(snapshot) = tables.archived.get(&env.thread_id) {
            return Opened::Archived(snapshot.clone());
        }
        if let Some(handle) = tables.active.get(&env.thread_id) {
            return Opened::Active {
                handle: handle.clone(),
                created: false,
            };
        }
        let handle = Arc::new(Mutex::new(Thread::new(env)));
        tables
            .active
            .insert(env.thread_id.clone(), handle.clone());
        Opened::Active {
            handle,
            created: true,
        }
    }

    pub async fn get(&self, thread_id: &str) -> Option<ThreadHandle> {
        self.inner.lock().await.active.get(thread_id).cloned()
    }

    pub async fn archived(&self, thread_id: &str) -> Option<ThreadSnapshot> {
        self.inner.lock().await.archived.get(thread_id).cloned()
    }

    pub async fn active_handles(&self) -> Vec<ThreadHandle> {
        self.inner.lock().await.active.values().cloned().collect()
    }

    pub async fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.lock().await.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn counts(&self) -> (usize, usize) {
        let tables = self.inner.lock().await;
        (tables.active.len(), tables.archived.len())
    }

    /// Move a thread to the archive if it has nothing left to wait for.
    pub async fn archive(&self, thread_id: &str) -> Option<ThreadSnapshot> {
        self.archive_when(thread_id, Thread::is_archivable).await
    }

    /// Move a thread to the archive if `ready` holds under its lock.
    pub async fn archive_when(
        &self,
        thread_id: &str,
        ready: impl FnOnce(&Thread) -> bool,
    ) -> Option<ThreadSnapshot> {
        let mut tables = self.inner.lock().await;
        let handle = tables.active.get(thread_id)?.clone();

        let snapshot = {
            let mut thread = handle.lock().await;
            if !ready(&*thread) {
                return None;
            }
            thread.mark_archived();
            thread.snapshot()
        };

        tables.active.remove(thread_id);
        tables
            .archived
            .insert(thread_id.to_string(), snapshot.clone());
        tables.archive_order.push_back(thread_id.to_string());
        while tables.archive_order.len() > self.archive_retention {
            if let Some(oldest) = tables.archive_order.pop_front() {
                tables.archived.remove(&oldest);
            }
        }
        Some(snapshot)
    }

    /// Append an inbound envelope to an archived thread's retained log.
    pub async fn log_late(&self, env: &Envelope) -> LateEntry {
        let mut tables = self.inner.lock().await;
        let Some(snapshot) = tables.archived.get_mut(&env.thread_id) else {
            return LateEntry::Evicted;
        };
        if snapshot
            .log
            .iter()
            .any(|logged| logged.envelope.message_id == env.message_id)
        {
            return LateEntry::Duplicate;
        }
        snapshot.log.push(LoggedEnvelope {
            direction: Direction::Inbound,
            envelope: env.clone(),
        });
        snapshot.last_activity = Utc::now();
        LateEntry::Logged
    }
}

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    WaitingForLinks,
    Processing,
    Cancelled,
    Completed,
}

impl TaskStatus {
    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::WaitingForLinks => "waiting for links",
            TaskStatus::Processing => "processing",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub status: TaskStatus,
    pub limit: usize,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub current: usize,
    #[serde(default)]
    pub success: usize,
    /// Links whose processing has ended. `None` in files written before the
    /// marker existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<usize>,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub cancel_requested: bool,
    pub start_time: DateTime<Utc>,
    /// Chat the status message lives in, used to resume after a restart.
    #[serde(default)]
    pub chat_id: Option<i64>,
    #[serde(default)]
    pub status_msg_id: Option<i32>,
}

impl ActiveTask {
    pub fn waiting(limit: usize, chat_id: i64) -> Self {
        ActiveTask {
            status: TaskStatus::WaitingForLinks,
            limit,
            links: Vec::new(),
            current: 0,
            success: 0,
            finished: None,
            total: 0,
            cancel_requested: false,
            start_time: Utc::now(),
            chat_id: Some(chat_id),
            status_msg_id: None,
        }
    }

    pub fn begin_processing(&mut self, links: Vec<String>) {
        self.status = TaskStatus::Processing;
        self.total = links.len();
        self.links = links;
        self.current = 0;
        self.success = 0;
        self.finished = Some(0);
        self.cancel_requested = false;
    }

    /// Progress counters only move forward and stay within `success <= current <= total`.
    pub fn record_progress(&mut self, current: usize, success: usize) {
        self.current = current.max(self.current).min(self.total);
        self.success = success.max(self.success).min(self.current);
    }

    /// Marks the first `finished` links as done. Never moves backwards.
    pub fn record_finished(&mut self, finished: usize, success: usize) {
        let finished = finished.min(self.total);
        self.finished = Some(self.finished.unwrap_or(0).max(finished));
        self.record_progress(finished, success);
    }

    /// Index of the first link a restarted run must process. A link that was
    /// started but never marked finished is processed again.
    pub fn resume_index(&self) -> usize {
        match self.finished {
            Some(finished) => finished.min(self.total),
            None => self.current.saturating_sub(1),
        }
    }

    pub fn failed(&self) -> usize {
        self.current.saturating_sub(self.success)
    }
}

/// Reads the persisted mapping. Missing or unreadable files yield an empty map.
pub fn load(path: &Path) -> HashMap<i64, ActiveTask> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(err) => {
            warn!("Failed to read {}: {err}", path.display());
            return HashMap::new();
        }
    };
    match serde_json::from_str::<HashMap<i64, ActiveTask>>(&raw) {
        Ok(tasks) => tasks,
        Err(err) => {
            warn!("Ignoring corrupt active task file {}: {err}", path.display());
            HashMap::new()
        }
    }
}

/// Overwrites the whole mapping through a temporary file and a rename.
pub async fn save(path: &Path, tasks: &HashMap<i64, ActiveTask>) -> Result<()> {
    let ordered: BTreeMap<&i64, &ActiveTask> = tasks.iter().collect();
    let body = serde_json::to_vec_pretty(&ordered)?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_else(|| "active_tasks.json".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, body).await?;
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}

type Snapshot = Option<HashMap<i64, ActiveTask>>;

/// In-memory active tasks with best-effort persistence.
///
/// Every mutation updates the map under a lock and hands a snapshot to a
/// background writer. Writes coalesce, so a burst of updates costs one file
/// write. Memory stays authoritative when a write fails.
#[derive(Clone)]
pub struct ActiveTaskStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: PathBuf,
    tasks: Mutex<HashMap<i64, ActiveTask>>,
    pending: watch::Sender<Snapshot>,
    /// Held for every file write so an older snapshot never lands last.
    write_lock: Arc<AsyncMutex<()>>,
}

impl ActiveTaskStore {
    /// Loads the file and starts the writer task. Must run inside a tokio runtime.
    pub fn open(path: PathBuf) -> Self {
        let tasks = load(&path);
        info!("Loaded {} active tasks from {}", tasks.len(), path.display());

        let (pending, receiver) = watch::channel(None);
        let write_lock = Arc::new(AsyncMutex::new(()));
        let writer_path = path.clone();
        let writer_lock = write_lock.clone();
        tokio::spawn(async move {
            task_writer(writer_path, receiver, writer_lock).await;
        });

        ActiveTaskStore {
            inner: Arc::new(StoreInner {
                path,
                tasks: Mutex::new(tasks),
                pending,
                write_lock,
            }),
        }
    }

    /// Must be called with the task map still locked, so the pending
    /// snapshot is always the newest one.
    fn schedule_flush(&self, tasks: &HashMap<i64, ActiveTask>) {
        self.inner.pending.send_replace(Some(tasks.clone()));
    }

    pub fn get(&self, user_id: i64) -> Option<ActiveTask> {
        self.inner.tasks.lock().get(&user_id).cloned()
    }

    pub fn contains(&self, user_id: i64) -> bool {
        self.inner.tasks.lock().contains_key(&user_id)
    }

    pub fn snapshot(&self) -> HashMap<i64, ActiveTask> {
        self.inner.tasks.lock().clone()
    }

    /// Inserts only when the user has no task. Returns whether it was inserted.
    pub fn insert_if_absent(&self, user_id: i64, task: ActiveTask) -> bool {
        let mut tasks = self.inner.tasks.lock();
        if tasks.contains_key(&user_id) {
            return false;
        }
        tasks.insert(user_id, task);
        self.schedule_flush(&tasks);
        true
    }

    pub fn put(&self, user_id: i64, task: ActiveTask) {
        let mut tasks = self.inner.tasks.lock();
        tasks.insert(user_id, task);
        self.schedule_flush(&tasks);
    }

    /// Mutates the task in place; `None` when the user has no task.
    pub fn update<F>(&self, user_id: i64, mutate: F) -> Option<ActiveTask>
    where
        F: FnOnce(&mut ActiveTask),
    {
        let mut tasks = self.inner.tasks.lock();
        let task = tasks.get_mut(&user_id)?;
        mutate(task);
        let updated = task.clone();
        self.schedule_flush(&tasks);
        Some(updated)
    }

    /// Removing a missing task is a no-op.
    pub fn remove(&self, user_id: i64) -> Option<ActiveTask> {
        let mut tasks = self.inner.tasks.lock();
        let removed = tasks.remove(&user_id)?;
        self.schedule_flush(&tasks);
        Some(removed)
    }

    /// Writes the current mapping now. Shares the writer's lock, and the
    /// snapshot is taken after the lock is held.
    pub async fn flush(&self) -> Result<()> {
        let _write = self.inner.write_lock.lock().await;
        let snapshot = self.snapshot();
        save(&self.inner.path, &snapshot).await
    }
}

async fn task_writer(
    path: PathBuf,
    mut receiver: watch::Receiver<Snapshot>,
    write_lock: Arc<AsyncMutex<()>>,
) {
    while receiver.changed().await.is_ok() {
        let _write = write_lock.lock().await;
        let snapshot = receiver.borrow_and_update().clone();
        let Some(snapshot) = snapshot else {
            continue;
        };
        if let Err(err) = save(&path, &snapshot).await {
            error!("Error saving active tasks to {}: {err}", path.display());
        }
    }
    info!("Active task writer stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn processing_task() -> ActiveTask {
        let mut task = ActiveTask::waiting(5, 42);
        task.begin_processing(vec![
            "https://t.me/a/1".to_string(),
            "https://t.me/a/2".to_string(),
        ]);
        task.record_progress(1, 1);
        task
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("active.json");
        let mut tasks = HashMap::new();
        tasks.insert(7, processing_task());
        tasks.insert(8, ActiveTask::waiting(500, 8));

        save(&path, &tasks).await.unwrap();
        assert_eq!(load(&path), tasks);
    }

    #[test]
    fn missing_or_corrupt_files_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("active.json");
        assert!(load(&path).is_empty());

        std::fs::write(&path, "{not json").unwrap();
        assert!(load(&path).is_empty());
    }

    #[test]
    fn persisted_form_uses_string_user_ids_and_snake_case() {
        let mut tasks = HashMap::new();
        tasks.insert(7, ActiveTask::waiting(5, 7));
        let json = serde_json::to_value(&tasks).unwrap();
        assert_eq!(json["7"]["status"], "waiting_for_links");
        assert_eq!(json["7"]["limit"], 5);
    }

    #[test]
    fn progress_is_monotonic_and_bounded() {
        let mut task = processing_task();
        task.record_progress(5, 5);
        assert_eq!((task.current, task.success), (2, 2));
        task.record_progress(1, 0);
        assert_eq!((task.current, task.success), (2, 2));
        assert_eq!(task.failed(), 0);

        let mut fresh = processing_task();
        fresh.record_progress(2, 1);
        assert_eq!(fresh.failed(), 1);
    }

    #[tokio::test]
    async fn one_task_per_user_and_idempotent_removal() {
        let dir = tempfile::tempdir().unwrap();
        let store = ActiveTaskStore::open(dir.path().join("active.json"));

        assert!(store.insert_if_absent(1, ActiveTask::waiting(5, 1)));
        assert!(!store.insert_if_absent(1, ActiveTask::waiting(500, 1)));
        assert_eq!(store.get(1).unwrap().limit, 5);

        assert!(store.remove(1).is_some());
        assert!(store.remove(1).is_none());
        assert!(!store.contains(1));
        assert!(store.update(1, |task| task.cancel_requested = true).is_none());
    }

    #[tokio::test]
    async fn writer_persists_mutations_in_the_background() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("active.json");
        let store = ActiveTaskStore::open(path.clone());
        store.put(3, ActiveTask::waiting(5, 3));
        store.update(3, |task| task.cancel_requested = true);

        let mut persisted = HashMap::new();
        for _ in 0..100 {
            persisted = load(&path);
            if persisted.get(&3).map(|task| task.cancel_requested) == Some(true) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(persisted, store.snapshot());
    }

    #[tokio::test]
    async fn reopened_store_sees_flushed_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("active.json");
        let store = ActiveTaskStore::open(path.clone());
        let task = processing_task();
        store.put(9, task.clone());
        store.flush().await.unwrap();

        let reopened = ActiveTaskStore::open(path);
        assert_eq!(reopened.get(9), Some(task));
    }

    #[tokio::test]
    async fn flush_is_not_overwritten_by_a_pending_background_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("active.json");
        let store = ActiveTaskStore::open(path.clone());
        for current in 1..=2 {
            store.put(4, processing_task());
            store.update(4, |task| task.record_progress(current, 0));
        }
        store.remove(4);
        store.put(5, ActiveTask::waiting(5, 5));
        store.flush().await.unwrap();

        // Give the background writer time to drain whatever it still holds.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(load(&path), store.snapshot());
    }

    #[test]
    fn resume_index_skips_only_finished_links() {
        let mut task = processing_task();
        assert_eq!(task.resume_index(), 0);

        task.record_progress(2, 1);
        assert_eq!(task.resume_index(), 0);
        task.record_finished(1, 1);
        assert_eq!(task.resume_index(), 1);
        task.record_finished(2, 1);
        assert_eq!(task.resume_index(), 2);
        task.record_finished(1, 0);
        assert_eq!((task.resume_index(), task.success), (2, 1));

        let mut legacy = processing_task();
        legacy.finished = None;
        legacy.record_progress(2, 1);
        assert_eq!(legacy.resume_index(), 1);
    }
}

//! Collaborator interfaces for durable task and blob storage, plus the
//! in-memory reference implementations used by the CLI and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::tracker::StepRecord;

/// Task lifecycle state. Transitions are monotonic: `Running` moves to
/// exactly one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Error,
    Stopped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

/// Task metadata as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub session_id: Uuid,
    pub description: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Set iff `status` is terminal.
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(task_id: Uuid, session_id: Uuid, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            session_id,
            description: description.into(),
            status: TaskStatus::Running,
            created_at: now,
            last_activity: now,
            end_time: None,
            result: None,
            error: None,
        }
    }
}

/// Storage collaborator errors. Never fail a task: the tracker spills and
/// retries on these.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(Uuid),
    #[error("store I/O error: {0}")]
    Io(String),
}

/// Filter for task listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub session_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
}

/// Pagination window.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// Durable task/step store. Implementations must be internally thread-safe
/// and must tolerate replay of `append_steps` for the same
/// `(task_id, step_number)` as an idempotent upsert.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Atomic status update; stamps `last_activity` as a side effect.
    async fn update_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        end_time: Option<DateTime<Utc>>,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Ordered batch append, idempotent per `(task_id, step_number)`.
    async fn append_steps(&self, task_id: Uuid, steps: &[StepRecord]) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError>;

    async fn list_tasks(&self, filter: &TaskFilter, page: Page) -> Result<Vec<Task>, StoreError>;

    async fn get_steps(&self, task_id: Uuid, page: Page) -> Result<Vec<StepRecord>, StoreError>;

    /// Screenshot references recorded for a task, in step order.
    async fn get_screenshots(&self, task_id: Uuid) -> Result<Vec<String>, StoreError>;
}

/// Opaque byte store for screenshots. Returns retrieval URLs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory [`TaskStore`], the local fallback when no durable backend is
/// configured.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
    steps: RwLock<HashMap<Uuid, BTreeMap<u32, StepRecord>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        self.tasks.write().insert(task.task_id, task.clone());
        Ok(())
    }

    async fn update_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        end_time: Option<DateTime<Utc>>,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(&task_id).ok_or(StoreError::NotFound(task_id))?;
        task.status = status;
        task.last_activity = Utc::now();
        if end_time.is_some() {
            task.end_time = end_time;
        }
        if result.is_some() {
            task.result = result;
        }
        if error.is_some() {
            task.error = error;
        }
        Ok(())
    }

    async fn append_steps(&self, task_id: Uuid, steps: &[StepRecord]) -> Result<(), StoreError> {
        let mut all = self.steps.write();
        let entry = all.entry(task_id).or_default();
        for step in steps {
            // upsert keyed by step_number makes replay harmless
            entry.insert(step.step_number, step.clone());
        }
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().get(&task_id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter, page: Page) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read();
        let mut matched: Vec<Task> = tasks
            .values()
            .filter(|t| filter.session_id.map_or(true, |s| t.session_id == s))
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        matched.sort_by_key(|t| t.created_at);
        Ok(matched
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    async fn get_steps(&self, task_id: Uuid, page: Page) -> Result<Vec<StepRecord>, StoreError> {
        let steps = self.steps.read();
        Ok(steps
            .get(&task_id)
            .map(|records| {
                records
                    .values()
                    .skip(page.offset)
                    .take(page.limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_screenshots(&self, task_id: Uuid) -> Result<Vec<String>, StoreError> {
        let steps = self.steps.read();
        Ok(steps
            .get(&task_id)
            .map(|records| {
                records
                    .values()
                    .filter_map(|r| r.screenshot_ref.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// In-memory [`BlobStore`] returning `memory://` URLs.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.read().get(key).map(|(bytes, _)| bytes.clone())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError> {
        self.blobs
            .write()
            .insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(format!("memory://{}", key))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.blobs.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::StepRecord;

    #[tokio::test]
    async fn test_task_lifecycle() {
        let store = MemoryTaskStore::new();
        let task = Task::new(Uuid::new_v4(), Uuid::new_v4(), "open settings");
        store.create_task(&task).await.unwrap();

        let loaded = store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
        assert!(loaded.end_time.is_none());

        store
            .update_task_status(
                task.task_id,
                TaskStatus::Completed,
                Some(Utc::now()),
                Some("done".to_string()),
                None,
            )
            .await
            .unwrap();

        let loaded = store.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert!(loaded.end_time.is_some());
        assert_eq!(loaded.result.as_deref(), Some("done"));
        assert!(loaded.last_activity >= loaded.created_at);
    }

    #[tokio::test]
    async fn test_update_unknown_task() {
        let store = MemoryTaskStore::new();
        let err = store
            .update_task_status(Uuid::new_v4(), TaskStatus::Error, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_append_steps_idempotent_replay() {
        let store = MemoryTaskStore::new();
        let task_id = Uuid::new_v4();

        let steps: Vec<StepRecord> = (1..=3)
            .map(|n| StepRecord::error(task_id, n, "k", "d"))
            .collect();

        store.append_steps(task_id, &steps).await.unwrap();
        // replaying the same batch leaves the store unchanged
        store.append_steps(task_id, &steps).await.unwrap();
        store.append_steps(task_id, &steps[1..2]).await.unwrap();

        let stored = store.get_steps(task_id, Page::default()).await.unwrap();
        assert_eq!(stored.len(), 3);
        let numbers: Vec<u32> = stored.iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_list_tasks_filtering() {
        let store = MemoryTaskStore::new();
        let session_a = Uuid::new_v4();
        let session_b = Uuid::new_v4();

        for session in [session_a, session_a, session_b] {
            store
                .create_task(&Task::new(Uuid::new_v4(), session, "t"))
                .await
                .unwrap();
        }

        let filter = TaskFilter {
            session_id: Some(session_a),
            status: None,
        };
        let tasks = store.list_tasks(&filter, Page::default()).await.unwrap();
        assert_eq!(tasks.len(), 2);

        let filter = TaskFilter {
            session_id: None,
            status: Some(TaskStatus::Completed),
        };
        assert!(store
            .list_tasks(&filter, Page::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_blob_store_urls() {
        let blobs = MemoryBlobStore::new();
        let url = blobs
            .put("task/x/step/1/shot.png", vec![1, 2, 3], "image/png")
            .await
            .unwrap();
        assert_eq!(url, "memory://task/x/step/1/shot.png");
        assert_eq!(blobs.get("task/x/step/1/shot.png"), Some(vec![1, 2, 3]));

        blobs.delete("task/x/step/1/shot.png").await.unwrap();
        assert!(blobs.is_empty());
    }
}

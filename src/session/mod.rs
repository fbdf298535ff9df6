//! Session and task lifecycle management.
//!
//! A session holds at most one running task; the manager launches each task's
//! agent on a dedicated worker, wires cancellation, and fans events out to
//! the session's subscribers.

mod events;

pub use events::{EventHub, TaskEvent, SUBSCRIBER_QUEUE_CAPACITY};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::actions::{ConfirmationHandler, TakeoverHandler};
use crate::adb::DeviceControl;
use crate::agent::{Agent, AgentConfig};
use crate::model::ModelApi;
use crate::storage::{BlobStore, StoreError, Task, TaskFilter, TaskStatus, TaskStore};
use crate::tracker::{StepTracker, TrackerConfig};

/// Session manager errors.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session not found: {0}")]
    UnknownSession(Uuid),
    #[error("session already has a running task")]
    SessionBusy,
    #[error("step tracker initialization failed: {0}")]
    Tracker(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

struct RunningTask {
    task_id: Uuid,
    cancel: CancellationToken,
    #[allow(dead_code)]
    worker: JoinHandle<()>,
}

struct SessionState {
    #[allow(dead_code)]
    session_id: Uuid,
    user_id: Option<String>,
    hub: Arc<EventHub>,
    running: tokio::sync::Mutex<Option<RunningTask>>,
}

/// Owns sessions and live tasks; everything else is a collaborator handle.
pub struct SessionManager {
    model: Arc<dyn ModelApi>,
    device: Arc<dyn DeviceControl>,
    store: Arc<dyn TaskStore>,
    blobs: Arc<dyn BlobStore>,
    confirmation: Arc<dyn ConfirmationHandler>,
    takeover: Arc<dyn TakeoverHandler>,
    defaults: AgentConfig,
    spill_dir: PathBuf,
    sessions: RwLock<HashMap<Uuid, Arc<SessionState>>>,
    /// In-memory mirror of task metadata for fast queries; the store stays
    /// the source of truth.
    index: RwLock<HashMap<Uuid, Task>>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: Arc<dyn ModelApi>,
        device: Arc<dyn DeviceControl>,
        store: Arc<dyn TaskStore>,
        blobs: Arc<dyn BlobStore>,
        confirmation: Arc<dyn ConfirmationHandler>,
        takeover: Arc<dyn TakeoverHandler>,
        defaults: AgentConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            model,
            device,
            store,
            blobs,
            confirmation,
            takeover,
            defaults,
            spill_dir: std::env::temp_dir().join("droidpilot"),
            sessions: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
        })
    }

    /// Create a session. Returns its identifier.
    pub fn create_session(&self, user_id: Option<String>) -> Uuid {
        let session_id = Uuid::new_v4();
        let state = Arc::new(SessionState {
            session_id,
            user_id,
            hub: Arc::new(EventHub::new()),
            running: tokio::sync::Mutex::new(None),
        });
        self.sessions.write().insert(session_id, state);
        tracing::info!(%session_id, "session created");
        session_id
    }

    fn session(&self, session_id: Uuid) -> Result<Arc<SessionState>, SessionError> {
        self.sessions
            .read()
            .get(&session_id)
            .cloned()
            .ok_or(SessionError::UnknownSession(session_id))
    }

    /// Subscribe to a session's event stream. Events arrive in per-task
    /// step-number order; slow subscribers are disconnected after a bounded
    /// backlog.
    pub fn subscribe(&self, session_id: Uuid) -> Result<mpsc::Receiver<TaskEvent>, SessionError> {
        Ok(self.session(session_id)?.hub.subscribe())
    }

    /// Start a task in a session. Fails with [`SessionError::SessionBusy`]
    /// when the session already has a running task; otherwise launches the
    /// agent on a dedicated worker and returns the new task id immediately.
    pub async fn start(
        self: &Arc<Self>,
        session_id: Uuid,
        description: impl Into<String>,
        overrides: Option<AgentConfig>,
    ) -> Result<Uuid, SessionError> {
        let session = self.session(session_id)?;
        let description = description.into();
        let config = overrides.unwrap_or_else(|| self.defaults.clone());

        let mut slot = session.running.lock().await;
        if slot.is_some() {
            return Err(SessionError::SessionBusy);
        }

        let task_id = Uuid::new_v4();
        let task = Task::new(task_id, session_id, description.clone());
        if let Err(e) = self.store.create_task(&task).await {
            // persistence must not block execution; the tracker will retry
            tracing::warn!(%task_id, error = %e, "task creation not persisted");
        }
        self.index.write().insert(task_id, task);

        let hub = session.hub.clone();
        let overflow_hub = hub.clone();
        let tracker = StepTracker::new(
            task_id,
            self.store.clone(),
            self.blobs.clone(),
            TrackerConfig {
                spill_path: self.spill_dir.join(format!("{}.spill", task_id)),
                ..TrackerConfig::for_task(task_id)
            },
            Some(Arc::new(move |dropped| {
                overflow_hub.publish(&TaskEvent::Overflow { task_id, dropped });
            })),
        )
        .map_err(|e| SessionError::Tracker(e.to_string()))?;
        let tracker = Arc::new(tracker);

        let agent = Agent::new(
            task_id,
            description,
            config,
            self.model.clone(),
            self.device.clone(),
            self.confirmation.clone(),
            self.takeover.clone(),
            tracker.clone(),
            hub.clone(),
        );

        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let manager = self.clone();
        let worker_session = session.clone();

        let worker = tokio::spawn(async move {
            let outcome = agent.run(&worker_cancel).await;
            manager
                .finish_task(task_id, &outcome.status, &outcome.message)
                .await;
            hub.publish(&TaskEvent::Terminal {
                task_id,
                status: outcome.status,
                message: outcome.message,
            });
            tracker.close().await;
            worker_session.running.lock().await.take();
        });

        *slot = Some(RunningTask {
            task_id,
            cancel,
            worker,
        });
        tracing::info!(%session_id, %task_id, "task started");
        Ok(task_id)
    }

    /// Record a task's terminal state in the store and the in-memory index.
    async fn finish_task(&self, task_id: Uuid, status: &TaskStatus, message: &str) {
        let end_time = Utc::now();
        let (result, error) = match status {
            TaskStatus::Completed | TaskStatus::Stopped => (Some(message.to_string()), None),
            TaskStatus::Error => (None, Some(message.to_string())),
            TaskStatus::Running => (None, None),
        };

        if let Err(e) = self
            .store
            .update_task_status(task_id, *status, Some(end_time), result.clone(), error.clone())
            .await
        {
            tracing::warn!(%task_id, error = %e, "terminal status not persisted");
        }

        if let Some(task) = self.index.write().get_mut(&task_id) {
            task.status = *status;
            task.last_activity = end_time;
            task.end_time = Some(end_time);
            task.result = result;
            task.error = error;
        }
    }

    /// Signal cancellation for the session's running task. Idempotent; a
    /// session with nothing running is a no-op.
    pub async fn stop(&self, session_id: Uuid) -> Result<(), SessionError> {
        let session = self.session(session_id)?;
        if let Some(running) = session.running.lock().await.as_ref() {
            tracing::info!(%session_id, task_id = %running.task_id, "stop requested");
            running.cancel.cancel();
        }
        Ok(())
    }

    /// Task id currently running in a session, if any.
    pub async fn running_task(&self, session_id: Uuid) -> Result<Option<Uuid>, SessionError> {
        let session = self.session(session_id)?;
        let slot = session.running.lock().await;
        Ok(slot.as_ref().map(|r| r.task_id))
    }

    /// Read-only task view: in-memory index first, store as fallback.
    pub async fn query(&self, task_id: Uuid) -> Result<Option<Task>, SessionError> {
        if let Some(task) = self.index.read().get(&task_id).cloned() {
            return Ok(Some(task));
        }
        Ok(self.store.get_task(task_id).await?)
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, SessionError> {
        Ok(self.store.list_tasks(filter, Default::default()).await?)
    }

    pub fn user_id(&self, session_id: Uuid) -> Result<Option<String>, SessionError> {
        Ok(self.session(session_id)?.user_id.clone())
    }

    /// Drop terminal tasks older than `max_age` from the in-memory index.
    /// The durable store is untouched.
    pub fn cleanup_finished(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut index = self.index.write();
        let before = index.len();
        index.retain(|_, task| !(task.status.is_terminal() && task.last_activity < cutoff));
        before - index.len()
    }
}

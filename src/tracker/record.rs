//! Persisted step records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// What a step describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Thinking,
    Action,
    Screenshot,
    Error,
    Validation,
}

/// How a step concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failure,
    Pending,
    Skipped,
}

/// One loop iteration, as persisted and broadcast.
///
/// Created once per iteration by the agent and never mutated afterwards; the
/// tracker swaps `screenshot_ref` from blob key to durable URL on its own
/// copy just before persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Monotonic, 1-based within a task.
    pub step_number: u32,
    pub task_id: Uuid,
    pub step_type: StepType,
    /// Structured step payload; for action steps the parsed action, for
    /// error steps `{kind, detail}`.
    pub payload: Value,
    pub thought: Option<String>,
    pub outcome: StepOutcome,
    pub screenshot_ref: Option<String>,
    pub elapsed_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl StepRecord {
    /// An error step with a structured `{kind, detail}` payload.
    pub fn error(task_id: Uuid, step_number: u32, kind: &str, detail: &str) -> Self {
        Self {
            step_number,
            task_id,
            step_type: StepType::Error,
            payload: serde_json::json!({ "kind": kind, "detail": detail }),
            thought: None,
            outcome: StepOutcome::Failure,
            screenshot_ref: None,
            elapsed_ms: 0,
            created_at: Utc::now(),
        }
    }
}

/// Blob key for a step's screenshot:
/// `task/<taskId>/step/<n>/screenshot_<YYYYMMDD>_<HHMMSS>_<uuid8>.png`.
///
/// The trailing eight hex chars come from a random UUID and keep keys unique
/// under concurrent writers sharing a timestamp.
pub fn screenshot_key(task_id: Uuid, step_number: u32, at: DateTime<Utc>) -> String {
    let stamp = at.format("%Y%m%d_%H%M%S");
    let uuid8: String = Uuid::new_v4().simple().to_string()[..8].to_string();
    format!(
        "task/{}/step/{}/screenshot_{}_{}.png",
        task_id, step_number, stamp, uuid8
    )
}

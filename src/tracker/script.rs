//! Replayable automation scripts recorded from a task run.
//!
//! When script recording is enabled the agent captures every executed action
//! into a [`ScriptRecorder`], and the finished recording is saved as a
//! self-describing JSON artifact. A saved script is loaded back with
//! [`ScriptFile::load`] and replayed by feeding each step's action through
//! the dispatcher, which maps the recorded relative coordinates against the
//! live screen at replay time.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::record::{StepOutcome, StepRecord, StepType};

/// Display length cap for the script's short name.
const TASK_NAME_MAX: usize = 50;

/// One recorded action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptStep {
    pub step_number: u32,
    pub action_type: String,
    /// The structured action, as emitted by the agent's step payloads.
    pub action: Value,
    pub thought: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Script header: what was recorded, where, and how well it went.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptMetadata {
    pub task_id: Uuid,
    pub task_name: String,
    pub description: String,
    pub device_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub total_steps: u32,
    /// Percentage of recorded steps that succeeded; set when recording
    /// finishes.
    pub success_rate: Option<f64>,
    /// Wall-clock seconds of the recorded run; set when recording finishes.
    pub execution_secs: Option<f64>,
}

/// A saved (or in-progress) automation script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptFile {
    pub metadata: ScriptMetadata,
    pub steps: Vec<ScriptStep>,
}

impl ScriptFile {
    /// Load a script saved by [`ScriptRecorder::save`].
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Human-readable recap with an action breakdown.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "script: {}\nsteps: {}\ndevice: {}\n",
            self.metadata.task_name,
            self.metadata.total_steps,
            self.metadata.device_id.as_deref().unwrap_or("default"),
        );
        if let Some(rate) = self.metadata.success_rate {
            out.push_str(&format!("success rate: {:.0}%\n", rate));
        }
        if let Some(secs) = self.metadata.execution_secs {
            out.push_str(&format!("recorded run took: {:.1}s\n", secs));
        }

        let mut counts: std::collections::BTreeMap<&str, usize> = Default::default();
        for step in &self.steps {
            *counts.entry(step.action_type.as_str()).or_default() += 1;
        }
        if !counts.is_empty() {
            out.push_str("actions:\n");
            for (action, count) in counts {
                out.push_str(&format!("  {}: {}\n", action, count));
            }
        }
        out
    }
}

/// Records the actions of one task run into a replayable script.
pub struct ScriptRecorder {
    output_dir: PathBuf,
    script: ScriptFile,
    started: Instant,
}

impl ScriptRecorder {
    /// Begin a recording. Creates `output_dir` when missing.
    pub fn start(
        output_dir: impl Into<PathBuf>,
        task_id: Uuid,
        description: &str,
        device_id: Option<String>,
    ) -> std::io::Result<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)?;

        Ok(Self {
            output_dir,
            script: ScriptFile {
                metadata: ScriptMetadata {
                    task_id,
                    task_name: shorten(description, TASK_NAME_MAX),
                    description: description.to_string(),
                    device_id,
                    created_at: Utc::now(),
                    total_steps: 0,
                    success_rate: None,
                    execution_secs: None,
                },
                steps: Vec::new(),
            },
            started: Instant::now(),
        })
    }

    /// Capture one executed step.
    ///
    /// Only action steps are recorded; error steps and the terminal `finish`
    /// have nothing to replay and are skipped.
    pub fn record_step(&mut self, record: &StepRecord, error_message: Option<String>) {
        if record.step_type != StepType::Action {
            return;
        }
        let action_type = record
            .payload
            .get("action")
            .and_then(|a| a.as_str())
            .unwrap_or("unknown")
            .to_string();
        if action_type == "finish" {
            return;
        }

        self.script.steps.push(ScriptStep {
            step_number: self.script.steps.len() as u32 + 1,
            action_type,
            action: record.payload.clone(),
            thought: record.thought.clone().unwrap_or_default(),
            success: record.outcome == StepOutcome::Success,
            error_message,
            recorded_at: record.created_at,
        });
        self.script.metadata.total_steps = self.script.steps.len() as u32;
    }

    /// Close the recording: stamp execution time and success rate.
    pub fn finish(&mut self) {
        self.script.metadata.execution_secs = Some(self.started.elapsed().as_secs_f64());
        if !self.script.steps.is_empty() {
            let successful = self.script.steps.iter().filter(|s| s.success).count();
            self.script.metadata.success_rate =
                Some(successful as f64 / self.script.steps.len() as f64 * 100.0);
        }
    }

    pub fn len(&self) -> usize {
        self.script.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.script.steps.is_empty()
    }

    /// Write the script as pretty-printed JSON under the output directory.
    /// The filename carries a timestamp and a sanitized task name.
    pub fn save(&self) -> std::io::Result<PathBuf> {
        let stamp = self.script.metadata.created_at.format("%Y%m%d_%H%M%S");
        let name = sanitize_for_filename(&self.script.metadata.task_name, 20);
        let path = self.output_dir.join(format!("{}_{}.json", stamp, name));

        let json = serde_json::to_vec_pretty(&self.script)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(&path, json)?;
        Ok(path)
    }

    pub fn script(&self) -> &ScriptFile {
        &self.script
    }
}

fn shorten(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

/// Keep filenames portable: alphanumerics pass through, everything else
/// becomes an underscore.
fn sanitize_for_filename(text: &str, max_chars: usize) -> String {
    let sanitized: String = text
        .chars()
        .take(max_chars)
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    if sanitized.is_empty() {
        "task".to_string()
    } else {
        sanitized
    }
}

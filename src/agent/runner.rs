//! The per-task control loop: screenshot, reason, act, observe.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::actions::{
    parse_action, ActionDispatcher, ConfirmationHandler, Outcome, TakeoverHandler,
};
use crate::adb::{AdbError, DeviceControl, DeviceStatus};
use crate::config::{self, get_messages, Language};
use crate::model::{MessageBuilder, ModelApi, ModelError};
use crate::session::{EventHub, TaskEvent};
use crate::storage::TaskStatus;
use crate::tracker::{
    screenshot_key, ScreenshotBlob, ScriptRecorder, StepOutcome, StepRecord, StepTracker,
    StepType, TrackedStep,
};

/// Consecutive malformed replies tolerated before the task errors out.
const MAX_CONSECUTIVE_PARSE_FAILURES: u32 = 2;

/// Agent behavior configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Iteration budget per task. Clamped to at least 1.
    pub max_steps: u32,
    /// Target device; when absent, the first connected device is pinned at
    /// preflight for the task's lifetime.
    pub device_id: Option<String>,
    pub language: Language,
    pub verbose: bool,
    /// Whether steps and screenshots are recorded to the stores.
    pub recording: bool,
    /// Whether executed actions are additionally captured into a replayable
    /// automation script.
    pub record_script: bool,
    /// Where saved scripts land when `record_script` is on.
    pub script_output_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            device_id: None,
            language: Language::Cn,
            verbose: false,
            recording: true,
            record_script: false,
            script_output_dir: PathBuf::from("scripts"),
        }
    }
}

impl AgentConfig {
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn with_recording(mut self, recording: bool) -> Self {
        self.recording = recording;
        self
    }

    /// Enable script recording into the given output directory.
    pub fn with_script_recording(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.record_script = true;
        self.script_output_dir = output_dir.into();
        self
    }

    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }
}

/// Terminal result of one agent run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: TaskStatus,
    pub message: String,
}

impl RunOutcome {
    fn completed(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Completed,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Error,
            message: message.into(),
        }
    }

    fn stopped(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Stopped,
            message: message.into(),
        }
    }
}

/// Drives one task to termination against a model and a device.
///
/// The agent owns nothing shared: model, device, and tracker are handles to
/// collaborators constructed by the session manager.
pub struct Agent {
    task_id: Uuid,
    task: String,
    config: AgentConfig,
    model: Arc<dyn ModelApi>,
    device: Arc<dyn DeviceControl>,
    confirmation: Arc<dyn ConfirmationHandler>,
    takeover: Arc<dyn TakeoverHandler>,
    tracker: Arc<StepTracker>,
    hub: Arc<EventHub>,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: Uuid,
        task: impl Into<String>,
        config: AgentConfig,
        model: Arc<dyn ModelApi>,
        device: Arc<dyn DeviceControl>,
        confirmation: Arc<dyn ConfirmationHandler>,
        takeover: Arc<dyn TakeoverHandler>,
        tracker: Arc<StepTracker>,
        hub: Arc<EventHub>,
    ) -> Self {
        Self {
            task_id,
            task: task.into(),
            config,
            model,
            device,
            confirmation,
            takeover,
            tracker,
            hub,
        }
    }

    /// Run the loop to termination, then save the recorded script (when
    /// enabled) and flush the step tracker. Never panics; every failure mode
    /// folds into a terminal [`RunOutcome`].
    pub async fn run(&self, cancel: &CancellationToken) -> RunOutcome {
        let mut recorder: Option<ScriptRecorder> = None;
        let outcome = self.run_loop(cancel, &mut recorder).await;

        if let Some(mut recorder) = recorder {
            recorder.finish();
            if !recorder.is_empty() {
                match recorder.save() {
                    Ok(path) => tracing::info!(
                        path = %path.display(),
                        steps = recorder.len(),
                        "automation script saved"
                    ),
                    Err(e) => tracing::warn!(error = %e, "failed to save automation script"),
                }
            }
        }

        if self.config.recording {
            self.tracker.flush(Some(std::time::Duration::from_secs(5))).await;
        }
        outcome
    }

    async fn run_loop(
        &self,
        cancel: &CancellationToken,
        recorder: &mut Option<ScriptRecorder>,
    ) -> RunOutcome {
        let msgs = get_messages(self.config.language);

        // Preflight: pin a device for the task's lifetime.
        let device_id = match self.resolve_device(cancel).await {
            Ok(id) => id,
            Err(outcome) => return outcome,
        };
        let device_ref = device_id.as_deref();

        if self.config.record_script {
            match ScriptRecorder::start(
                &self.config.script_output_dir,
                self.task_id,
                &self.task,
                device_id.clone(),
            ) {
                Ok(started) => *recorder = Some(started),
                Err(e) => {
                    tracing::warn!(error = %e, "script recording unavailable for this run");
                }
            }
        }
        // The dispatcher is bound to the pinned device, not the configured
        // one, so auto-selection carries through to every input op.
        let dispatcher = ActionDispatcher::new(
            self.device.clone(),
            device_id.clone(),
            self.confirmation.clone(),
            self.takeover.clone(),
            self.config.language,
        );

        let mut context: Vec<Value> = Vec::new();
        let mut consecutive_parse_failures = 0u32;
        let max_steps = self.config.max_steps.max(1);

        for step_number in 1..=max_steps {
            if cancel.is_cancelled() {
                return RunOutcome::stopped(msgs.task_stopped);
            }
            let step_started = Instant::now();

            // Observe.
            let shot = match self.device.screenshot(device_ref, cancel).await {
                Ok(shot) => shot,
                Err(AdbError::Cancelled) => return RunOutcome::stopped(msgs.task_stopped),
                Err(e) => {
                    self.emit_error_step(step_number, "adb_io_error", &e.to_string(), step_started);
                    return RunOutcome::error(format!("screenshot failed: {}", e));
                }
            };
            let current_app = self
                .device
                .current_app(device_ref, cancel)
                .await
                .unwrap_or_default();
            let current_app_label =
                config::display_name(&current_app).unwrap_or(current_app.as_str());

            // Build the user turn; the first turn seeds the system prompt and
            // carries the task description.
            let screen_info = MessageBuilder::screen_info(current_app_label);
            if context.is_empty() {
                context.push(MessageBuilder::system(&config::system_prompt_with_resolution(
                    self.config.language,
                    shot.width,
                    shot.height,
                )));
                let text = format!("{}\n\n{}", self.task, screen_info);
                context.push(MessageBuilder::user(&text, Some(&shot.to_base64())));
            } else {
                context.push(MessageBuilder::user(&screen_info, Some(&shot.to_base64())));
            }

            // Reason.
            let reply = match self.model.request(&context, cancel).await {
                Ok(reply) => reply,
                Err(ModelError::Cancelled) => return RunOutcome::stopped(msgs.task_stopped),
                Err(ModelError::Malformed(detail)) => {
                    consecutive_parse_failures += 1;
                    if consecutive_parse_failures > MAX_CONSECUTIVE_PARSE_FAILURES {
                        return RunOutcome::error(format!("malformed model response: {}", detail));
                    }
                    self.compact_last_user_turn(&mut context);
                    context.push(MessageBuilder::user(
                        "Your reply did not contain a valid <answer> block. \
                         Reply with exactly one do(...) or finish(...) call.",
                        None,
                    ));
                    self.emit_error_step(step_number, "malformed_response", &detail, step_started);
                    continue;
                }
                Err(e) => {
                    self.emit_error_step(step_number, "model_error", &e.to_string(), step_started);
                    return RunOutcome::error(format!("model request failed: {}", e));
                }
            };

            if self.config.verbose {
                tracing::info!(step = step_number, thought = %reply.thought, action = %reply.action_text, "model reply");
            }

            // Old screenshots no longer pay their context rent.
            self.compact_last_user_turn(&mut context);
            context.push(MessageBuilder::assistant(&format!(
                "<think>{}</think><answer>{}</answer>",
                reply.thought, reply.action_text
            )));

            // Parse.
            let action = match parse_action(&reply.action_text) {
                Ok(action) => {
                    consecutive_parse_failures = 0;
                    action
                }
                Err(e) => {
                    consecutive_parse_failures += 1;
                    if consecutive_parse_failures > MAX_CONSECUTIVE_PARSE_FAILURES {
                        return RunOutcome::error(format!("malformed model response: {}", e));
                    }
                    context.push(MessageBuilder::user(
                        "The action could not be parsed. Reply with exactly one \
                         do(...) or finish(...) call.",
                        None,
                    ));
                    self.emit_error_step(
                        step_number,
                        "malformed_response",
                        &e.to_string(),
                        step_started,
                    );
                    continue;
                }
            };

            // Act.
            let outcome = match dispatcher
                .execute(&action, (shot.width, shot.height), cancel)
                .await
            {
                Ok(outcome) => outcome,
                Err(AdbError::Cancelled) => return RunOutcome::stopped(msgs.task_stopped),
                Err(e @ AdbError::InputMethodUnavailable) => {
                    self.emit_error_step(
                        step_number,
                        "input_method_unavailable",
                        &e.to_string(),
                        step_started,
                    );
                    return RunOutcome::error(e.to_string());
                }
                Err(e) => {
                    self.emit_error_step(step_number, "adb_io_error", &e.to_string(), step_started);
                    return RunOutcome::error(e.to_string());
                }
            };

            // Record and broadcast.
            let screenshot_blob = self.config.recording.then(|| ScreenshotBlob {
                key: screenshot_key(self.task_id, step_number, shot.captured_at),
                bytes: shot.png.clone(),
            });
            let screenshot_ref = screenshot_blob.as_ref().map(|b| b.key.clone());

            let record = StepRecord {
                step_number,
                task_id: self.task_id,
                step_type: StepType::Action,
                payload: action.to_json(),
                thought: Some(reply.thought.clone()),
                outcome: if outcome.success {
                    StepOutcome::Success
                } else {
                    StepOutcome::Failure
                },
                screenshot_ref: screenshot_ref.clone(),
                elapsed_ms: step_started.elapsed().as_millis() as u64,
                created_at: chrono::Utc::now(),
            };

            if let Some(recorder) = recorder.as_mut() {
                recorder.record_step(
                    &record,
                    outcome
                        .user_message
                        .clone()
                        .filter(|_| !outcome.success),
                );
            }
            if self.config.recording {
                self.tracker.append(TrackedStep {
                    record,
                    screenshot: screenshot_blob,
                });
            }
            self.hub.publish(&TaskEvent::StepUpdate {
                task_id: self.task_id,
                step_number,
                thought: reply.thought,
                action: action.to_json(),
                outcome: if outcome.success {
                    StepOutcome::Success
                } else {
                    StepOutcome::Failure
                },
                screenshot_ref,
                success: outcome.success,
                finished: outcome.should_finish,
            });

            if outcome.should_finish {
                return RunOutcome::completed(finish_message(&outcome, msgs.done));
            }
        }

        RunOutcome::error(msgs.step_budget_exhausted)
    }

    /// Resolve the target device: configured id, or the first connected one.
    async fn resolve_device(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, RunOutcome> {
        let msgs = get_messages(self.config.language);
        if self.config.device_id.is_some() {
            return Ok(self.config.device_id.clone());
        }
        match self.device.list_devices(cancel).await {
            Ok(devices) => devices
                .into_iter()
                .find(|d| d.status == DeviceStatus::Device)
                .map(|d| Some(d.device_id))
                .ok_or_else(|| RunOutcome::error(msgs.no_device)),
            Err(AdbError::Cancelled) => Err(RunOutcome::stopped(msgs.task_stopped)),
            Err(e) => Err(RunOutcome::error(format!("{}: {}", msgs.no_device, e))),
        }
    }

    fn compact_last_user_turn(&self, context: &mut [Value]) {
        if let Some(last) = context.last_mut() {
            MessageBuilder::remove_images(last);
        }
    }

    /// Persist and broadcast an error step for this iteration.
    fn emit_error_step(&self, step_number: u32, kind: &str, detail: &str, started: Instant) {
        tracing::warn!(step = step_number, kind, detail, "error step");
        let mut record = StepRecord::error(self.task_id, step_number, kind, detail);
        record.elapsed_ms = started.elapsed().as_millis() as u64;
        let payload = record.payload.clone();

        if self.config.recording {
            self.tracker.append(TrackedStep::bare(record));
        }
        self.hub.publish(&TaskEvent::StepUpdate {
            task_id: self.task_id,
            step_number,
            thought: String::new(),
            action: payload,
            outcome: StepOutcome::Failure,
            screenshot_ref: None,
            success: false,
            finished: false,
        });
    }
}

fn finish_message(outcome: &Outcome, fallback: &str) -> String {
    outcome
        .user_message
        .clone()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

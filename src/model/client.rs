//! Model client for vision-language inference over an OpenAI-compatible API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::monitor::RequestMonitor;

/// Default retry backoff schedule in seconds. Attempts beyond the schedule
/// reuse the last entry.
pub const DEFAULT_RETRY_DELAYS: [u64; 3] = [1, 2, 4];

/// Per-attempt timeout growth applied on retries.
const RETRY_TIMEOUT_GROWTH: f64 = 1.5;

/// Model client errors.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("transient model error: {0}")]
    Transient(String),
    #[error("model request rejected: {0}")]
    Permanent(String),
    #[error("model request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("malformed model response: {0}")]
    Malformed(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl ModelError {
    fn is_retryable(&self) -> bool {
        matches!(self, ModelError::Transient(_) | ModelError::Timeout { .. })
    }
}

/// Configuration for the vision-language model. Immutable per task.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    /// Floor of the adaptive per-request timeout, seconds.
    pub base_timeout: f64,
    /// Ceiling of the adaptive per-request timeout, seconds.
    pub max_timeout: f64,
    /// Seconds added per character of text content.
    pub content_factor: f64,
    /// Seconds added per image in the payload.
    pub image_factor: f64,
    pub max_retries: u32,
    pub retry_delays: Vec<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: "EMPTY".to_string(),
            model_name: "autoglm-phone-9b".to_string(),
            max_tokens: 3000,
            temperature: 0.0,
            top_p: 0.85,
            frequency_penalty: 0.2,
            base_timeout: 25.0,
            max_timeout: 90.0,
            content_factor: 0.001,
            image_factor: 8.0,
            max_retries: 3,
            retry_delays: DEFAULT_RETRY_DELAYS.to_vec(),
        }
    }
}

impl ModelConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeouts(mut self, base: f64, max: f64) -> Self {
        self.base_timeout = base;
        self.max_timeout = max;
        self
    }

    /// Adaptive timeout for a message payload: grows with text volume and
    /// image count, capped at `max_timeout`.
    pub fn timeout_for(&self, messages: &[Value]) -> Duration {
        let (chars, images) = payload_size(messages);
        let secs = self.base_timeout
            + chars as f64 * self.content_factor
            + images as f64 * self.image_factor;
        Duration::from_secs_f64(secs.min(self.max_timeout))
    }
}

/// Parsed model reply.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub thought: String,
    pub action_text: String,
    pub raw: String,
    pub duration: Duration,
}

/// The model seam consumed by the agent loop.
#[async_trait]
pub trait ModelApi: Send + Sync {
    async fn request(
        &self,
        messages: &[Value],
        cancel: &CancellationToken,
    ) -> Result<ModelReply, ModelError>;
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: String,
}

/// HTTP client for OpenAI-compatible chat completions.
pub struct ModelClient {
    config: ModelConfig,
    client: reqwest::Client,
    monitor: RequestMonitor,
}

impl ModelClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            monitor: RequestMonitor::new(),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn monitor(&self) -> &RequestMonitor {
        &self.monitor
    }

    fn body_for(&self, messages: &[Value]) -> Value {
        json!({
            "messages": messages,
            "model": self.config.model_name,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "frequency_penalty": self.config.frequency_penalty,
        })
    }

    async fn send_once(
        &self,
        body: &Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, ModelError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let started = Instant::now();

        let request = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .timeout(timeout)
            .json(body)
            .send();

        let response = tokio::select! {
            resp = request => resp,
            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
        };

        let response = match response {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                return Err(ModelError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(e) => return Err(ModelError::Transient(e.to_string())),
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Malformed(format!("invalid completion body: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ModelError::Malformed("no choices in response".to_string()))
    }
}

#[async_trait]
impl ModelApi for ModelClient {
    async fn request(
        &self,
        messages: &[Value],
        cancel: &CancellationToken,
    ) -> Result<ModelReply, ModelError> {
        let body = self.body_for(messages);
        let payload_bytes = serde_json::to_string(&body).map(|s| s.len()).unwrap_or(0);
        let base_timeout = self.config.timeout_for(messages);
        let max_attempts = self.config.max_retries + 1;

        let mut last_error: Option<ModelError> = None;

        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                return Err(ModelError::Cancelled);
            }

            let timeout = grow_timeout(base_timeout, attempt, self.config.max_timeout);
            let started = Instant::now();

            match self.send_once(&body, timeout, cancel).await {
                Ok(raw) => {
                    let duration = started.elapsed();
                    self.monitor.record(duration, true, false, payload_bytes);
                    let (thought, action_text) = extract_envelope(&raw)?;
                    return Ok(ModelReply {
                        thought,
                        action_text,
                        raw,
                        duration,
                    });
                }
                Err(ModelError::Cancelled) => return Err(ModelError::Cancelled),
                Err(e) => {
                    let hit_timeout = matches!(e, ModelError::Timeout { .. });
                    self.monitor
                        .record(started.elapsed(), false, hit_timeout, payload_bytes);

                    if !e.is_retryable() {
                        return Err(e);
                    }

                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "model request failed, will retry"
                    );
                    last_error = Some(e);

                    if attempt + 1 < max_attempts {
                        let delay = retry_delay(&self.config.retry_delays, attempt);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
                        }
                    }
                }
            }
        }

        Err(ModelError::RetriesExhausted {
            attempts: max_attempts,
            last: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }
}

/// Map an HTTP status into the retryable/permanent taxonomy.
fn classify_status(status: StatusCode, body: &str) -> ModelError {
    let detail = format!("HTTP {}: {}", status.as_u16(), body.trim());
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        ModelError::Transient(detail)
    } else {
        ModelError::Permanent(detail)
    }
}

fn grow_timeout(base: Duration, attempt: u32, max_secs: f64) -> Duration {
    let grown = base.as_secs_f64() * RETRY_TIMEOUT_GROWTH.powi(attempt as i32);
    Duration::from_secs_f64(grown.min(max_secs))
}

fn retry_delay(schedule: &[u64], attempt: u32) -> Duration {
    let secs = schedule
        .get(attempt as usize)
        .or(schedule.last())
        .copied()
        .unwrap_or(1);
    Duration::from_secs(secs)
}

/// Count text characters and images across a message payload.
fn payload_size(messages: &[Value]) -> (usize, usize) {
    let mut chars = 0;
    let mut images = 0;
    for msg in messages {
        match msg.get("content") {
            Some(Value::String(s)) => chars += s.chars().count(),
            Some(Value::Array(parts)) => {
                for part in parts {
                    match part.get("type").and_then(|t| t.as_str()) {
                        Some("text") => {
                            chars += part
                                .get("text")
                                .and_then(|t| t.as_str())
                                .map(|t| t.chars().count())
                                .unwrap_or(0)
                        }
                        Some("image_url") => images += 1,
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    (chars, images)
}

/// Extract the `<think>…</think><answer>…</answer>` envelope.
///
/// A missing think block yields an empty thought; a missing answer block is a
/// malformed response. Text outside the two blocks is discarded.
pub fn extract_envelope(content: &str) -> Result<(String, String), ModelError> {
    let answer = slice_between(content, "<answer>", "</answer>")
        .ok_or_else(|| ModelError::Malformed(format!("no <answer> block in: {}", truncate(content, 200))))?;
    let thought = slice_between(content, "<think>", "</think>").unwrap_or_default();
    Ok((thought.trim().to_string(), answer.trim().to_string()))
}

fn slice_between<'a>(haystack: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = haystack.find(open)? + open.len();
    let rest = &haystack[start..];
    match rest.find(close) {
        Some(end) => Some(&rest[..end]),
        // tolerate an unterminated final block
        None => Some(rest),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}

/// Helpers for building conversation messages.
pub struct MessageBuilder;

impl MessageBuilder {
    pub fn system(content: &str) -> Value {
        json!({ "role": "system", "content": content })
    }

    /// A user message, optionally carrying a screenshot as a data URL.
    pub fn user(text: &str, image_base64: Option<&str>) -> Value {
        let mut content = Vec::new();
        if let Some(img) = image_base64 {
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/png;base64,{}", img) }
            }));
        }
        content.push(json!({ "type": "text", "text": text }));
        json!({ "role": "user", "content": content })
    }

    pub fn assistant(content: &str) -> Value {
        json!({ "role": "assistant", "content": content })
    }

    /// Strip image parts from a message, keeping text. Used to compact old
    /// turns so the context does not accumulate one screenshot per step.
    pub fn remove_images(message: &mut Value) {
        if let Some(Value::Array(parts)) = message.get_mut("content") {
            parts.retain(|part| {
                part.get("type")
                    .and_then(|t| t.as_str())
                    .map(|t| t == "text")
                    .unwrap_or(false)
            });
        }
    }

    /// Screen metadata JSON attached to every user turn.
    pub fn screen_info(current_app: &str) -> String {
        json!({ "current_app": current_app }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_envelope_full() {
        let content = "<think>tap the search box</think><answer>do(action=\"Tap\", element=[500, 300])</answer>";
        let (thought, action) = extract_envelope(content).unwrap();
        assert_eq!(thought, "tap the search box");
        assert_eq!(action, "do(action=\"Tap\", element=[500, 300])");
    }

    #[test]
    fn test_extract_envelope_missing_think() {
        let (thought, action) = extract_envelope("<answer>finish(message=\"ok\")</answer>").unwrap();
        assert_eq!(thought, "");
        assert_eq!(action, "finish(message=\"ok\")");
    }

    #[test]
    fn test_extract_envelope_surrounding_noise() {
        let content = "  sure!\n<think>a</think>\n  <answer>do(action=\"Back\")</answer>\ntrailing prose";
        let (thought, action) = extract_envelope(content).unwrap();
        assert_eq!(thought, "a");
        assert_eq!(action, "do(action=\"Back\")");
    }

    #[test]
    fn test_extract_envelope_unterminated_answer() {
        let (_, action) = extract_envelope("<answer>finish(message=\"cut off\")").unwrap();
        assert_eq!(action, "finish(message=\"cut off\")");
    }

    #[test]
    fn test_extract_envelope_missing_answer() {
        let err = extract_envelope("<think>hmm</think> no action here").unwrap_err();
        assert!(matches!(err, ModelError::Malformed(_)));
    }

    #[test]
    fn test_adaptive_timeout_grows_and_caps() {
        let config = ModelConfig::default();
        let text_only = vec![MessageBuilder::system("hello")];
        let base = config.timeout_for(&text_only);
        assert!(base >= Duration::from_secs_f64(config.base_timeout));

        let with_image = vec![MessageBuilder::user("look", Some("aaaa"))];
        assert!(config.timeout_for(&with_image) > base);

        let huge: Vec<Value> = (0..40)
            .map(|_| MessageBuilder::user("x", Some("aaaa")))
            .collect();
        assert_eq!(
            config.timeout_for(&huge),
            Duration::from_secs_f64(config.max_timeout)
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            ModelError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ModelError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            ModelError::Permanent(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, ""),
            ModelError::Permanent(_)
        ));
    }

    #[test]
    fn test_retry_delay_schedule() {
        let schedule = vec![1, 2, 4];
        assert_eq!(retry_delay(&schedule, 0), Duration::from_secs(1));
        assert_eq!(retry_delay(&schedule, 2), Duration::from_secs(4));
        assert_eq!(retry_delay(&schedule, 9), Duration::from_secs(4));
    }

    #[test]
    fn test_grow_timeout_caps() {
        let base = Duration::from_secs(60);
        assert_eq!(grow_timeout(base, 0, 90.0), Duration::from_secs(60));
        assert_eq!(grow_timeout(base, 1, 90.0), Duration::from_secs(90));
    }

    #[test]
    fn test_payload_size_counts() {
        let messages = vec![
            MessageBuilder::system("abc"),
            MessageBuilder::user("defg", Some("imagedata")),
        ];
        let (chars, images) = payload_size(&messages);
        assert_eq!(chars, 7);
        assert_eq!(images, 1);
    }

    #[test]
    fn test_remove_images() {
        let mut msg = MessageBuilder::user("caption", Some("data"));
        MessageBuilder::remove_images(&mut msg);
        let parts = msg["content"].as_array().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0]["type"], "text");
    }
}

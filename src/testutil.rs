//! Shared fakes for loop-level tests: a scripted model and a stub device.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::adb::{
    AdbError, ConnectionType, DeviceControl, DeviceInfo, DeviceStatus, KeyCode, Screenshot,
};
use crate::model::{extract_envelope, ModelApi, ModelError, ModelReply};

/// One scripted model turn.
pub enum ScriptedReply {
    /// Raw assistant content, run through the real envelope extractor.
    Content(String),
    /// Block until the cancellation token fires.
    Hang,
    /// Fail with the given error.
    Fail(ModelError),
}

/// Model stub that plays back a script of replies.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ScriptedReply>>,
    /// When set, an exhausted script keeps repeating this content.
    repeat: Option<String>,
    pub requests: Mutex<Vec<usize>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ScriptedReply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Script that answers every request with the same content.
    pub fn repeating(content: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            repeat: Some(content.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Shorthand for a `<think>…</think><answer>…</answer>` turn.
    pub fn turn(thought: &str, action: &str) -> ScriptedReply {
        ScriptedReply::Content(format!(
            "<think>{}</think><answer>{}</answer>",
            thought, action
        ))
    }
}

#[async_trait]
impl ModelApi for ScriptedModel {
    async fn request(
        &self,
        messages: &[serde_json::Value],
        cancel: &CancellationToken,
    ) -> Result<ModelReply, ModelError> {
        self.requests.lock().push(messages.len());
        let next = self.replies.lock().pop_front();
        let content = match next {
            Some(ScriptedReply::Content(content)) => content,
            Some(ScriptedReply::Hang) => {
                cancel.cancelled().await;
                return Err(ModelError::Cancelled);
            }
            Some(ScriptedReply::Fail(e)) => return Err(e),
            None => match &self.repeat {
                Some(content) => content.clone(),
                None => {
                    return Err(ModelError::Permanent(
                        "scripted model exhausted".to_string(),
                    ))
                }
            },
        };
        let (thought, action_text) = extract_envelope(&content)?;
        Ok(ModelReply {
            thought,
            action_text,
            raw: content,
            duration: std::time::Duration::from_millis(1),
        })
    }
}

/// Device stub: reports one connected device, serves black screenshots, and
/// records every input operation.
pub struct StubDevice {
    pub calls: Mutex<Vec<String>>,
    pub devices: Vec<DeviceInfo>,
    pub foreground: Mutex<String>,
}

impl StubDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            devices: vec![DeviceInfo {
                device_id: "stub-1".to_string(),
                connection_type: ConnectionType::Usb,
                status: DeviceStatus::Device,
                model: Some("StubPhone".to_string()),
            }],
            foreground: Mutex::new(String::new()),
        })
    }

    /// A stub with no attached devices, for preflight failure tests.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            devices: Vec::new(),
            foreground: Mutex::new(String::new()),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl DeviceControl for StubDevice {
    async fn list_devices(&self, _cancel: &CancellationToken) -> Result<Vec<DeviceInfo>, AdbError> {
        Ok(self.devices.clone())
    }

    async fn screenshot(
        &self,
        _device_id: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<Screenshot, AdbError> {
        Ok(Screenshot::black_fallback(false))
    }

    async fn current_app(
        &self,
        _device_id: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<String, AdbError> {
        Ok(self.foreground.lock().clone())
    }

    async fn tap(
        &self,
        _device_id: Option<&str>,
        x: u32,
        y: u32,
        _cancel: &CancellationToken,
    ) -> Result<(), AdbError> {
        self.calls.lock().push(format!("tap {} {}", x, y));
        Ok(())
    }

    async fn double_tap(
        &self,
        _device_id: Option<&str>,
        x: u32,
        y: u32,
        _cancel: &CancellationToken,
    ) -> Result<(), AdbError> {
        self.calls.lock().push(format!("double_tap {} {}", x, y));
        Ok(())
    }

    async fn long_press(
        &self,
        _device_id: Option<&str>,
        x: u32,
        y: u32,
        duration_ms: u64,
        _cancel: &CancellationToken,
    ) -> Result<(), AdbError> {
        self.calls
            .lock()
            .push(format!("long_press {} {} {}", x, y, duration_ms));
        Ok(())
    }

    async fn swipe(
        &self,
        _device_id: Option<&str>,
        start: (u32, u32),
        end: (u32, u32),
        duration_ms: u64,
        _cancel: &CancellationToken,
    ) -> Result<(), AdbError> {
        self.calls.lock().push(format!(
            "swipe {},{} {},{} {}",
            start.0, start.1, end.0, end.1, duration_ms
        ));
        Ok(())
    }

    async fn key_event(
        &self,
        _device_id: Option<&str>,
        key: KeyCode,
        _cancel: &CancellationToken,
    ) -> Result<(), AdbError> {
        self.calls.lock().push(format!("key {:?}", key));
        Ok(())
    }

    async fn type_text(
        &self,
        _device_id: Option<&str>,
        text: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), AdbError> {
        self.calls.lock().push(format!("type {}", text));
        Ok(())
    }

    async fn launch_app(
        &self,
        _device_id: Option<&str>,
        package: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool, AdbError> {
        self.calls.lock().push(format!("launch {}", package));
        *self.foreground.lock() = package.to_string();
        Ok(true)
    }
}

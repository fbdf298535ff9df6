//! Action dispatch: validates an action and routes it to the device.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::adb::{AdbError, DeviceControl, KeyCode};
use crate::config::{self, get_messages, Language};

use super::types::Action;

/// Longest `Wait` the dispatcher will honor.
const MAX_WAIT: Duration = Duration::from_secs(30);

/// Default swipe duration when the gesture is too short to scale.
const MIN_SWIPE_MS: u64 = 300;
const MAX_SWIPE_MS: u64 = 1000;

/// Default long-press duration.
const LONG_PRESS_MS: u64 = 3000;

/// Result of executing one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub should_finish: bool,
    pub user_message: Option<String>,
}

impl Outcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            should_finish: false,
            user_message: None,
        }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            success: true,
            should_finish: false,
            user_message: Some(message.into()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            should_finish: false,
            user_message: Some(message.into()),
        }
    }

    pub fn finished(message: impl Into<String>) -> Self {
        Self {
            success: true,
            should_finish: true,
            user_message: Some(message.into()),
        }
    }
}

/// Decision returned by a takeover hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeoverDecision {
    Completed,
    Cancelled,
}

/// Capability interface for confirming sensitive actions.
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn confirm(&self, message: &str) -> bool;
}

/// Capability interface for human-takeover hand-off (login, captcha).
/// Implementations block until the operator signals completion.
#[async_trait]
pub trait TakeoverHandler: Send + Sync {
    async fn take_over(&self, message: &str) -> TakeoverDecision;
}

/// Null object for headless runs: approves every sensitive action.
pub struct AutoApprove;

#[async_trait]
impl ConfirmationHandler for AutoApprove {
    async fn confirm(&self, _message: &str) -> bool {
        true
    }
}

/// Null object for headless runs: declines every takeover immediately.
pub struct AutoCancelTakeover;

#[async_trait]
impl TakeoverHandler for AutoCancelTakeover {
    async fn take_over(&self, _message: &str) -> TakeoverDecision {
        TakeoverDecision::Cancelled
    }
}

/// Translates parsed actions into device operations.
///
/// Pure translation layer: the dispatcher talks to the device seam and the
/// callback capabilities, never to the model or the network.
pub struct ActionDispatcher {
    device: Arc<dyn DeviceControl>,
    device_id: Option<String>,
    confirmation: Arc<dyn ConfirmationHandler>,
    takeover: Arc<dyn TakeoverHandler>,
    lang: Language,
}

impl ActionDispatcher {
    pub fn new(
        device: Arc<dyn DeviceControl>,
        device_id: Option<String>,
        confirmation: Arc<dyn ConfirmationHandler>,
        takeover: Arc<dyn TakeoverHandler>,
        lang: Language,
    ) -> Self {
        Self {
            device,
            device_id,
            confirmation,
            takeover,
            lang,
        }
    }

    /// Execute one action against a screen of the given pixel dimensions.
    ///
    /// Device failures on input primitives come back as failure outcomes so
    /// the model can observe and recover; cancellation and a missing input
    /// method propagate as errors because the loop cannot continue past them.
    pub async fn execute(
        &self,
        action: &Action,
        screen: (u32, u32),
        cancel: &CancellationToken,
    ) -> Result<Outcome, AdbError> {
        let (width, height) = screen;
        let device_id = self.device_id.as_deref();
        let msgs = get_messages(self.lang);

        let result = match action {
            Action::Launch { app } => {
                let Some(package) = config::resolve(app) else {
                    return Ok(Outcome::failed(format!("{}: {}", msgs.app_not_supported, app)));
                };
                match self.device.launch_app(device_id, package, cancel).await {
                    Ok(true) => return Ok(Outcome::ok()),
                    Ok(false) => {
                        return Ok(Outcome::failed(format!("failed to launch {}", app)))
                    }
                    Err(e) => Err(e),
                }
            }
            Action::Tap {
                point,
                sensitive_message,
            } => {
                if let Some(message) = sensitive_message {
                    if !self.confirm(message, cancel).await? {
                        return Ok(Outcome::ok_with(msgs.user_denied));
                    }
                }
                let (x, y) = point.to_pixels(width, height);
                self.device.tap(device_id, x, y, cancel).await
            }
            Action::DoubleTap { point } => {
                let (x, y) = point.to_pixels(width, height);
                self.device.double_tap(device_id, x, y, cancel).await
            }
            Action::LongPress { point } => {
                let (x, y) = point.to_pixels(width, height);
                self.device
                    .long_press(device_id, x, y, LONG_PRESS_MS, cancel)
                    .await
            }
            Action::Swipe { start, end } => {
                let from = start.to_pixels(width, height);
                let to = end.to_pixels(width, height);
                let duration_ms = swipe_duration_ms(from, to);
                self.device
                    .swipe(device_id, from, to, duration_ms, cancel)
                    .await
            }
            Action::Type { text } => self.device.type_text(device_id, text, cancel).await,
            Action::Back => self.device.key_event(device_id, KeyCode::Back, cancel).await,
            Action::Home => self.device.key_event(device_id, KeyCode::Home, cancel).await,
            Action::Wait { duration } => {
                let clamped = clamp_wait(*duration);
                if clamped != *duration {
                    tracing::warn!(
                        requested_ms = duration.as_millis() as u64,
                        clamped_ms = clamped.as_millis() as u64,
                        "wait duration out of range, clamped"
                    );
                }
                if !clamped.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(clamped) => {}
                        _ = cancel.cancelled() => return Err(AdbError::Cancelled),
                    }
                }
                return Ok(Outcome::ok());
            }
            Action::TakeOver { message } => {
                let decision = tokio::select! {
                    decision = self.takeover.take_over(message) => decision,
                    _ = cancel.cancelled() => return Err(AdbError::Cancelled),
                };
                return Ok(match decision {
                    TakeoverDecision::Completed => Outcome::ok_with(msgs.takeover_requested),
                    TakeoverDecision::Cancelled => {
                        Outcome::failed(format!("{}: {}", msgs.takeover_requested, message))
                    }
                });
            }
            Action::Finish { message } => return Ok(Outcome::finished(message.clone())),
        };

        match result {
            Ok(()) => Ok(Outcome::ok()),
            Err(AdbError::Cancelled) => Err(AdbError::Cancelled),
            Err(AdbError::InputMethodUnavailable) => Err(AdbError::InputMethodUnavailable),
            Err(e) => {
                tracing::warn!(action = action.kind(), error = %e, "device operation failed");
                Ok(Outcome::failed(e.to_string()))
            }
        }
    }

    async fn confirm(
        &self,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, AdbError> {
        tokio::select! {
            approved = self.confirmation.confirm(message) => Ok(approved),
            _ = cancel.cancelled() => Err(AdbError::Cancelled),
        }
    }
}

/// Scale swipe duration with gesture length.
fn swipe_duration_ms(from: (u32, u32), to: (u32, u32)) -> u64 {
    let dx = from.0.abs_diff(to.0) as u64;
    let dy = from.1.abs_diff(to.1) as u64;
    let distance = ((dx * dx + dy * dy) as f64).sqrt() as u64;
    (distance / 2).clamp(MIN_SWIPE_MS, MAX_SWIPE_MS)
}

/// Enforce 0 < duration ≤ 30s. Zero waits are skipped entirely.
fn clamp_wait(duration: Duration) -> Duration {
    duration.min(MAX_WAIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::types::RelPoint;
    use crate::adb::{DeviceInfo, Screenshot};
    use parking_lot::Mutex;

    /// Records device calls instead of touching adb.
    #[derive(Default)]
    struct FakeDevice {
        calls: Mutex<Vec<String>>,
        launch_confirms: bool,
    }

    impl FakeDevice {
        fn confirming() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                launch_confirms: true,
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl DeviceControl for FakeDevice {
        async fn list_devices(
            &self,
            _cancel: &CancellationToken,
        ) -> Result<Vec<DeviceInfo>, AdbError> {
            Ok(Vec::new())
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
            Ok(String::new())
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
                "swipe {},{} -> {},{} in {}",
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
            Ok(self.launch_confirms)
        }
    }

    /// Confirmation handler with a scripted answer, counting invocations.
    struct ScriptedConfirm {
        answer: bool,
        asked: Mutex<Vec<String>>,
    }

    impl ScriptedConfirm {
        fn new(answer: bool) -> Self {
            Self {
                answer,
                asked: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ConfirmationHandler for ScriptedConfirm {
        async fn confirm(&self, message: &str) -> bool {
            self.asked.lock().push(message.to_string());
            self.answer
        }
    }

    fn dispatcher(
        device: Arc<FakeDevice>,
        confirm: Arc<dyn ConfirmationHandler>,
    ) -> ActionDispatcher {
        ActionDispatcher::new(device, None, confirm, Arc::new(AutoCancelTakeover), Language::En)
    }

    #[tokio::test]
    async fn test_tap_maps_relative_coordinates() {
        let device = Arc::new(FakeDevice::default());
        let d = dispatcher(device.clone(), Arc::new(AutoApprove));
        let cancel = CancellationToken::new();

        let action = Action::Tap {
            point: RelPoint::new(500, 300),
            sensitive_message: None,
        };
        let outcome = d.execute(&action, (1080, 2400), &cancel).await.unwrap();
        assert!(outcome.success);
        assert_eq!(device.calls(), vec!["tap 540 720"]);
    }

    #[tokio::test]
    async fn test_sensitive_tap_denied_skips_tap() {
        let device = Arc::new(FakeDevice::default());
        let confirm = Arc::new(ScriptedConfirm::new(false));
        let d = dispatcher(device.clone(), confirm.clone());
        let cancel = CancellationToken::new();

        let action = Action::Tap {
            point: RelPoint::new(500, 500),
            sensitive_message: Some("pay".to_string()),
        };
        let outcome = d.execute(&action, (1080, 2400), &cancel).await.unwrap();

        assert!(outcome.success);
        assert!(!outcome.should_finish);
        assert_eq!(outcome.user_message.as_deref(), Some("user denied"));
        assert!(device.calls().is_empty(), "tap must not be issued");
        assert_eq!(confirm.asked.lock().as_slice(), ["pay".to_string()]);
    }

    #[tokio::test]
    async fn test_sensitive_tap_approved_taps_once() {
        let device = Arc::new(FakeDevice::default());
        let confirm = Arc::new(ScriptedConfirm::new(true));
        let d = dispatcher(device.clone(), confirm.clone());
        let cancel = CancellationToken::new();

        let action = Action::Tap {
            point: RelPoint::new(1000, 0),
            sensitive_message: Some("pay now".to_string()),
        };
        let outcome = d.execute(&action, (1080, 2400), &cancel).await.unwrap();

        assert!(outcome.success);
        assert_eq!(confirm.asked.lock().len(), 1);
        assert_eq!(device.calls(), vec!["tap 1079 0"]);
    }

    #[tokio::test]
    async fn test_launch_unknown_app() {
        let device = Arc::new(FakeDevice::confirming());
        let d = dispatcher(device.clone(), Arc::new(AutoApprove));
        let cancel = CancellationToken::new();

        let action = Action::Launch {
            app: "NoSuchApp".to_string(),
        };
        let outcome = d.execute(&action, (1080, 2400), &cancel).await.unwrap();
        assert!(!outcome.success);
        assert!(!outcome.should_finish);
        assert!(outcome.user_message.unwrap().contains("app not supported"));
        assert!(device.calls().is_empty());
    }

    #[tokio::test]
    async fn test_launch_resolves_registry() {
        let device = Arc::new(FakeDevice::confirming());
        let d = dispatcher(device.clone(), Arc::new(AutoApprove));
        let cancel = CancellationToken::new();

        let action = Action::Launch {
            app: "微信".to_string(),
        };
        let outcome = d.execute(&action, (1080, 2400), &cancel).await.unwrap();
        assert!(outcome.success);
        assert_eq!(device.calls(), vec!["launch com.tencent.mm"]);
    }

    #[tokio::test]
    async fn test_finish_terminates() {
        let device = Arc::new(FakeDevice::default());
        let d = dispatcher(device.clone(), Arc::new(AutoApprove));
        let cancel = CancellationToken::new();

        let action = Action::Finish {
            message: "ok".to_string(),
        };
        let outcome = d.execute(&action, (1080, 2400), &cancel).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.should_finish);
        assert_eq!(outcome.user_message.as_deref(), Some("ok"));
        assert!(device.calls().is_empty());
    }

    #[tokio::test]
    async fn test_wait_cancellation() {
        let device = Arc::new(FakeDevice::default());
        let d = dispatcher(device, Arc::new(AutoApprove));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let action = Action::Wait {
            duration: Duration::from_secs(10),
        };
        let err = d.execute(&action, (1080, 2400), &cancel).await.unwrap_err();
        assert!(matches!(err, AdbError::Cancelled));
    }

    #[tokio::test]
    async fn test_wait_zero_returns_immediately() {
        let device = Arc::new(FakeDevice::default());
        let d = dispatcher(device, Arc::new(AutoApprove));
        let cancel = CancellationToken::new();

        let action = Action::Wait {
            duration: Duration::ZERO,
        };
        let outcome = d.execute(&action, (1080, 2400), &cancel).await.unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_takeover_auto_cancel() {
        let device = Arc::new(FakeDevice::default());
        let d = dispatcher(device, Arc::new(AutoApprove));
        let cancel = CancellationToken::new();

        let action = Action::TakeOver {
            message: "log in please".to_string(),
        };
        let outcome = d.execute(&action, (1080, 2400), &cancel).await.unwrap();
        assert!(!outcome.success);
        assert!(!outcome.should_finish);
    }

    #[test]
    fn test_swipe_duration_scaling() {
        assert_eq!(swipe_duration_ms((0, 0), (0, 10)), MIN_SWIPE_MS);
        assert_eq!(swipe_duration_ms((0, 0), (0, 4000)), MAX_SWIPE_MS);
        let mid = swipe_duration_ms((0, 0), (0, 1000));
        assert!(mid > MIN_SWIPE_MS && mid < MAX_SWIPE_MS);
    }

    #[test]
    fn test_clamp_wait() {
        assert_eq!(clamp_wait(Duration::from_secs(60)), MAX_WAIT);
        assert_eq!(clamp_wait(Duration::from_secs(5)), Duration::from_secs(5));
    }
}

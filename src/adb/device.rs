//! Device I/O primitives over ADB.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::connection::{parse_devices_output, DeviceInfo};
use super::exec::{
    AdbError, AdbRunner, DUMPSYS_TIMEOUT, INPUT_TIMEOUT, LAUNCH_TIMEOUT,
};
use super::input;
use super::screenshot::{self, Screenshot};

/// Key events the agent issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCode {
    Back,
    Home,
}

impl KeyCode {
    fn event_name(&self) -> &'static str {
        match self {
            KeyCode::Back => "KEYCODE_BACK",
            KeyCode::Home => "KEYCODE_HOME",
        }
    }
}

/// Settle window after a tap-like gesture, letting the UI react before the
/// next screenshot.
const TAP_SETTLE: Duration = Duration::from_millis(400);

/// How often and how long to poll `current_app` when confirming a launch.
const LAUNCH_CONFIRM_ATTEMPTS: u32 = 3;
const LAUNCH_CONFIRM_INTERVAL: Duration = Duration::from_secs(1);

/// The device seam consumed by the dispatcher and the agent loop.
///
/// [`Adb`] is the production implementation; tests drive the loop through a
/// scripted fake.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    async fn list_devices(&self, cancel: &CancellationToken) -> Result<Vec<DeviceInfo>, AdbError>;

    async fn screenshot(
        &self,
        device_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Screenshot, AdbError>;

    /// Best-effort top-of-stack package id; empty string when undetermined.
    async fn current_app(
        &self,
        device_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, AdbError>;

    async fn tap(
        &self,
        device_id: Option<&str>,
        x: u32,
        y: u32,
        cancel: &CancellationToken,
    ) -> Result<(), AdbError>;

    async fn double_tap(
        &self,
        device_id: Option<&str>,
        x: u32,
        y: u32,
        cancel: &CancellationToken,
    ) -> Result<(), AdbError>;

    async fn long_press(
        &self,
        device_id: Option<&str>,
        x: u32,
        y: u32,
        duration_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<(), AdbError>;

    async fn swipe(
        &self,
        device_id: Option<&str>,
        start: (u32, u32),
        end: (u32, u32),
        duration_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<(), AdbError>;

    async fn key_event(
        &self,
        device_id: Option<&str>,
        key: KeyCode,
        cancel: &CancellationToken,
    ) -> Result<(), AdbError>;

    async fn type_text(
        &self,
        device_id: Option<&str>,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdbError>;

    /// Launch an app by package id. `Ok(true)` means the launch was confirmed
    /// by observing the package in the foreground within a bounded window.
    async fn launch_app(
        &self,
        device_id: Option<&str>,
        package: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, AdbError>;
}

/// Production device I/O over the shared [`AdbRunner`].
pub struct Adb {
    runner: AdbRunner,
}

impl Default for Adb {
    fn default() -> Self {
        Self::new()
    }
}

impl Adb {
    pub fn new() -> Self {
        Self {
            runner: AdbRunner::new(),
        }
    }

    pub fn with_path(adb_path: impl Into<String>) -> Self {
        Self {
            runner: AdbRunner::with_path(adb_path),
        }
    }

    pub fn runner(&self) -> &AdbRunner {
        &self.runner
    }

    /// Verify adb is invocable. Surfaced at preflight.
    pub async fn check_available(&self) -> Result<(), AdbError> {
        self.runner.check_available().await
    }

    async fn input(
        &self,
        device_id: Option<&str>,
        args: &[&str],
        op: &'static str,
        cancel: &CancellationToken,
    ) -> Result<(), AdbError> {
        self.runner
            .run_checked(device_id, args, op, INPUT_TIMEOUT, cancel)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceControl for Adb {
    async fn list_devices(&self, cancel: &CancellationToken) -> Result<Vec<DeviceInfo>, AdbError> {
        let out = self
            .runner
            .run_checked(None, &["devices", "-l"], "devices", INPUT_TIMEOUT, cancel)
            .await?;
        Ok(parse_devices_output(&out.stdout_text()))
    }

    async fn screenshot(
        &self,
        device_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Screenshot, AdbError> {
        screenshot::capture(&self.runner, device_id, cancel).await
    }

    async fn current_app(
        &self,
        device_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, AdbError> {
        let out = self
            .runner
            .run(
                device_id,
                &["shell", "dumpsys", "activity", "activities"],
                "dumpsys",
                DUMPSYS_TIMEOUT,
                cancel,
            )
            .await?;
        Ok(top_package(&out.stdout_text()).unwrap_or_default())
    }

    async fn tap(
        &self,
        device_id: Option<&str>,
        x: u32,
        y: u32,
        cancel: &CancellationToken,
    ) -> Result<(), AdbError> {
        let (xs, ys) = (x.to_string(), y.to_string());
        self.input(device_id, &["shell", "input", "tap", &xs, &ys], "tap", cancel)
            .await?;
        input::settle(TAP_SETTLE, cancel).await
    }

    async fn double_tap(
        &self,
        device_id: Option<&str>,
        x: u32,
        y: u32,
        cancel: &CancellationToken,
    ) -> Result<(), AdbError> {
        let (xs, ys) = (x.to_string(), y.to_string());
        self.input(device_id, &["shell", "input", "tap", &xs, &ys], "tap", cancel)
            .await?;
        input::settle(Duration::from_millis(100), cancel).await?;
        self.input(device_id, &["shell", "input", "tap", &xs, &ys], "tap", cancel)
            .await?;
        input::settle(TAP_SETTLE, cancel).await
    }

    async fn long_press(
        &self,
        device_id: Option<&str>,
        x: u32,
        y: u32,
        duration_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<(), AdbError> {
        let duration = duration_ms.max(500);
        let (xs, ys, ds) = (x.to_string(), y.to_string(), duration.to_string());
        // a swipe that does not move is a press-and-hold
        self.input(
            device_id,
            &["shell", "input", "swipe", &xs, &ys, &xs, &ys, &ds],
            "long-press",
            cancel,
        )
        .await?;
        input::settle(TAP_SETTLE, cancel).await
    }

    async fn swipe(
        &self,
        device_id: Option<&str>,
        start: (u32, u32),
        end: (u32, u32),
        duration_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<(), AdbError> {
        let (x1, y1) = (start.0.to_string(), start.1.to_string());
        let (x2, y2) = (end.0.to_string(), end.1.to_string());
        let ds = duration_ms.to_string();
        self.input(
            device_id,
            &["shell", "input", "swipe", &x1, &y1, &x2, &y2, &ds],
            "swipe",
            cancel,
        )
        .await?;
        let settle = Duration::from_millis((duration_ms / 2).clamp(300, 1000));
        input::settle(settle, cancel).await
    }

    async fn key_event(
        &self,
        device_id: Option<&str>,
        key: KeyCode,
        cancel: &CancellationToken,
    ) -> Result<(), AdbError> {
        self.input(
            device_id,
            &["shell", "input", "keyevent", key.event_name()],
            "keyevent",
            cancel,
        )
        .await?;
        input::settle(TAP_SETTLE, cancel).await
    }

    async fn type_text(
        &self,
        device_id: Option<&str>,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AdbError> {
        input::type_text(&self.runner, device_id, text, cancel).await
    }

    async fn launch_app(
        &self,
        device_id: Option<&str>,
        package: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, AdbError> {
        let out = self
            .runner
            .run(
                device_id,
                &[
                    "shell",
                    "monkey",
                    "-p",
                    package,
                    "-c",
                    "android.intent.category.LAUNCHER",
                    "1",
                ],
                "launch",
                LAUNCH_TIMEOUT,
                cancel,
            )
            .await?;
        if !out.status_ok {
            return Ok(false);
        }

        for _ in 0..LAUNCH_CONFIRM_ATTEMPTS {
            input::settle(LAUNCH_CONFIRM_INTERVAL, cancel).await?;
            match self.current_app(device_id, cancel).await {
                Ok(front) if front == package => return Ok(true),
                Ok(_) => {}
                Err(AdbError::Cancelled) => return Err(AdbError::Cancelled),
                Err(e) => {
                    tracing::debug!(error = %e, "launch confirmation probe failed");
                }
            }
        }
        Ok(false)
    }
}

/// Extract the top-of-stack package from `dumpsys activity activities`.
fn top_package(dump: &str) -> Option<String> {
    for line in dump.lines() {
        let line = line.trim();
        if line.starts_with("topResumedActivity")
            || line.starts_with("mResumedActivity")
            || line.contains("mFocusedApp")
            || line.contains("mCurrentFocus")
        {
            // component records look like `.../com.tencent.mm/.ui.LauncherUI ...`
            if let Some(component) = line.split_whitespace().find(|tok| tok.contains('/')) {
                let package = component.split('/').next().unwrap_or("");
                if package.contains('.') {
                    return Some(package.trim_end_matches('}').to_string());
                }
            }
        }
    }
    None
}

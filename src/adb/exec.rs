//! Shared `adb` subprocess runner.
//!
//! Every ADB interaction in the crate funnels through [`AdbRunner`], which
//! serializes commands per device, applies per-operation timeouts, and kills
//! the child process when the task's cancellation token fires.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Per-operation timeouts.
pub const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(10);
pub const INPUT_TIMEOUT: Duration = Duration::from_secs(5);
pub const LAUNCH_TIMEOUT: Duration = Duration::from_secs(15);
pub const DUMPSYS_TIMEOUT: Duration = Duration::from_secs(5);

/// ADB layer errors.
#[derive(Error, Debug)]
pub enum AdbError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device unauthorized: {0}")]
    Unauthorized(String),
    #[error("ADB keyboard IME is not installed or enabled on the device")]
    InputMethodUnavailable,
    #[error("adb {op} timed out after {elapsed_ms}ms")]
    Timeout { op: &'static str, elapsed_ms: u64 },
    #[error("operation cancelled")]
    Cancelled,
    #[error("adb I/O error: {0}")]
    Io(String),
}

/// Raw output of an adb invocation.
#[derive(Debug)]
pub struct AdbOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub status_ok: bool,
}

impl AdbOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Executes `adb` commands with per-device serialization.
///
/// Concurrent tasks targeting the same device never overlap on the adb
/// channel; tasks on distinct devices proceed in parallel.
pub struct AdbRunner {
    adb_path: String,
    device_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Default for AdbRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl AdbRunner {
    /// Create a runner resolving `adb` via PATH.
    pub fn new() -> Self {
        Self::with_path("adb")
    }

    /// Create a runner with an explicit adb binary path.
    pub fn with_path(adb_path: impl Into<String>) -> Self {
        Self {
            adb_path: adb_path.into(),
            device_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn adb_path(&self) -> &str {
        &self.adb_path
    }

    /// Verify the adb binary can be invoked at all. Used during preflight so
    /// a missing installation surfaces as one clear message instead of a
    /// per-command failure.
    pub async fn check_available(&self) -> Result<(), AdbError> {
        let out = Command::new(&self.adb_path)
            .arg("version")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| AdbError::Io(format!("cannot invoke {}: {}", self.adb_path, e)))?;
        if out.status.success() {
            Ok(())
        } else {
            Err(AdbError::Io(format!(
                "adb version exited with {:?}",
                out.status.code()
            )))
        }
    }

    fn lock_for(&self, device_id: Option<&str>) -> Arc<tokio::sync::Mutex<()>> {
        let key = device_id.unwrap_or("").to_string();
        let mut locks = self.device_locks.lock();
        locks
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Run an adb command against a device.
    ///
    /// Holds the device lock for the lifetime of the child process. The child
    /// is killed when `timeout` elapses or `cancel` fires.
    pub async fn run(
        &self,
        device_id: Option<&str>,
        args: &[&str],
        op: &'static str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AdbOutput, AdbError> {
        let lock = self.lock_for(device_id);
        let _guard = lock.lock().await;

        if cancel.is_cancelled() {
            return Err(AdbError::Cancelled);
        }

        let mut cmd = Command::new(&self.adb_path);
        if let Some(id) = device_id {
            cmd.arg("-s").arg(id);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| AdbError::Io(format!("failed to spawn {}: {}", self.adb_path, e)))?;

        let started = std::time::Instant::now();
        let output = tokio::select! {
            out = child.wait_with_output() => {
                out.map_err(|e| AdbError::Io(e.to_string()))?
            }
            _ = tokio::time::sleep(timeout) => {
                // kill_on_drop reaps the child once the future is dropped
                return Err(AdbError::Timeout { op, elapsed_ms: started.elapsed().as_millis() as u64 });
            }
            _ = cancel.cancelled() => {
                return Err(AdbError::Cancelled);
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        classify_stderr(&stderr, device_id)?;

        Ok(AdbOutput {
            stdout: output.stdout,
            stderr,
            status_ok: output.status.success(),
        })
    }

    /// Like [`run`](Self::run) but fails when adb exits nonzero.
    pub async fn run_checked(
        &self,
        device_id: Option<&str>,
        args: &[&str],
        op: &'static str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AdbOutput, AdbError> {
        let out = self.run(device_id, args, op, timeout, cancel).await?;
        if out.status_ok {
            Ok(out)
        } else {
            Err(AdbError::Io(format!(
                "adb {} failed: {}",
                op,
                out.stderr.trim()
            )))
        }
    }
}

/// Map the well-known adb stderr phrases to typed errors.
fn classify_stderr(stderr: &str, device_id: Option<&str>) -> Result<(), AdbError> {
    let lower = stderr.to_ascii_lowercase();
    let id = device_id.unwrap_or("<any>").to_string();
    if lower.contains("device") && lower.contains("not found") {
        return Err(AdbError::DeviceNotFound(id));
    }
    if lower.contains("no devices/emulators found") {
        return Err(AdbError::DeviceNotFound(id));
    }
    if lower.contains("unauthorized") {
        return Err(AdbError::Unauthorized(id));
    }
    Ok(())
}

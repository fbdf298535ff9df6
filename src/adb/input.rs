//! Text input over the ADB Keyboard IME.
//!
//! Programmatic text entry requires the ADB Keyboard app on the device
//! (https://github.com/senzhk/ADBKeyBoard): a text broadcast is only consumed
//! when that IME is active. The flow is set IME, broadcast the text base64
//! encoded to survive shell quoting, then restore whatever IME was active.

use base64::{engine::general_purpose::STANDARD, Engine};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::exec::{AdbError, AdbRunner, INPUT_TIMEOUT};

const ADB_IME: &str = "com.android.adbkeyboard/.AdbIME";

/// Whether the ADB Keyboard IME is installed on the device.
pub async fn ime_available(
    runner: &AdbRunner,
    device_id: Option<&str>,
    cancel: &CancellationToken,
) -> Result<bool, AdbError> {
    let out = runner
        .run(
            device_id,
            &["shell", "ime", "list", "-s", "-a"],
            "ime-list",
            INPUT_TIMEOUT,
            cancel,
        )
        .await?;
    Ok(out.stdout_text().contains("com.android.adbkeyboard"))
}

/// Read the currently active IME identifier.
pub async fn current_ime(
    runner: &AdbRunner,
    device_id: Option<&str>,
    cancel: &CancellationToken,
) -> Result<String, AdbError> {
    let out = runner
        .run(
            device_id,
            &["shell", "settings", "get", "secure", "default_input_method"],
            "ime-get",
            INPUT_TIMEOUT,
            cancel,
        )
        .await?;
    Ok(out.stdout_text().trim().to_string())
}

async fn set_ime(
    runner: &AdbRunner,
    device_id: Option<&str>,
    ime: &str,
    cancel: &CancellationToken,
) -> Result<(), AdbError> {
    runner
        .run_checked(
            device_id,
            &["shell", "ime", "set", ime],
            "ime-set",
            INPUT_TIMEOUT,
            cancel,
        )
        .await?;
    Ok(())
}

/// Clear the focused input field through the ADB Keyboard.
pub async fn clear_text(
    runner: &AdbRunner,
    device_id: Option<&str>,
    cancel: &CancellationToken,
) -> Result<(), AdbError> {
    runner
        .run_checked(
            device_id,
            &["shell", "am", "broadcast", "-a", "ADB_CLEAR_TEXT"],
            "clear-text",
            INPUT_TIMEOUT,
            cancel,
        )
        .await?;
    Ok(())
}

/// Type text into the focused input field.
///
/// Switches to the ADB Keyboard, clears the field, broadcasts the text, and
/// restores the previously active IME. Fails with
/// [`AdbError::InputMethodUnavailable`] when the ADB Keyboard is not
/// installed on the device.
pub async fn type_text(
    runner: &AdbRunner,
    device_id: Option<&str>,
    text: &str,
    cancel: &CancellationToken,
) -> Result<(), AdbError> {
    if !ime_available(runner, device_id, cancel).await? {
        return Err(AdbError::InputMethodUnavailable);
    }

    let original = current_ime(runner, device_id, cancel).await.unwrap_or_default();
    if !original.contains("com.android.adbkeyboard") {
        set_ime(runner, device_id, ADB_IME, cancel).await?;
        // the keyboard needs a beat to attach to the focused field
        settle(Duration::from_millis(500), cancel).await?;
    }

    clear_text(runner, device_id, cancel).await?;

    let encoded = STANDARD.encode(text.as_bytes());
    runner
        .run_checked(
            device_id,
            &[
                "shell",
                "am",
                "broadcast",
                "-a",
                "ADB_INPUT_B64",
                "--es",
                "msg",
                &encoded,
            ],
            "type-text",
            INPUT_TIMEOUT,
            cancel,
        )
        .await?;

    if !original.is_empty() && !original.contains("com.android.adbkeyboard") {
        set_ime(runner, device_id, &original, cancel).await?;
    }
    Ok(())
}

/// Cancellation-aware sleep used for UI settle windows.
pub async fn settle(duration: Duration, cancel: &CancellationToken) -> Result<(), AdbError> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(AdbError::Cancelled),
    }
}

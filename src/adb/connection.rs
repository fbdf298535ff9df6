//! Device discovery and wired/wireless connection management.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{get_messages, Language};

use super::exec::{AdbError, AdbRunner, INPUT_TIMEOUT};

const DEFAULT_TCP_PORT: u16 = 5555;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How a device is attached to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Usb,
    Tcp,
}

/// ADB-reported device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Device,
    Unauthorized,
    Offline,
    Unknown,
}

impl DeviceStatus {
    fn from_adb(word: &str) -> Self {
        match word {
            "device" => DeviceStatus::Device,
            "unauthorized" => DeviceStatus::Unauthorized,
            "offline" => DeviceStatus::Offline,
            _ => DeviceStatus::Unknown,
        }
    }
}

/// One row of `adb devices -l`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub connection_type: ConnectionType,
    pub status: DeviceStatus,
    pub model: Option<String>,
}

/// Lifecycle of one TCP address as tracked by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unknown,
    Connecting,
    Connected,
    Failed,
    Disconnected,
}

/// Manages connections to Android devices over USB and TCP/IP.
///
/// Methods return `(ok, message)` where the message is localized to the
/// configured language and suitable for direct display.
pub struct ConnectionManager {
    runner: AdbRunner,
    lang: Language,
    states: Mutex<HashMap<String, ConnectionState>>,
}

impl ConnectionManager {
    pub fn new(lang: Language) -> Self {
        Self::with_runner(AdbRunner::new(), lang)
    }

    pub fn with_runner(runner: AdbRunner, lang: Language) -> Self {
        Self {
            runner,
            lang,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Tracked state for a TCP address.
    pub fn state(&self, address: &str) -> ConnectionState {
        self.states
            .lock()
            .get(address)
            .copied()
            .unwrap_or(ConnectionState::Unknown)
    }

    fn set_state(&self, address: &str, state: ConnectionState) {
        self.states.lock().insert(address.to_string(), state);
    }

    /// Connect to a device over TCP/IP. A bare host gets the default port
    /// appended.
    pub async fn connect(&self, address: &str, cancel: &CancellationToken) -> (bool, String) {
        let address = normalize_address(address);
        let msgs = get_messages(self.lang);
        self.set_state(&address, ConnectionState::Connecting);

        let result = self
            .runner
            .run(None, &["connect", &address], "connect", CONNECT_TIMEOUT, cancel)
            .await;

        match result {
            Ok(out) => {
                let combined = format!("{}{}", out.stdout_text(), out.stderr).to_lowercase();
                if combined.contains("connected") && !combined.contains("cannot") {
                    self.set_state(&address, ConnectionState::Connected);
                    (true, format!("{}: {}", msgs.connection_successful, address))
                } else {
                    self.set_state(&address, ConnectionState::Failed);
                    (
                        false,
                        format!("{}: {}", msgs.connection_failed, combined.trim()),
                    )
                }
            }
            Err(e) => {
                self.set_state(&address, ConnectionState::Failed);
                (false, format!("{}: {}", msgs.connection_failed, e))
            }
        }
    }

    /// Disconnect one address, or all TCP connections when `address` is None.
    pub async fn disconnect(
        &self,
        address: Option<&str>,
        cancel: &CancellationToken,
    ) -> (bool, String) {
        let msgs = get_messages(self.lang);
        let normalized = address.map(normalize_address);
        let mut args = vec!["disconnect"];
        if let Some(ref addr) = normalized {
            args.push(addr);
        }

        match self
            .runner
            .run(None, &args, "disconnect", CONNECT_TIMEOUT, cancel)
            .await
        {
            Ok(_) => {
                let mut states = self.states.lock();
                match normalized {
                    Some(addr) => {
                        states.insert(addr, ConnectionState::Disconnected);
                    }
                    None => {
                        for state in states.values_mut() {
                            *state = ConnectionState::Disconnected;
                        }
                    }
                }
                (true, msgs.disconnected.to_string())
            }
            Err(e) => (false, format!("{}: {}", msgs.connection_failed, e)),
        }
    }

    /// List attached devices. Also reconciles tracked TCP addresses: an
    /// address marked Connected that no longer shows up has lost its link.
    pub async fn list_devices(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeviceInfo>, AdbError> {
        let out = self
            .runner
            .run_checked(None, &["devices", "-l"], "devices", INPUT_TIMEOUT, cancel)
            .await?;
        let devices = parse_devices_output(&out.stdout_text());

        let mut states = self.states.lock();
        for (address, state) in states.iter_mut() {
            if *state == ConnectionState::Connected
                && !devices.iter().any(|d| &d.device_id == address)
            {
                *state = ConnectionState::Disconnected;
            }
        }

        Ok(devices)
    }

    /// Switch a USB-attached device to TCP/IP listening mode.
    ///
    /// Only flips the device's adbd into TCP mode; a follow-up
    /// [`connect`](Self::connect) against `<ip>:<port>` establishes the
    /// wireless link.
    pub async fn enable_tcpip(
        &self,
        port: u16,
        device_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> (bool, String) {
        let msgs = get_messages(self.lang);

        let usb_present = match self.list_devices(cancel).await {
            Ok(devices) => devices.iter().any(|d| {
                d.connection_type == ConnectionType::Usb
                    && d.status == DeviceStatus::Device
                    && device_id.map_or(true, |id| d.device_id == id)
            }),
            Err(e) => return (false, format!("{}: {}", msgs.connection_failed, e)),
        };
        if !usb_present {
            return (false, msgs.tcpip_requires_usb.to_string());
        }

        let port_str = port.to_string();
        match self
            .runner
            .run_checked(device_id, &["tcpip", &port_str], "tcpip", CONNECT_TIMEOUT, cancel)
            .await
        {
            Ok(_) => (true, format!("{}: tcpip {}", msgs.connection_successful, port)),
            Err(e) => (false, format!("{}: {}", msgs.connection_failed, e)),
        }
    }

    /// Read the device's WLAN IP, for building a `connect` address after
    /// [`enable_tcpip`](Self::enable_tcpip).
    pub async fn get_device_ip(
        &self,
        device_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, AdbError> {
        let out = self
            .runner
            .run(
                device_id,
                &["shell", "ip", "route"],
                "ip-route",
                INPUT_TIMEOUT,
                cancel,
            )
            .await?;
        Ok(parse_wlan_ip(&out.stdout_text()))
    }
}

/// Append the default ADB TCP port when the address has none.
fn normalize_address(address: &str) -> String {
    if address.contains(':') {
        address.to_string()
    } else {
        format!("{}:{}", address, DEFAULT_TCP_PORT)
    }
}

/// Parse `adb devices -l` output into device rows.
pub(crate) fn parse_devices_output(stdout: &str) -> Vec<DeviceInfo> {
    let mut devices = Vec::new();
    for line in stdout.lines().skip(1) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('*') {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }
        let device_id = parts[0].to_string();
        let status = DeviceStatus::from_adb(parts[1]);
        let connection_type = if device_id.contains(':') {
            ConnectionType::Tcp
        } else {
            ConnectionType::Usb
        };
        let model = parts
            .iter()
            .find(|p| p.starts_with("model:"))
            .map(|m| m.trim_start_matches("model:").to_string());

        devices.push(DeviceInfo {
            device_id,
            connection_type,
            status,
            model,
        });
    }
    devices
}

/// Pull the `src <ip>` field out of `ip route` output.
fn parse_wlan_ip(output: &str) -> Option<String> {
    for line in output.lines() {
        if !line.contains("wlan") {
            continue;
        }
        let mut tokens = line.split_whitespace().peekable();
        while let Some(tok) = tokens.next() {
            if tok == "src" {
                if let Some(ip) = tokens.peek() {
                    return Some((*ip).to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices_output() {
        let stdout = "List of devices attached\n\
                      emulator-5554\tdevice product:sdk model:sdk_gphone64 device:emu64\n\
                      192.168.1.20:5555\tdevice model:Pixel_7\n\
                      ABCDEF\tunauthorized\n\n";
        let devices = parse_devices_output(stdout);
        assert_eq!(devices.len(), 3);

        assert_eq!(devices[0].device_id, "emulator-5554");
        assert_eq!(devices[0].connection_type, ConnectionType::Usb);
        assert_eq!(devices[0].status, DeviceStatus::Device);
        assert_eq!(devices[0].model.as_deref(), Some("sdk_gphone64"));

        assert_eq!(devices[1].connection_type, ConnectionType::Tcp);
        assert_eq!(devices[2].status, DeviceStatus::Unauthorized);
    }

    #[test]
    fn test_parse_devices_output_empty() {
        assert!(parse_devices_output("List of devices attached\n\n").is_empty());
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("192.168.1.20"), "192.168.1.20:5555");
        assert_eq!(normalize_address("192.168.1.20:4444"), "192.168.1.20:4444");
    }

    #[test]
    fn test_parse_wlan_ip() {
        let output = "192.168.1.0/24 dev wlan0 proto kernel scope link src 192.168.1.42\n\
                      10.0.0.0/8 dev rmnet0 scope link src 10.1.2.3";
        assert_eq!(parse_wlan_ip(output), Some("192.168.1.42".to_string()));
        assert_eq!(parse_wlan_ip("no routes"), None);
    }

    #[test]
    fn test_initial_state_unknown() {
        let manager = ConnectionManager::new(Language::En);
        assert_eq!(manager.state("192.168.1.20:5555"), ConnectionState::Unknown);
    }
}

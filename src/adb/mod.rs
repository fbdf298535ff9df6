//! ADB (Android Debug Bridge) layer: device I/O, screen capture, text input,
//! and connection management.

mod connection;
mod device;
mod exec;
pub mod input;
mod screenshot;

pub use connection::{
    ConnectionManager, ConnectionState, ConnectionType, DeviceInfo, DeviceStatus,
};
pub use device::{Adb, DeviceControl, KeyCode};
pub use exec::{AdbError, AdbOutput, AdbRunner};
pub use screenshot::{png_dimensions, Screenshot};

//! Model layer: OpenAI-compatible chat client and request telemetry.

mod client;
mod monitor;

pub use client::{
    extract_envelope, MessageBuilder, ModelApi, ModelClient, ModelConfig, ModelError, ModelReply,
    DEFAULT_RETRY_DELAYS,
};
pub use monitor::{MonitorSummary, RequestMonitor};

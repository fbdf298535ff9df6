// Copyright 2026 The droidpilot Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # droidpilot
//!
//! Drives an Android device through natural-language tasks: capture the live
//! screen over ADB, ask a vision-language model what to do next, execute the
//! returned action, repeat until the model finishes (or the step budget,
//! an error, or a cancellation ends the task).
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use droidpilot::actions::{AutoApprove, AutoCancelTakeover};
//! use droidpilot::adb::Adb;
//! use droidpilot::agent::AgentConfig;
//! use droidpilot::model::{ModelClient, ModelConfig};
//! use droidpilot::session::SessionManager;
//! use droidpilot::storage::{MemoryBlobStore, MemoryTaskStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = SessionManager::new(
//!         Arc::new(ModelClient::new(ModelConfig::default())),
//!         Arc::new(Adb::new()),
//!         MemoryTaskStore::shared(),
//!         MemoryBlobStore::shared(),
//!         Arc::new(AutoApprove),
//!         Arc::new(AutoCancelTakeover),
//!         AgentConfig::default(),
//!     );
//!
//!     let session = manager.create_session(None);
//!     let mut events = manager.subscribe(session)?;
//!     manager.start(session, "打开微信", None).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{}", serde_json::to_string(&event)?);
//!         if event.is_terminal() {
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod adb;
pub mod agent;
pub mod config;
pub mod model;
pub mod session;
pub mod storage;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testutil;

pub use actions::{Action, ActionDispatcher, Outcome, RelPoint};
pub use adb::{Adb, AdbError, ConnectionManager, DeviceControl, DeviceInfo, Screenshot};
pub use agent::{Agent, AgentConfig, RunOutcome};
pub use config::Language;
pub use model::{ModelClient, ModelConfig, ModelReply};
pub use session::{SessionManager, TaskEvent};
pub use storage::{BlobStore, Task, TaskStatus, TaskStore};
pub use tracker::{ScriptFile, ScriptRecorder, StepRecord, StepTracker};

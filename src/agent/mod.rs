//! The per-task agent control loop.

mod runner;

pub use runner::{Agent, AgentConfig, RunOutcome};

//! netmeter -- unattended network-quality measurement agent.
//!
//! Schedules bandwidth probes, runs them one at a time against remote
//! measurement servers and keeps the results as per-test reports.

pub mod config;
pub mod context;
pub mod executor;
pub mod network;
pub mod probes;
pub mod report;
pub mod scheduler;

pub use config::AgentConfig;
pub use context::AgentContext;
pub use scheduler::engine::{run, RunMode};

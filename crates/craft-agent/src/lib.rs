//! Orchestration core for self-hosted Minecraft servers: instance registry,
//! process lifecycle, console streaming, telemetry, scheduled tasks and
//! backups.

pub mod backup;
pub mod config;
pub mod console;
pub mod controller;
pub mod error;
pub mod launch;
pub mod orchestrator;
pub mod registry;
pub mod resource;
pub mod scheduler;
pub mod server_config;
pub mod telemetry;

pub use config::AgentConfig;
pub use error::{Error, Result};
pub use orchestrator::{InstanceOrchestrator, InstanceRef, InstanceStack};

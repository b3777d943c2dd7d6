//! devrack: runs and watches the dev servers of local projects.
//!
//! A [`Supervisor`] owns one process group per project. Each group is laid out by a
//! [`DeployStrategy`] (one aggregating process, or several side by side with their own
//! ports), started with readiness polling, health-checked while it runs and torn down
//! gracefully. Spawned PIDs are persisted by a [`ProcessRegistry`] so processes
//! orphaned by a crash of the host can be reclaimed on the next start.

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod output;
pub mod ports;
pub mod process;
pub mod registry;
pub mod signal;
pub mod strategy;
pub mod supervisor;

pub use config::{Config, OrchestratorSettings};
pub use error::{OrchestratorError, OrchestratorResult};
pub use events::{CrashReport, Event};
pub use output::{OutputLine, StreamKind};
pub use ports::{PortAllocation, PortAllocator};
pub use process::{HealthCheckStatus, ProcessState};
pub use registry::{CleanupReport, ProcessRegistry};
pub use strategy::{DeployStrategy, ServiceCatalog};
pub use supervisor::Supervisor;

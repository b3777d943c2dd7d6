//! Event definitions for orchestrator subscribers.
//!
//! Every lifecycle notification is one variant of `Event`, tagged with the project
//! it belongs to and published on a single broadcast channel.

use serde::Serialize;

use crate::output::OutputLine;
use crate::process::{HealthCheckStatus, ProcessState};

/// Payload of a crash notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashReport {
    /// Role of the process that crashed.
    pub process_id: String,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub crash_count: u32,
}

/// Represents a notification published by the supervisor.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    /// The aggregated state of a project's group changed.
    #[serde(rename_all = "camelCase")]
    ProcessStatusChanged {
        project_id: String,
        state: ProcessState,
    },
    /// A line of output was captured.
    #[serde(rename_all = "camelCase")]
    ProcessOutput {
        project_id: String,
        role: String,
        line: OutputLine,
    },
    /// A child process was spawned.
    #[serde(rename_all = "camelCase")]
    ProcessSpawned {
        project_id: String,
        role: String,
        pid: u32,
    },
    /// Every required endpoint responded; the preview can load `port`.
    #[serde(rename_all = "camelCase")]
    ProcessReady { project_id: String, port: u16 },
    /// A failure worth surfacing prominently.
    #[serde(rename_all = "camelCase")]
    ProcessError {
        project_id: String,
        role: Option<String>,
        message: String,
    },
    /// A process exited while it was meant to be running.
    #[serde(rename_all = "camelCase")]
    ProcessCrashed {
        project_id: String,
        crash: CrashReport,
    },
    /// Result of a health-check round, pass or fail.
    #[serde(rename_all = "camelCase")]
    ProcessHealthChanged {
        project_id: String,
        status: HealthCheckStatus,
    },
    /// A process crossed the failure threshold and is now unhealthy.
    #[serde(rename_all = "camelCase")]
    ProcessHealthCritical {
        project_id: String,
        status: HealthCheckStatus,
    },
}

impl Event {
    pub fn project_id(&self) -> &str {
        match self {
            Event::ProcessStatusChanged { project_id, .. }
            | Event::ProcessOutput { project_id, .. }
            | Event::ProcessSpawned { project_id, .. }
            | Event::ProcessReady { project_id, .. }
            | Event::ProcessError { project_id, .. }
            | Event::ProcessCrashed { project_id, .. }
            | Event::ProcessHealthChanged { project_id, .. }
            | Event::ProcessHealthCritical { project_id, .. } => project_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_event_tag() {
        let event = Event::ProcessCrashed {
            project_id: "p1".into(),
            crash: CrashReport {
                process_id: "aggregator".into(),
                code: Some(1),
                signal: None,
                crash_count: 2,
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "process-crashed");
        assert_eq!(value["projectId"], "p1");
        assert_eq!(value["crash"]["crashCount"], 2);
        assert_eq!(event.project_id(), "p1");
    }

    #[test]
    fn state_serializes_lowercase() {
        let event = Event::ProcessStatusChanged {
            project_id: "p1".into(),
            state: ProcessState::Running,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["state"], "running");
    }
}

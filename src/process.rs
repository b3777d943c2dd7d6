//! Data structures for tracking process state.
//!
//! This module defines the specification for a process (`ProcessSpec`), its lifecycle
//! state (`ProcessState`), the runtime record kept per spawned process (`ProcessInfo`),
//! crash accounting and health-check bookkeeping.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::output::LogBuffer;

/// Specification for a process to be run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Role name ("aggregator", "frontend", "backend", ...).
    pub id: String,
    /// The command executable.
    pub cmd: String,
    /// Arguments for the command.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Environment entries merged over the inherited environment.
    pub env: HashMap<String, String>,
    /// Port the process is expected to bind.
    pub port: u16,
    /// Prefix for captured output lines.
    pub label: Option<String>,
}

impl ProcessSpec {
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(1 + self.args.len());
        parts.push(self.cmd.clone());
        parts.extend(self.args.clone());
        shell_words::join(parts)
    }
}

/// The lifecycle state of a process or of a whole group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
    Error,
}

impl ProcessState {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Crashed => "crashed",
            ProcessState::Error => "error",
        }
    }
}

/// Combines member states into the group state.
///
/// Error dominates crashed, which dominates everything else. The group is running
/// only when every member is running and stopped only when every member is stopped.
pub fn aggregate_state<I>(states: I) -> ProcessState
where
    I: IntoIterator<Item = ProcessState>,
{
    let states: Vec<ProcessState> = states.into_iter().collect();
    if states.is_empty() {
        return ProcessState::Stopped;
    }
    if states.contains(&ProcessState::Error) {
        return ProcessState::Error;
    }
    if states.contains(&ProcessState::Crashed) {
        return ProcessState::Crashed;
    }
    if states.iter().all(|s| *s == ProcessState::Running) {
        return ProcessState::Running;
    }
    if states.iter().all(|s| *s == ProcessState::Stopped) {
        return ProcessState::Stopped;
    }
    if states.contains(&ProcessState::Stopping) {
        return ProcessState::Stopping;
    }
    ProcessState::Starting
}

/// How a process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: &std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(0), _) => "process ended successfully".to_string(),
            (Some(code), _) => format!("process ended with code {}", code),
            (None, Some(signal)) => format!("process ended by signal {}", signal),
            (None, None) => "process ended".to_string(),
        }
    }
}

/// Channels connecting the supervisor to the task that owns a child process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: u32,
    /// Asks the owning task to force-kill the child.
    pub kill_tx: mpsc::Sender<()>,
    /// Becomes `Some` once the child has been reaped.
    pub exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessHandle {
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }
}

/// Rolling crash counter for one process role.
#[derive(Debug, Clone, Default)]
pub struct CrashTracker {
    pub count: u32,
    pub last_crash: Option<Instant>,
}

impl CrashTracker {
    /// Records a crash at `now` and returns the updated count.
    ///
    /// A crash within `window` of the previous one increments the count, otherwise it restarts at 1.
    pub fn record(&mut self, now: Instant, window: Duration) -> u32 {
        let recent = self
            .last_crash
            .map(|last| now.saturating_duration_since(last) <= window)
            .unwrap_or(false);
        self.count = if recent { self.count + 1 } else { 1 };
        self.last_crash = Some(now);
        self.count
    }
}

/// Outcome of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckResult {
    Pass,
    Fail,
    Pending,
}

impl From<bool> for CheckResult {
    fn from(passed: bool) -> Self {
        if passed {
            CheckResult::Pass
        } else {
            CheckResult::Fail
        }
    }
}

/// Health of one process as seen by the periodic checker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckStatus {
    pub role: String,
    pub process_alive: CheckResult,
    pub http_responding: CheckResult,
    pub port_allocated: CheckResult,
    pub consecutive_failures: u32,
    pub healthy: bool,
    pub last_checked: Option<DateTime<Utc>>,
}

impl HealthCheckStatus {
    pub fn pending(role: &str) -> Self {
        Self {
            role: role.to_string(),
            process_alive: CheckResult::Pending,
            http_responding: CheckResult::Pending,
            port_allocated: CheckResult::Pending,
            consecutive_failures: 0,
            healthy: true,
            last_checked: None,
        }
    }

    /// Applies one round of checks.
    ///
    /// Returns `true` only on the round where the process crosses `threshold` and turns unhealthy.
    pub fn record(&mut self, alive: bool, http: bool, port: bool, threshold: u32) -> bool {
        self.process_alive = alive.into();
        self.http_responding = http.into();
        self.port_allocated = port.into();
        self.last_checked = Some(Utc::now());
        if alive && http && port {
            self.consecutive_failures = 0;
            self.healthy = true;
            return false;
        }
        self.consecutive_failures += 1;
        if self.healthy && self.consecutive_failures >= threshold {
            self.healthy = false;
            return true;
        }
        false
    }
}

/// Runtime state of a single spawned process.
#[derive(Debug)]
pub struct ProcessInfo {
    pub spec: ProcessSpec,
    pub state: ProcessState,
    /// Present once the process was spawned.
    pub handle: Option<ProcessHandle>,
    pub logs: LogBuffer,
    pub health: Option<HealthCheckStatus>,
}

impl ProcessInfo {
    /// Creates a new `ProcessInfo` from a specification.
    pub fn new(spec: ProcessSpec, max_lines: usize) -> Self {
        Self {
            spec,
            state: ProcessState::Starting,
            handle: None,
            logs: LogBuffer::new(max_lines),
            health: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(|h| h.pid)
    }
}

//! Durable record of spawned processes.
//!
//! The registry is a single JSON object on disk, read and rewritten on every call
//! with no in-memory cache, so the startup cleanup can use it before any
//! supervisor exists. Every entry names the host process that spawned it, so one
//! host never reclaims the live processes of another.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::signal::{is_process_alive, terminate_pid, TerminateOutcome};

/// One persisted process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedProcessEntry {
    pub key: String,
    pub pid: u32,
    pub port: u16,
    pub timestamp: DateTime<Utc>,
    /// PID of the devrack host that spawned the process; 0 when unknown.
    #[serde(default)]
    pub owner: u32,
}

/// Result of cleaning up one persisted entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupEntry {
    pub key: String,
    pub pid: u32,
    pub port: u16,
    pub outcome: TerminateOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub entries: Vec<CleanupEntry>,
    /// Entries left alone because the host that owns them is still running.
    pub kept: Vec<String>,
}

impl CleanupReport {
    /// Entries whose process was still running and had to be stopped.
    pub fn reclaimed(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.outcome != TerminateOutcome::AlreadyExited)
            .count()
    }
}

/// Registry key for one process of a project.
pub fn registry_key(project_id: &str, role: &str) -> String {
    format!("{}:{}", project_id, role)
}

/// Clones share one lock, so read-modify-write cycles never interleave.
#[derive(Debug, Clone)]
pub struct ProcessRegistry {
    path: PathBuf,
    owner: u32,
    lock: Arc<Mutex<()>>,
}

impl ProcessRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_owner(path, std::process::id())
    }

    /// A registry that records `owner` as the spawning host.
    pub fn with_owner(path: impl Into<PathBuf>, owner: u32) -> Self {
        Self {
            path: path.into(),
            owner,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save_pid(&self, key: &str, pid: u32, port: u16) -> OrchestratorResult<()> {
        let _guard = self.guard();
        let mut entries = self.read()?;
        entries.insert(
            key.to_string(),
            PersistedProcessEntry {
                key: key.to_string(),
                pid,
                port,
                timestamp: Utc::now(),
                owner: self.owner,
            },
        );
        self.write(&entries)
    }

    /// Removes `key`. Missing keys are a no-op.
    pub fn remove_pid(&self, key: &str) -> OrchestratorResult<()> {
        let _guard = self.guard();
        let mut entries = self.read()?;
        if entries.remove(key).is_some() {
            self.write(&entries)?;
        }
        Ok(())
    }

    /// Removes `key` only while it still records `pid`. Returns whether it did.
    pub fn remove_pid_if(&self, key: &str, pid: u32) -> OrchestratorResult<bool> {
        let _guard = self.guard();
        let mut entries = self.read()?;
        match entries.get(key) {
            Some(entry) if entry.pid == pid => {
                entries.remove(key);
                self.write(&entries)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn get_all_persisted_processes(&self) -> OrchestratorResult<Vec<PersistedProcessEntry>> {
        let _guard = self.guard();
        Ok(self.read()?.into_values().collect())
    }

    pub fn get_persisted_process(
        &self,
        key: &str,
    ) -> OrchestratorResult<Option<PersistedProcessEntry>> {
        let _guard = self.guard();
        Ok(self.read()?.remove(key))
    }

    pub fn clear(&self) -> OrchestratorResult<()> {
        let _guard = self.guard();
        self.write(&BTreeMap::new())
    }

    /// Stops every still-running process left over from a previous session, then drops
    /// those entries regardless of the individual outcomes.
    ///
    /// Entries owned by another devrack host that is still alive are kept untouched.
    pub async fn cleanup_stale_processes(&self, grace: Duration) -> OrchestratorResult<CleanupReport> {
        let entries = {
            let _guard = self.guard();
            match self.read() {
                Ok(entries) => entries,
                Err(OrchestratorError::Json(err)) => {
                    warn!(path = %self.path.display(), error = %err, "discarding unreadable process registry");
                    self.write(&BTreeMap::new())?;
                    BTreeMap::new()
                }
                Err(err) => return Err(err),
            }
        };

        let mut report = CleanupReport::default();
        for entry in entries.into_values() {
            if self.owned_by_live_host(&entry) {
                debug!(key = %entry.key, owner = entry.owner, "entry belongs to a running host, keeping");
                report.kept.push(entry.key);
                continue;
            }
            let outcome = terminate_pid(entry.pid, grace).await;
            match outcome {
                TerminateOutcome::AlreadyExited => {
                    info!(key = %entry.key, pid = entry.pid, "stale entry, process already gone");
                }
                TerminateOutcome::Terminated | TerminateOutcome::Killed => {
                    warn!(key = %entry.key, pid = entry.pid, port = entry.port, ?outcome, "stopped orphaned process");
                }
            }
            report.entries.push(CleanupEntry {
                key: entry.key,
                pid: entry.pid,
                port: entry.port,
                outcome,
            });
        }

        let _guard = self.guard();
        let mut remaining = self.read().unwrap_or_default();
        for entry in &report.entries {
            if remaining.get(&entry.key).is_some_and(|e| e.pid == entry.pid) {
                remaining.remove(&entry.key);
            }
        }
        self.write(&remaining)?;
        Ok(report)
    }

    fn owned_by_live_host(&self, entry: &PersistedProcessEntry) -> bool {
        entry.owner != 0 && entry.owner != self.owner && is_process_alive(entry.owner)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> OrchestratorResult<BTreeMap<String, PersistedProcessEntry>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(OrchestratorError::io(&self.path, err)),
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    /// Writes a sibling temp file and renames it over the registry.
    fn write(&self, entries: &BTreeMap<String, PersistedProcessEntry>) -> OrchestratorResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| OrchestratorError::io(parent, err))?;
            }
        }
        let serialized = serde_json::to_string_pretty(entries)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(format!(".{}.tmp", std::process::id()));
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, serialized).map_err(|err| OrchestratorError::io(&tmp, err))?;
        std::fs::rename(&tmp, &self.path).map_err(|err| OrchestratorError::io(&self.path, err))
    }
}

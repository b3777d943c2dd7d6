//! Error types for the orchestrator.
//!
//! `OrchestratorError` is `Clone` so a single in-flight start can hand the same
//! result to every caller waiting on it.

use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    #[error("no port available for {project_id} in {start}..={end}")]
    NoPortAvailable {
        project_id: String,
        start: u16,
        end: u16,
    },

    #[error("unknown service: {name}")]
    UnknownService { name: String },

    #[error("invalid command for {role}: {reason}")]
    InvalidCommand { role: String, reason: String },

    #[error("failed to spawn {role} ({cmd}): {source}")]
    Spawn {
        role: String,
        cmd: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("no preview port was allocated for {project_id}")]
    NoPreviewPort { project_id: String },

    #[error("project {project_id} is currently active; use force to stop it")]
    ProjectInFocus { project_id: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("registry file is malformed: {0}")]
    Json(#[source] Arc<serde_json::Error>),
}

impl OrchestratorError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source: Arc::new(source),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

//! Configuration management for devrack.
//!
//! This module defines the structure of the `devrack.toml` configuration file,
//! loads it, and resolves it into `OrchestratorSettings` with defaults applied.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_MAX_OUTPUT_LINES: usize = 500;
const DEFAULT_PORT_SEARCH_SPAN: u16 = 100;
const DEFAULT_READINESS_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_READINESS_POLL_MS: u64 = 500;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_HEALTH_INTERVAL_MS: u64 = 10_000;
const DEFAULT_HEALTH_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_CRASH_WINDOW_SECS: u64 = 300;
const DEFAULT_MAX_CRASHES: u32 = 3;
const DEFAULT_STOP_GRACE_MS: u64 = 5_000;
const DEFAULT_RESTART_SETTLE_MS: u64 = 1_000;
const REGISTRY_FILE: &str = "processes.json";

/// Top-level configuration structure corresponding to `devrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Lines kept per process and per group aggregate.
    pub max_output_lines: Option<usize>,
    /// How far above the preferred port the allocator searches.
    pub port_search_span: Option<u16>,
    pub readiness_timeout_ms: Option<u64>,
    pub readiness_poll_ms: Option<u64>,
    /// Timeout for a single HTTP probe.
    pub probe_timeout_ms: Option<u64>,
    pub health_interval_ms: Option<u64>,
    /// Consecutive failed health checks before a process is flagged unhealthy.
    pub health_failure_threshold: Option<u32>,
    /// Crashes further apart than this reset the crash count.
    pub crash_window_secs: Option<u64>,
    pub max_crashes: Option<u32>,
    /// Time between the graceful signal and the forced kill.
    pub stop_grace_ms: Option<u64>,
    pub restart_settle_ms: Option<u64>,
    /// Location of the persisted process registry.
    pub registry_path: Option<PathBuf>,
    /// Optional dotenv-style file whose entries are injected into every process.
    pub secrets_file: Option<PathBuf>,
    /// Environment entries injected into every process.
    pub env: Option<HashMap<String, String>>,
    /// Service catalog additions and overrides.
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
}

/// Configuration for a single deployable service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name, also used as the process role.
    pub name: String,
    /// Command line, split with shell quoting rules.
    pub cmd: Option<String>,
    /// Working directory relative to the project root.
    pub cwd: Option<String>,
    /// Preferred port.
    pub port: Option<u16>,
    /// Path probed for readiness and health (default: "/").
    pub health_path: Option<String>,
    /// Whether the group waits for this service before reporting ready.
    pub required: Option<bool>,
    /// Whether this service is the one shown in the preview.
    pub preview: Option<bool>,
    /// Environment variable carrying the allocated port (default: "PORT").
    pub port_env: Option<String>,
    /// Env file rewritten with allocated ports (default: ".env.local").
    pub env_file: Option<String>,
    pub env: Option<HashMap<String, String>>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Runtime settings for the supervisor, resolved from `Config`.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_output_lines: usize,
    pub port_search_span: u16,
    pub readiness_timeout: Duration,
    pub readiness_poll: Duration,
    pub probe_timeout: Duration,
    pub health_interval: Duration,
    pub health_failure_threshold: u32,
    pub crash_window: Duration,
    pub max_crashes: u32,
    pub stop_grace: Duration,
    pub restart_settle: Duration,
    pub registry_path: PathBuf,
    /// Entries from `[env]` and the secrets file, merged in that order.
    pub env: HashMap<String, String>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut env = config.env.clone().unwrap_or_default();
        if let Some(path) = &config.secrets_file {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read secrets file {}", path.display()))?;
            env.extend(parse_env_lines(&raw));
        }
        let registry_path = match &config.registry_path {
            Some(path) => path.clone(),
            None => default_registry_path()
                .context("cannot determine a state directory for the process registry")?,
        };
        Ok(Self {
            max_output_lines: config
                .max_output_lines
                .unwrap_or(DEFAULT_MAX_OUTPUT_LINES)
                .max(1),
            port_search_span: config.port_search_span.unwrap_or(DEFAULT_PORT_SEARCH_SPAN),
            readiness_timeout: millis(config.readiness_timeout_ms, DEFAULT_READINESS_TIMEOUT_MS),
            readiness_poll: millis(config.readiness_poll_ms, DEFAULT_READINESS_POLL_MS),
            probe_timeout: millis(config.probe_timeout_ms, DEFAULT_PROBE_TIMEOUT_MS),
            health_interval: millis(config.health_interval_ms, DEFAULT_HEALTH_INTERVAL_MS),
            health_failure_threshold: config
                .health_failure_threshold
                .unwrap_or(DEFAULT_HEALTH_FAILURE_THRESHOLD)
                .max(1),
            crash_window: Duration::from_secs(
                config.crash_window_secs.unwrap_or(DEFAULT_CRASH_WINDOW_SECS),
            ),
            max_crashes: config.max_crashes.unwrap_or(DEFAULT_MAX_CRASHES).max(1),
            stop_grace: millis(config.stop_grace_ms, DEFAULT_STOP_GRACE_MS),
            restart_settle: millis(config.restart_settle_ms, DEFAULT_RESTART_SETTLE_MS),
            registry_path,
            env,
        })
    }
}

fn millis(value: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(value.unwrap_or(default))
}

/// Parses `KEY=VALUE` lines, skipping blanks and `#` comments.
///
/// A leading `export ` is tolerated and matching surrounding quotes are removed.
pub fn parse_env_lines(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn default_registry_path() -> Option<PathBuf> {
    state_dir().map(|dir| dir.join("devrack").join(REGISTRY_FILE))
}

fn state_dir() -> Option<PathBuf> {
    if let Ok(path) = env::var("XDG_STATE_HOME") {
        return Some(PathBuf::from(path));
    }
    if cfg!(windows) {
        return env::var("LOCALAPPDATA").ok().map(PathBuf::from);
    }
    env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".local").join("state"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
max_output_lines = 200
port_search_span = 20
readiness_timeout_ms = 15000
health_interval_ms = 5000
health_failure_threshold = 2
crash_window_secs = 60
max_crashes = 5
stop_grace_ms = 1500
registry_path = "/tmp/devrack/processes.json"

[env]
NODE_ENV = "development"

[[service]]
name = "aggregator"
cmd = "pnpm dev --host 0.0.0.0"
port = 9999

[[service]]
name = "worker"
cmd = "cargo run"
cwd = "worker"
required = false
port_env = "WORKER_PORT"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.max_output_lines, Some(200));
        assert_eq!(config.port_search_span, Some(20));
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].port, Some(9999));
        assert_eq!(config.services[1].required, Some(false));
        assert_eq!(config.services[1].port_env.as_deref(), Some("WORKER_PORT"));

        let settings = OrchestratorSettings::from_config(&config).unwrap();
        assert_eq!(settings.max_output_lines, 200);
        assert_eq!(settings.readiness_timeout, Duration::from_secs(15));
        assert_eq!(settings.readiness_poll, Duration::from_millis(500));
        assert_eq!(settings.crash_window, Duration::from_secs(60));
        assert_eq!(settings.max_crashes, 5);
        assert_eq!(
            settings.registry_path,
            PathBuf::from("/tmp/devrack/processes.json")
        );
        assert_eq!(settings.env.get("NODE_ENV").map(String::as_str), Some("development"));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("registry_path = \"r.json\"").unwrap();
        let settings = OrchestratorSettings::from_config(&config).unwrap();
        assert_eq!(settings.max_output_lines, 500);
        assert_eq!(settings.health_failure_threshold, 3);
        assert_eq!(settings.crash_window, Duration::from_secs(300));
        assert_eq!(settings.stop_grace, Duration::from_secs(5));
        assert!(config.services.is_empty());
    }

    #[test]
    fn secrets_file_is_merged_over_env_table() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = dir.path().join("secrets.env");
        std::fs::write(&secrets, "# keys\nexport API_KEY=\"abc\"\nNODE_ENV=test\n").unwrap();
        let config = Config {
            registry_path: Some(dir.path().join("r.json")),
            secrets_file: Some(secrets),
            env: Some(HashMap::from([("NODE_ENV".to_string(), "development".to_string())])),
            ..Config::default()
        };
        let settings = OrchestratorSettings::from_config(&config).unwrap();
        assert_eq!(settings.env.get("API_KEY").map(String::as_str), Some("abc"));
        assert_eq!(settings.env.get("NODE_ENV").map(String::as_str), Some("test"));
    }

    #[test]
    fn parse_env_lines_skips_noise() {
        let parsed = parse_env_lines("\n# comment\nA=1\n=bad\nnovalue\nB='two words'\n");
        assert_eq!(
            parsed,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "two words".to_string())
            ]
        );
    }
}

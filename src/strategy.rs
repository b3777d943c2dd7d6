//! Deployment strategies.
//!
//! A `DeployStrategy` answers every "how many processes, which ports, which
//! endpoints" question for the supervisor. Strategies are resolved from a list of
//! requested service names against a `ServiceCatalog`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{parse_env_lines, ServiceConfig};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::ports::{PortAllocation, PortAllocator};
use crate::process::ProcessSpec;

pub const AGGREGATOR: &str = "aggregator";
pub const FRONTEND: &str = "frontend";
pub const BACKEND: &str = "backend";

const DEFAULT_PORT_ENV: &str = "PORT";
const DEFAULT_ENV_FILE: &str = ".env.local";
const DEFAULT_HEALTH_PATH: &str = "/";
const DEFAULT_SERVICE_PORT: u16 = 3000;

/// How to launch and probe one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTemplate {
    pub name: String,
    pub cmd: String,
    pub args: Vec<String>,
    /// Relative to the project root.
    pub cwd: Option<String>,
    pub port: u16,
    pub health_path: String,
    pub required: bool,
    pub preview: bool,
    pub port_env: String,
    pub env_file: String,
    pub env: HashMap<String, String>,
}

impl ServiceTemplate {
    fn npm_dev(name: &str, cwd: Option<&str>, port: u16, required: bool, preview: bool) -> Self {
        Self {
            name: name.to_string(),
            cmd: "npm".to_string(),
            args: vec!["run".to_string(), "dev".to_string()],
            cwd: cwd.map(str::to_string),
            port,
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            required,
            preview,
            port_env: DEFAULT_PORT_ENV.to_string(),
            env_file: DEFAULT_ENV_FILE.to_string(),
            env: HashMap::new(),
        }
    }

    fn working_dir(&self, project_path: &Path) -> PathBuf {
        match self.cwd.as_deref() {
            Some(cwd) if !cwd.is_empty() && cwd != "." => project_path.join(cwd),
            _ => project_path.to_path_buf(),
        }
    }

    fn apply(&mut self, config: &ServiceConfig) -> OrchestratorResult<()> {
        if let Some(cmd) = &config.cmd {
            let (program, args) = split_command(&config.name, cmd)?;
            self.cmd = program;
            self.args = args;
        }
        if let Some(cwd) = &config.cwd {
            self.cwd = Some(cwd.clone());
        }
        if let Some(port) = config.port {
            self.port = port;
        }
        if let Some(path) = &config.health_path {
            self.health_path = if path.starts_with('/') {
                path.clone()
            } else {
                format!("/{}", path)
            };
        }
        if let Some(required) = config.required {
            self.required = required;
        }
        if let Some(preview) = config.preview {
            self.preview = preview;
        }
        if let Some(port_env) = &config.port_env {
            self.port_env = port_env.clone();
        }
        if let Some(env_file) = &config.env_file {
            self.env_file = env_file.clone();
        }
        if let Some(env) = &config.env {
            self.env.extend(env.clone());
        }
        Ok(())
    }
}

fn split_command(name: &str, cmd: &str) -> OrchestratorResult<(String, Vec<String>)> {
    let mut parts = shell_words::split(cmd).map_err(|err| OrchestratorError::InvalidCommand {
        role: name.to_string(),
        reason: err.to_string(),
    })?;
    if parts.is_empty() {
        return Err(OrchestratorError::InvalidCommand {
            role: name.to_string(),
            reason: "empty command".to_string(),
        });
    }
    let program = parts.remove(0);
    Ok((program, parts))
}

/// The services devrack knows how to launch.
#[derive(Debug, Clone)]
pub struct ServiceCatalog {
    services: BTreeMap<String, ServiceTemplate>,
}

impl Default for ServiceCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ServiceCatalog {
    /// `aggregator` fronts everything on its own; `frontend`/`backend` run side by side.
    pub fn builtin() -> Self {
        let services = [
            ServiceTemplate::npm_dev(AGGREGATOR, None, 8888, true, true),
            ServiceTemplate::npm_dev(FRONTEND, Some(FRONTEND), 3000, true, true),
            ServiceTemplate::npm_dev(BACKEND, Some(BACKEND), 4000, false, false),
        ]
        .into_iter()
        .map(|template| (template.name.clone(), template))
        .collect();
        Self { services }
    }

    /// Builds the catalog from the built-ins plus `[[service]]` entries.
    ///
    /// Entries named like a built-in override only the fields they set; new names require `cmd`.
    pub fn from_config(configs: &[ServiceConfig]) -> OrchestratorResult<Self> {
        let mut catalog = Self::builtin();
        for config in configs {
            match catalog.services.get_mut(&config.name) {
                Some(template) => template.apply(config)?,
                None => {
                    let cmd = config.cmd.as_deref().ok_or_else(|| {
                        OrchestratorError::InvalidCommand {
                            role: config.name.clone(),
                            reason: "missing cmd".to_string(),
                        }
                    })?;
                    let (program, args) = split_command(&config.name, cmd)?;
                    let mut template = ServiceTemplate {
                        name: config.name.clone(),
                        cmd: program,
                        args,
                        cwd: None,
                        port: DEFAULT_SERVICE_PORT,
                        health_path: DEFAULT_HEALTH_PATH.to_string(),
                        required: true,
                        preview: false,
                        port_env: DEFAULT_PORT_ENV.to_string(),
                        env_file: DEFAULT_ENV_FILE.to_string(),
                        env: HashMap::new(),
                    };
                    template.apply(config)?;
                    catalog.services.insert(config.name.clone(), template);
                }
            }
        }
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Option<&ServiceTemplate> {
        self.services.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Picks the strategy for the requested services.
    ///
    /// No services means the aggregator; one service runs on its own; two or more run side by side.
    pub fn resolve(&self, requested: &[String]) -> OrchestratorResult<DeployStrategy> {
        let mut names: Vec<&str> = Vec::new();
        for name in requested {
            let name = name.trim();
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        if names.is_empty() {
            names.push(AGGREGATOR);
        }

        let mut templates = Vec::with_capacity(names.len());
        for name in names {
            let template = self
                .get(name)
                .ok_or_else(|| OrchestratorError::UnknownService {
                    name: name.to_string(),
                })?;
            templates.push(template.clone());
        }

        if templates.len() == 1 {
            return Ok(DeployStrategy::SingleProcess(templates.remove(0)));
        }
        let preview_role = templates
            .iter()
            .find(|t| t.preview)
            .unwrap_or(&templates[0])
            .name
            .clone();
        Ok(DeployStrategy::MultiProcess {
            services: templates,
            preview_role,
        })
    }
}

/// An HTTP endpoint probed for readiness and health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthEndpoint {
    pub url: String,
    pub label: String,
    pub required: bool,
    /// Role of the process serving this endpoint.
    pub role: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCheckConfig {
    pub endpoints: Vec<HealthEndpoint>,
}

impl HealthCheckConfig {
    pub fn required(&self) -> impl Iterator<Item = &HealthEndpoint> {
        self.endpoints.iter().filter(|e| e.required)
    }
}

/// How a project's dev environment is laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployStrategy {
    /// One process that fronts everything; its port is the preview port.
    SingleProcess(ServiceTemplate),
    /// Independent processes, each with its own port.
    MultiProcess {
        services: Vec<ServiceTemplate>,
        preview_role: String,
    },
}

impl DeployStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            DeployStrategy::SingleProcess(_) => "single-process",
            DeployStrategy::MultiProcess { .. } => "multi-process",
        }
    }

    pub fn services(&self) -> &[ServiceTemplate] {
        match self {
            DeployStrategy::SingleProcess(template) => std::slice::from_ref(template),
            DeployStrategy::MultiProcess { services, .. } => services,
        }
    }

    fn preview_role(&self) -> &str {
        match self {
            DeployStrategy::SingleProcess(template) => &template.name,
            DeployStrategy::MultiProcess { preview_role, .. } => preview_role,
        }
    }

    /// Reserves one port per service. Partial reservations are released on failure.
    pub fn allocate_ports(
        &self,
        ports: &mut PortAllocator,
        project_id: &str,
    ) -> OrchestratorResult<Vec<PortAllocation>> {
        let mut allocations = Vec::with_capacity(self.services().len());
        for template in self.services() {
            match ports.allocate(project_id, &template.name, template.port) {
                Ok(port) => allocations.push(PortAllocation {
                    role: template.name.clone(),
                    port,
                }),
                Err(err) => {
                    ports.release(project_id);
                    return Err(err);
                }
            }
        }
        Ok(allocations)
    }

    pub fn release_ports(&self, ports: &mut PortAllocator, project_id: &str) -> Vec<u16> {
        ports.release(project_id)
    }

    /// Writes the allocated ports into each service's env file.
    ///
    /// Keys already present are replaced in place and unrelated lines are kept.
    pub fn update_project_configs(
        &self,
        project_path: &Path,
        allocations: &[PortAllocation],
    ) -> OrchestratorResult<()> {
        for template in self.services() {
            let Some(port) = port_for(allocations, &template.name) else {
                continue;
            };
            let dir = template.working_dir(project_path);
            if !dir.is_dir() {
                warn!(path = %dir.display(), role = %template.name, "service directory missing, skipping env file");
                continue;
            }
            let mut entries = vec![(template.port_env.clone(), port.to_string())];
            entries.extend(port_env_entries(allocations));
            let path = dir.join(&template.env_file);
            write_env_file(&path, &entries)?;
            debug!(path = %path.display(), port, "env file updated");
        }
        Ok(())
    }

    /// Builds the process specs for the allocated ports.
    pub fn process_configs(
        &self,
        project_path: &Path,
        allocations: &[PortAllocation],
        base_env: &HashMap<String, String>,
    ) -> Vec<ProcessSpec> {
        let label_output = matches!(self, DeployStrategy::MultiProcess { .. });
        self.services()
            .iter()
            .filter_map(|template| {
                let port = port_for(allocations, &template.name)?;
                let mut env = base_env.clone();
                env.extend(template.env.clone());
                env.extend(port_env_entries(allocations));
                env.insert(template.port_env.clone(), port.to_string());
                Some(ProcessSpec {
                    id: template.name.clone(),
                    cmd: template.cmd.clone(),
                    args: template.args.clone(),
                    cwd: template.working_dir(project_path),
                    env,
                    port,
                    label: label_output.then(|| template.name.clone()),
                })
            })
            .collect()
    }

    pub fn health_check_config(&self, allocations: &[PortAllocation]) -> HealthCheckConfig {
        let endpoints = self
            .services()
            .iter()
            .filter_map(|template| {
                let port = port_for(allocations, &template.name)?;
                Some(HealthEndpoint {
                    url: format!("http://localhost:{}{}", port, template.health_path),
                    label: template.name.clone(),
                    required: template.required,
                    role: template.name.clone(),
                    port,
                })
            })
            .collect();
        HealthCheckConfig { endpoints }
    }

    pub fn preview_port(&self, allocations: &[PortAllocation]) -> Option<u16> {
        port_for(allocations, self.preview_role())
    }
}

fn port_for(allocations: &[PortAllocation], role: &str) -> Option<u16> {
    allocations.iter().find(|a| a.role == role).map(|a| a.port)
}

fn port_env_entries(allocations: &[PortAllocation]) -> Vec<(String, String)> {
    allocations
        .iter()
        .map(|a| (role_port_key(&a.role), a.port.to_string()))
        .collect()
}

/// `frontend` becomes `DEVRACK_FRONTEND_PORT`.
pub fn role_port_key(role: &str) -> String {
    let role: String = role
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("DEVRACK_{}_PORT", role)
}

fn write_env_file(path: &Path, entries: &[(String, String)]) -> OrchestratorResult<()> {
    let existing = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(OrchestratorError::io(path, err)),
    };

    let mut written: Vec<&str> = Vec::new();
    let mut lines: Vec<String> = Vec::new();
    for line in existing.lines() {
        let parsed = parse_env_lines(line);
        let replacement = parsed.first().and_then(|(key, _)| {
            entries
                .iter()
                .find(|(k, _)| k == key)
                .map(|(k, v)| (k.as_str(), v))
        });
        match replacement {
            Some((key, value)) if !written.contains(&key) => {
                lines.push(format!("{}={}", key, value));
                written.push(key);
            }
            Some(_) => {}
            None => lines.push(line.to_string()),
        }
    }
    for (key, value) in entries {
        if !written.contains(&key.as_str()) {
            lines.push(format!("{}={}", key, value));
            written.push(key);
        }
    }

    let mut contents = lines.join("\n");
    contents.push('\n');
    if contents != existing {
        std::fs::write(path, contents).map_err(|err| OrchestratorError::io(path, err))?;
    }
    Ok(())
}

//! Dev-server supervision.
//!
//! The `Supervisor` owns one process group per project. It allocates ports through
//! the project's deployment strategy, spawns and labels every child, captures their
//! output, waits for readiness, runs the periodic health check, tracks crashes and
//! tears groups down with a graceful-then-forced shutdown.
//!
//! A `Supervisor` is a cheap handle; clones share the same state. Construct one per
//! application and pass it to whatever needs it.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::OrchestratorSettings;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{CrashReport, Event};
use crate::health::{wait_until_responding, HttpProber, Readiness};
use crate::output::{
    classify_critical, sanitize_text, OutputLine, StreamKind, TimelineBuffer, TimelineEntry,
};
use crate::ports::{PortAllocation, PortAllocator};
use crate::process::{
    aggregate_state, CrashTracker, ExitInfo, HealthCheckStatus, ProcessHandle, ProcessInfo,
    ProcessSpec, ProcessState,
};
use crate::registry::{registry_key, ProcessRegistry};
use crate::signal::{self, ProcessSignal};
use crate::strategy::{DeployStrategy, HealthCheckConfig, ServiceCatalog};

const EVENT_CAPACITY: usize = 1024;
/// How long to wait for a child to be reaped after the forced kill.
const KILL_WAIT: Duration = Duration::from_secs(5);
/// Longer output lines are split into chunks of this size.
const MAX_LINE_BYTES: u64 = 16 * 1024;

type StartFuture = Shared<BoxFuture<'static, OrchestratorResult<u16>>>;

/// Supervises dev-server process groups, one per project.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    settings: OrchestratorSettings,
    catalog: ServiceCatalog,
    registry: ProcessRegistry,
    prober: HttpProber,
    events: broadcast::Sender<Event>,
    state: Mutex<SupervisorState>,
    /// Starts in flight, so concurrent callers share one.
    starts: Mutex<StartSlots>,
}

/// In-flight starts by project. The token tells a finished start whether its slot
/// was handed to a newer start in the meantime.
#[derive(Default)]
struct StartSlots {
    next_token: u64,
    in_flight: HashMap<String, (u64, StartFuture)>,
}

struct SupervisorState {
    groups: HashMap<String, ProcessGroup>,
    ports: PortAllocator,
    current_project: Option<String>,
    /// Keyed like the registry; survives restarts so crash loops are visible.
    crashes: HashMap<String, CrashTracker>,
    next_session: u64,
}

struct ProcessGroup {
    /// Distinguishes this group from earlier ones for the same project.
    session: u64,
    strategy: DeployStrategy,
    processes: BTreeMap<String, ProcessInfo>,
    allocations: Vec<PortAllocation>,
    health: HealthCheckConfig,
    preview_port: u16,
    state: ProcessState,
    output: TimelineBuffer,
    health_task: Option<JoinHandle<()>>,
    /// Held while a health round probes this group.
    health_round: Arc<Mutex<()>>,
}

impl ProcessGroup {
    /// Recomputes the aggregated state, returning it if it changed.
    fn refresh_state(&mut self) -> Option<ProcessState> {
        let next = aggregate_state(self.processes.values().map(|p| p.state));
        if next == self.state {
            return None;
        }
        self.state = next;
        if next != ProcessState::Running {
            if let Some(task) = self.health_task.take() {
                task.abort();
            }
        }
        Some(next)
    }

    fn push_output(&mut self, role: &str, line: OutputLine) {
        if let Some(process) = self.processes.get_mut(role) {
            process.logs.push(line.clone());
        }
        self.output.push(TimelineEntry {
            role: role.to_string(),
            line,
        });
    }

    fn label(&self, role: &str) -> Option<String> {
        self.processes.get(role).and_then(|p| p.spec.label.clone())
    }

    fn health_snapshot(&self) -> HashMap<String, HealthCheckStatus> {
        self.processes
            .iter()
            .filter_map(|(role, p)| p.health.clone().map(|h| (role.clone(), h)))
            .collect()
    }
}

impl Supervisor {
    pub fn new(
        settings: OrchestratorSettings,
        catalog: ServiceCatalog,
        registry: ProcessRegistry,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = SupervisorState {
            groups: HashMap::new(),
            ports: PortAllocator::new(settings.port_search_span),
            current_project: None,
            crashes: HashMap::new(),
            next_session: 0,
        };
        Self {
            inner: Arc::new(Inner {
                prober: HttpProber::new(settings.probe_timeout),
                settings,
                catalog,
                registry,
                events,
                state: Mutex::new(state),
                starts: Mutex::new(StartSlots::default()),
            }),
        }
    }

    /// Receives every event published from now on, for all projects.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn emit_all(&self, events: Vec<Event>) {
        for event in events {
            self.emit(event);
        }
    }

    /// Starts the dev environment for a project and returns its preview port.
    ///
    /// Concurrent calls for the same project share one start. A group that is already
    /// running or starting is returned as-is. Readiness failures do not fail the call;
    /// they leave the group in `error` and are reported as events.
    pub async fn start_dev_server(
        &self,
        project_id: &str,
        project_path: &Path,
        services: &[String],
    ) -> OrchestratorResult<u16> {
        let start = {
            let mut starts = self.inner.starts.lock().await;
            match starts.in_flight.get(project_id) {
                Some((_, start)) => {
                    debug!(project_id, "joining start already in flight");
                    start.clone()
                }
                None => {
                    starts.next_token += 1;
                    let token = starts.next_token;
                    let this = self.clone();
                    let id = project_id.to_string();
                    let path = project_path.to_path_buf();
                    let services = services.to_vec();
                    let start = async move {
                        let result = this.start_group(&id, &path, &services).await;
                        let mut starts = this.inner.starts.lock().await;
                        if starts.in_flight.get(&id).is_some_and(|(t, _)| *t == token) {
                            starts.in_flight.remove(&id);
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    starts
                        .in_flight
                        .insert(project_id.to_string(), (token, start.clone()));
                    start
                }
            }
        };
        start.await
    }

    async fn start_group(
        &self,
        project_id: &str,
        project_path: &Path,
        services: &[String],
    ) -> OrchestratorResult<u16> {
        let stale = {
            let state = self.inner.state.lock().await;
            match state.groups.get(project_id) {
                Some(group)
                    if matches!(group.state, ProcessState::Running | ProcessState::Starting) =>
                {
                    debug!(project_id, port = group.preview_port, "already running");
                    return Ok(group.preview_port);
                }
                Some(_) => true,
                None => false,
            }
        };
        if stale {
            self.stop_group(project_id).await;
        }

        let strategy = self.inner.catalog.resolve(services)?;
        let settings = &self.inner.settings;
        let (session, specs, health, preview_port) = {
            let mut state = self.inner.state.lock().await;
            let allocations = strategy.allocate_ports(&mut state.ports, project_id)?;
            let Some(preview_port) = strategy.preview_port(&allocations) else {
                strategy.release_ports(&mut state.ports, project_id);
                return Err(OrchestratorError::NoPreviewPort {
                    project_id: project_id.to_string(),
                });
            };
            if let Err(err) = strategy.update_project_configs(project_path, &allocations) {
                strategy.release_ports(&mut state.ports, project_id);
                return Err(err);
            }
            let specs = strategy.process_configs(project_path, &allocations, &settings.env);
            let health = strategy.health_check_config(&allocations);

            state.next_session += 1;
            let session = state.next_session;
            let processes = specs
                .iter()
                .map(|spec| {
                    (
                        spec.id.clone(),
                        ProcessInfo::new(spec.clone(), settings.max_output_lines),
                    )
                })
                .collect();
            state.groups.insert(
                project_id.to_string(),
                ProcessGroup {
                    session,
                    strategy: strategy.clone(),
                    processes,
                    allocations,
                    health: health.clone(),
                    preview_port,
                    state: ProcessState::Starting,
                    output: TimelineBuffer::new(settings.max_output_lines),
                    health_task: None,
                    health_round: Arc::new(Mutex::new(())),
                },
            );
            (session, specs, health, preview_port)
        };
        info!(
            project_id,
            strategy = strategy.name(),
            preview_port,
            processes = specs.len(),
            "starting dev server"
        );
        self.emit(Event::ProcessStatusChanged {
            project_id: project_id.to_string(),
            state: ProcessState::Starting,
        });

        for spec in &specs {
            if let Err(err) = self.spawn_process(project_id, session, spec).await {
                self.abort_start(project_id, session, &spec.id, &err).await;
                return Err(err);
            }
        }

        self.await_readiness(project_id, session, &health, preview_port)
            .await;
        Ok(preview_port)
    }

    async fn spawn_process(
        &self,
        project_id: &str,
        session: u64,
        spec: &ProcessSpec,
    ) -> OrchestratorResult<()> {
        let mut command = Command::new(&spec.cmd);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let cmd_line = spec.command_line();
        self.record_line(
            project_id,
            session,
            &spec.id,
            StreamKind::System,
            format!("[devrack] starting: {}", cmd_line),
        )
        .await;

        let mut child = command.spawn().map_err(|err| OrchestratorError::Spawn {
            role: spec.id.clone(),
            cmd: cmd_line.clone(),
            source: Arc::new(err),
        })?;
        let pid = child.id().unwrap_or(0);

        // Persist before anything else so a crash from here on is still cleanable.
        let key = registry_key(project_id, &spec.id);
        if let Err(err) = self.inner.registry.save_pid(&key, pid, spec.port) {
            warn!(key = %key, pid, error = %err, "failed to persist pid");
        }

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(self.clone().read_stream(
                project_id.to_string(),
                session,
                spec.id.clone(),
                StreamKind::Stdout,
                stdout,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(self.clone().read_stream(
                project_id.to_string(),
                session,
                spec.id.clone(),
                StreamKind::Stderr,
                stderr,
            ));
        }

        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);
        let registered = {
            let mut state = self.inner.state.lock().await;
            match state
                .groups
                .get_mut(project_id)
                .filter(|g| g.session == session)
                .and_then(|g| g.processes.get_mut(&spec.id))
            {
                Some(process) => {
                    process.handle = Some(ProcessHandle {
                        pid,
                        kill_tx: kill_tx.clone(),
                        exit_rx,
                    });
                    true
                }
                None => false,
            }
        };

        tokio::spawn(self.clone().watch_exit(
            project_id.to_string(),
            session,
            spec.id.clone(),
            pid,
            child,
            kill_rx,
            exit_tx,
        ));

        if !registered {
            // The group was stopped while we were spawning.
            warn!(project_id, role = %spec.id, pid, "group went away during spawn, killing");
            signal::send_signal(pid, ProcessSignal::SigKill);
            let _ = kill_tx.try_send(());
            return Ok(());
        }

        info!(project_id, role = %spec.id, pid, cmd = %cmd_line, "process spawned");
        self.emit(Event::ProcessSpawned {
            project_id: project_id.to_string(),
            role: spec.id.clone(),
            pid,
        });
        Ok(())
    }

    /// Marks a failed spawn and stops the siblings that did start.
    async fn abort_start(
        &self,
        project_id: &str,
        session: u64,
        role: &str,
        err: &OrchestratorError,
    ) {
        warn!(project_id, role, error = %err, "spawn failed");
        let mut events = Vec::new();
        let handles = {
            let mut state = self.inner.state.lock().await;
            let Some(group) = state
                .groups
                .get_mut(project_id)
                .filter(|g| g.session == session)
            else {
                return;
            };
            let mut handles = Vec::new();
            for (member, process) in group.processes.iter_mut() {
                if member == role {
                    process.state = ProcessState::Error;
                    continue;
                }
                match &process.handle {
                    Some(handle) if !handle.has_exited() => {
                        process.state = ProcessState::Stopping;
                        handles.push((member.clone(), handle.clone()));
                    }
                    _ => process.state = ProcessState::Stopped,
                }
            }
            let line = OutputLine::new(
                StreamKind::System,
                format!("[devrack] {}", err),
                group.label(role).as_deref(),
            );
            group.push_output(role, line.clone());
            events.push(Event::ProcessOutput {
                project_id: project_id.to_string(),
                role: role.to_string(),
                line,
            });
            if let Some(next) = group.refresh_state() {
                events.push(Event::ProcessStatusChanged {
                    project_id: project_id.to_string(),
                    state: next,
                });
            }
            events.push(Event::ProcessError {
                project_id: project_id.to_string(),
                role: Some(role.to_string()),
                message: err.to_string(),
            });
            handles
        };
        self.emit_all(events);
        join_all(
            handles
                .into_iter()
                .map(|(member, handle)| self.terminate(project_id, member, handle)),
        )
        .await;
    }

    async fn read_stream<R>(
        self,
        project_id: String,
        session: u64,
        role: String,
        stream: StreamKind,
        reader: R,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match read_capped_line(&mut reader, &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let line = text.trim_end_matches(['\n', '\r']).to_string();
                    self.record_line(&project_id, session, &role, stream, line)
                        .await;
                }
            }
        }
    }

    /// Appends a line to the process and group buffers, publishes it and escalates
    /// critical patterns.
    async fn record_line(
        &self,
        project_id: &str,
        session: u64,
        role: &str,
        stream: StreamKind,
        raw: String,
    ) {
        let critical = match stream {
            StreamKind::System => None,
            _ => classify_critical(&sanitize_text(&raw, true)),
        };
        let line = {
            let mut state = self.inner.state.lock().await;
            let Some(group) = state
                .groups
                .get_mut(project_id)
                .filter(|g| g.session == session)
            else {
                return;
            };
            let line = OutputLine::new(stream, raw, group.label(role).as_deref());
            group.push_output(role, line.clone());
            line
        };
        if let Some(pattern) = critical {
            warn!(project_id, role, line = %line.message, "critical output: {}", pattern.description());
            self.emit(Event::ProcessError {
                project_id: project_id.to_string(),
                role: Some(role.to_string()),
                message: format!("{}: {}: {}", role, pattern.description(), line.message),
            });
        }
        self.emit(Event::ProcessOutput {
            project_id: project_id.to_string(),
            role: role.to_string(),
            line,
        });
    }

    /// Owns the child until it exits, force-killing it on request.
    async fn watch_exit(
        self,
        project_id: String,
        session: u64,
        role: String,
        pid: u32,
        mut child: Child,
        mut kill_rx: mpsc::Receiver<()>,
        exit_tx: watch::Sender<Option<ExitInfo>>,
    ) {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(()) = kill_rx.recv() => {
                    let _ = child.start_kill();
                }
            }
        };
        let exit = match status {
            Ok(status) => ExitInfo::from_status(&status),
            Err(err) => {
                warn!(project_id, role, error = %err, "failed to wait on process");
                ExitInfo {
                    code: None,
                    signal: None,
                }
            }
        };
        self.handle_exit(&project_id, session, &role, pid, exit).await;
        let _ = exit_tx.send(Some(exit));
    }

    async fn handle_exit(
        &self,
        project_id: &str,
        session: u64,
        role: &str,
        pid: u32,
        exit: ExitInfo,
    ) {
        let key = registry_key(project_id, role);
        // A newer session may already have recorded its own pid under this key.
        if let Err(err) = self.inner.registry.remove_pid_if(&key, pid) {
            warn!(key = %key, error = %err, "failed to remove pid from registry");
        }

        let settings = &self.inner.settings;
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock().await;
            let SupervisorState { groups, crashes, .. } = &mut *state;
            let Some(group) = groups.get_mut(project_id).filter(|g| g.session == session) else {
                return;
            };
            let label = group.label(role);
            let Some(process) = group.processes.get_mut(role) else {
                return;
            };

            match process.state {
                ProcessState::Stopping => {
                    debug!(project_id, role, ?exit, "process stopped");
                    process.state = ProcessState::Stopped;
                }
                ProcessState::Starting | ProcessState::Running => {
                    let crash_count = crashes
                        .entry(key)
                        .or_default()
                        .record(Instant::now(), settings.crash_window);
                    process.state = ProcessState::Crashed;
                    warn!(project_id, role, code = ?exit.code, signal = ?exit.signal, crash_count, "process crashed");
                    events.push(Event::ProcessCrashed {
                        project_id: project_id.to_string(),
                        crash: CrashReport {
                            process_id: role.to_string(),
                            code: exit.code,
                            signal: exit.signal,
                            crash_count,
                        },
                    });
                    if crash_count == settings.max_crashes {
                        events.push(Event::ProcessError {
                            project_id: project_id.to_string(),
                            role: Some(role.to_string()),
                            message: format!(
                                "{} crashed too many times ({} crashes within {}s)",
                                role,
                                crash_count,
                                settings.crash_window.as_secs()
                            ),
                        });
                    }
                }
                ProcessState::Stopped | ProcessState::Crashed | ProcessState::Error => {
                    debug!(project_id, role, ?exit, "process exited");
                }
            }

            let line = OutputLine::new(
                StreamKind::System,
                format!("[devrack] {}", exit.describe()),
                label.as_deref(),
            );
            group.push_output(role, line.clone());
            events.insert(
                0,
                Event::ProcessOutput {
                    project_id: project_id.to_string(),
                    role: role.to_string(),
                    line,
                },
            );
            if let Some(next) = group.refresh_state() {
                events.push(Event::ProcessStatusChanged {
                    project_id: project_id.to_string(),
                    state: next,
                });
            }
        }
        self.emit_all(events);
    }

    /// Waits for every required endpoint, then declares the group running and
    /// starts the periodic health check.
    async fn await_readiness(
        &self,
        project_id: &str,
        session: u64,
        health: &HealthCheckConfig,
        preview_port: u16,
    ) {
        let settings = &self.inner.settings;
        for endpoint in health.required() {
            let outcome = wait_until_responding(
                &self.inner.prober,
                &endpoint.url,
                settings.readiness_timeout,
                settings.readiness_poll,
                || self.readiness_abandoned(project_id, session, &endpoint.role),
            )
            .await;

            let mut events = Vec::new();
            {
                let mut state = self.inner.state.lock().await;
                let Some(group) = state
                    .groups
                    .get_mut(project_id)
                    .filter(|g| g.session == session && g.state != ProcessState::Stopping)
                else {
                    return;
                };
                let message = match outcome {
                    Readiness::Ready => {
                        debug!(project_id, url = %endpoint.url, "endpoint ready");
                        if let Some(process) = group.processes.get_mut(&endpoint.role) {
                            if process.state == ProcessState::Starting {
                                process.state = ProcessState::Running;
                            }
                        }
                        None
                    }
                    Readiness::TimedOut => {
                        if let Some(process) = group.processes.get_mut(&endpoint.role) {
                            process.state = ProcessState::Error;
                        }
                        Some(format!(
                            "{} did not respond at {} within {}s",
                            endpoint.label,
                            endpoint.url,
                            settings.readiness_timeout.as_secs()
                        ))
                    }
                    Readiness::Aborted => Some(format!(
                        "{} exited before responding at {}",
                        endpoint.label, endpoint.url
                    )),
                };
                if let Some(message) = message {
                    warn!(project_id, "{}", message);
                    if let Some(next) = group.refresh_state() {
                        events.push(Event::ProcessStatusChanged {
                            project_id: project_id.to_string(),
                            state: next,
                        });
                    }
                    events.push(Event::ProcessError {
                        project_id: project_id.to_string(),
                        role: Some(endpoint.role.clone()),
                        message,
                    });
                }
            }
            let failed = !events.is_empty();
            self.emit_all(events);
            if failed {
                return;
            }
        }

        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock().await;
            let Some(group) = state
                .groups
                .get_mut(project_id)
                .filter(|g| g.session == session)
            else {
                return;
            };
            for process in group.processes.values_mut() {
                let alive = process.handle.as_ref().is_some_and(|h| !h.has_exited());
                if process.state == ProcessState::Starting && alive {
                    process.state = ProcessState::Running;
                }
            }
            if let Some(next) = group.refresh_state() {
                events.push(Event::ProcessStatusChanged {
                    project_id: project_id.to_string(),
                    state: next,
                });
            }
            if group.state == ProcessState::Running {
                info!(project_id, port = preview_port, "dev server ready");
                events.push(Event::ProcessReady {
                    project_id: project_id.to_string(),
                    port: preview_port,
                });
                group.health_task = Some(self.spawn_health_loop(project_id, session));
            }
        }
        self.emit_all(events);
    }

    /// True when waiting no longer makes sense: the group is gone or stopping, or the
    /// process behind the endpoint already died.
    async fn readiness_abandoned(&self, project_id: &str, session: u64, role: &str) -> bool {
        let state = self.inner.state.lock().await;
        let Some(group) = state
            .groups
            .get(project_id)
            .filter(|g| g.session == session)
        else {
            return true;
        };
        if group.state == ProcessState::Stopping {
            return true;
        }
        group
            .processes
            .get(role)
            .map(|p| matches!(p.state, ProcessState::Crashed | ProcessState::Error))
            .unwrap_or(true)
    }

    fn spawn_health_loop(&self, project_id: &str, session: u64) -> JoinHandle<()> {
        let this = self.clone();
        let project_id = project_id.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.inner.settings.health_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if this.run_health_round(&project_id, Some(session)).await.is_none() {
                    break;
                }
            }
        })
    }

    /// Runs one round of checks for every endpoint of a running group.
    ///
    /// Returns `None` without checking anything when the group is not running.
    async fn run_health_round(
        &self,
        project_id: &str,
        session: Option<u64>,
    ) -> Option<HashMap<String, HealthCheckStatus>> {
        let (session, targets, round) = {
            let state = self.inner.state.lock().await;
            let group = state.groups.get(project_id)?;
            if session.is_some_and(|s| s != group.session) || group.state != ProcessState::Running
            {
                return None;
            }
            let targets: Vec<_> = group
                .health
                .endpoints
                .iter()
                .map(|endpoint| {
                    let pid = group.processes.get(&endpoint.role).and_then(|p| p.pid());
                    (endpoint.clone(), pid)
                })
                .collect();
            (group.session, targets, group.health_round.clone())
        };

        let _round = match round.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                // A round is already in progress; report its results instead of probing again.
                drop(round.lock().await);
                let state = self.inner.state.lock().await;
                return state
                    .groups
                    .get(project_id)
                    .filter(|g| g.session == session)
                    .map(ProcessGroup::health_snapshot);
            }
        };

        let mut results = Vec::with_capacity(targets.len());
        for (endpoint, pid) in targets {
            let alive = pid.map(signal::is_process_alive).unwrap_or(false);
            let http = self.inner.prober.is_responding(&endpoint.url).await;
            results.push((endpoint, alive, http));
        }

        let threshold = self.inner.settings.health_failure_threshold;
        let mut events = Vec::new();
        let mut statuses = HashMap::new();
        {
            let mut state = self.inner.state.lock().await;
            let SupervisorState { groups, ports, .. } = &mut *state;
            let group = groups
                .get_mut(project_id)
                .filter(|g| g.session == session)?;
            for (endpoint, alive, http) in results {
                let port_ok = ports.holds(project_id, endpoint.port);
                let Some(process) = group.processes.get_mut(&endpoint.role) else {
                    continue;
                };
                let status = process
                    .health
                    .get_or_insert_with(|| HealthCheckStatus::pending(&endpoint.role));
                let became_unhealthy = status.record(alive, http, port_ok, threshold);
                events.push(Event::ProcessHealthChanged {
                    project_id: project_id.to_string(),
                    status: status.clone(),
                });
                if became_unhealthy {
                    warn!(
                        project_id,
                        role = %endpoint.role,
                        failures = status.consecutive_failures,
                        "process is unhealthy"
                    );
                    events.push(Event::ProcessHealthCritical {
                        project_id: project_id.to_string(),
                        status: status.clone(),
                    });
                }
                statuses.insert(endpoint.role.clone(), status.clone());
            }
        }
        self.emit_all(events);
        Some(statuses)
    }

    /// Runs a health check now. Returns `None` unless the group is running.
    pub async fn trigger_health_check(
        &self,
        project_id: &str,
    ) -> Option<HashMap<String, HealthCheckStatus>> {
        self.run_health_round(project_id, None).await
    }

    /// Stops every process of a project, gracefully first, and forgets the group.
    ///
    /// The project marked current cannot be stopped without `force`. A start still in
    /// flight is detached, so the next start spawns a fresh group instead of joining it.
    /// Resolves once every process has exited.
    pub async fn stop_dev_server(&self, project_id: &str, force: bool) -> OrchestratorResult<()> {
        if !force {
            let state = self.inner.state.lock().await;
            if state.current_project.as_deref() == Some(project_id) {
                return Err(OrchestratorError::ProjectInFocus {
                    project_id: project_id.to_string(),
                });
            }
        }
        if self
            .inner
            .starts
            .lock()
            .await
            .in_flight
            .remove(project_id)
            .is_some()
        {
            debug!(project_id, "detached start in flight");
        }
        self.stop_group(project_id).await;
        Ok(())
    }

    async fn stop_group(&self, project_id: &str) {
        let (session, pids, handles) = {
            let mut state = self.inner.state.lock().await;
            let Some(group) = state.groups.get_mut(project_id) else {
                state.ports.release(project_id);
                return;
            };
            if let Some(task) = group.health_task.take() {
                task.abort();
            }
            let mut pids = Vec::new();
            let mut handles = Vec::new();
            for (role, process) in group.processes.iter_mut() {
                let Some(handle) = &process.handle else {
                    continue;
                };
                pids.push((role.clone(), handle.pid));
                if !handle.has_exited() {
                    process.state = ProcessState::Stopping;
                    handles.push((role.clone(), handle.clone()));
                }
            }
            group.state = ProcessState::Stopping;
            (group.session, pids, handles)
        };
        info!(project_id, processes = handles.len(), "stopping dev server");
        self.emit(Event::ProcessStatusChanged {
            project_id: project_id.to_string(),
            state: ProcessState::Stopping,
        });

        join_all(
            handles
                .into_iter()
                .map(|(role, handle)| self.terminate(project_id, role, handle)),
        )
        .await;

        {
            let mut state = self.inner.state.lock().await;
            let same_group = state
                .groups
                .get(project_id)
                .is_some_and(|g| g.session == session);
            if same_group {
                if let Some(group) = state.groups.remove(project_id) {
                    group.strategy.release_ports(&mut state.ports, project_id);
                }
            }
        }
        for (role, pid) in pids {
            let key = registry_key(project_id, &role);
            if let Err(err) = self.inner.registry.remove_pid_if(&key, pid) {
                warn!(key = %key, error = %err, "failed to remove pid from registry");
            }
        }
        info!(project_id, "dev server stopped");
        self.emit(Event::ProcessStatusChanged {
            project_id: project_id.to_string(),
            state: ProcessState::Stopped,
        });
    }

    /// Graceful signal, then forced kill after the grace period. Returns once the
    /// child has been reaped or the kill wait ran out.
    async fn terminate(&self, project_id: &str, role: String, handle: ProcessHandle) {
        if handle.has_exited() {
            return;
        }
        let mut exit_rx = handle.exit_rx.clone();
        debug!(project_id, role = %role, pid = handle.pid, "sending {}", ProcessSignal::SigTerm.label());
        signal::send_signal(handle.pid, ProcessSignal::SigTerm);
        let grace = self.inner.settings.stop_grace;
        let exited = tokio::time::timeout(grace, exit_rx.wait_for(|e| e.is_some()))
            .await
            .is_ok();
        if exited {
            return;
        }

        warn!(project_id, role = %role, pid = handle.pid, "no exit after {:?}, killing", grace);
        signal::send_signal(handle.pid, ProcessSignal::SigKill);
        let _ = handle.kill_tx.try_send(());
        let reaped = tokio::time::timeout(KILL_WAIT, exit_rx.wait_for(|e| e.is_some()))
            .await
            .is_ok();
        if !reaped {
            warn!(project_id, role = %role, pid = handle.pid, "process still not reaped after kill");
        }
    }

    /// Force-stop, let the OS settle (ports in particular), then start again.
    pub async fn restart_dev_server(
        &self,
        project_id: &str,
        project_path: &Path,
        services: &[String],
    ) -> OrchestratorResult<u16> {
        self.stop_dev_server(project_id, true).await?;
        tokio::time::sleep(self.inner.settings.restart_settle).await;
        self.start_dev_server(project_id, project_path, services)
            .await
    }

    /// Stops every group concurrently. Used at shutdown.
    pub async fn stop_all(&self) {
        let project_ids: Vec<String> = {
            let state = self.inner.state.lock().await;
            state.groups.keys().cloned().collect()
        };
        let results = join_all(
            project_ids
                .iter()
                .map(|project_id| self.stop_dev_server(project_id, true)),
        )
        .await;
        for (project_id, result) in project_ids.iter().zip(results) {
            if let Err(err) = result {
                warn!(project_id = %project_id, error = %err, "failed to stop dev server");
            }
        }
    }

    /// Marks the project in focus; it cannot be stopped without `force`.
    pub async fn set_current_project(&self, project_id: Option<String>) {
        self.inner.state.lock().await.current_project = project_id;
    }

    /// Aggregated state; `stopped` for untracked projects.
    pub async fn get_process_status(&self, project_id: &str) -> ProcessState {
        let state = self.inner.state.lock().await;
        state
            .groups
            .get(project_id)
            .map(|g| g.state)
            .unwrap_or(ProcessState::Stopped)
    }

    /// State of each member process, by role.
    pub async fn get_member_states(&self, project_id: &str) -> BTreeMap<String, ProcessState> {
        let state = self.inner.state.lock().await;
        state
            .groups
            .get(project_id)
            .map(|g| {
                g.processes
                    .iter()
                    .map(|(role, p)| (role.clone(), p.state))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Most recent `limit` lines of the group's combined output; everything if `None`.
    pub async fn get_process_output(&self, project_id: &str, limit: Option<usize>) -> Vec<OutputLine> {
        let state = self.inner.state.lock().await;
        state
            .groups
            .get(project_id)
            .map(|g| g.output.tail(limit))
            .unwrap_or_default()
    }

    /// Most recent `limit` lines of one process's output.
    pub async fn get_role_output(
        &self,
        project_id: &str,
        role: &str,
        limit: Option<usize>,
    ) -> Vec<OutputLine> {
        let state = self.inner.state.lock().await;
        let Some(process) = state
            .groups
            .get(project_id)
            .and_then(|g| g.processes.get(role))
        else {
            return Vec::new();
        };
        process.logs.tail(limit)
    }

    /// Preview port of the project's group.
    pub async fn get_port(&self, project_id: &str) -> Option<u16> {
        let state = self.inner.state.lock().await;
        state.groups.get(project_id).map(|g| g.preview_port)
    }

    pub async fn get_port_allocations(&self, project_id: &str) -> Vec<PortAllocation> {
        let state = self.inner.state.lock().await;
        state
            .groups
            .get(project_id)
            .map(|g| g.allocations.clone())
            .unwrap_or_default()
    }

    /// Latest health status per role. Roles not yet checked are absent.
    pub async fn get_health_status(&self, project_id: &str) -> HashMap<String, HealthCheckStatus> {
        let state = self.inner.state.lock().await;
        state
            .groups
            .get(project_id)
            .map(ProcessGroup::health_snapshot)
            .unwrap_or_default()
    }

    /// Whether `port` is free of both our reservations and other listeners.
    pub async fn is_port_available(&self, port: u16) -> bool {
        self.inner.state.lock().await.ports.is_available(port)
    }

    pub async fn project_ids(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state.groups.keys().cloned().collect()
    }
}

/// Reads up to and including the next newline, or `MAX_LINE_BYTES` if that comes first.
async fn read_capped_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    (&mut *reader).take(MAX_LINE_BYTES).read_until(b'\n', buf).await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::health::tests::serve;
    use std::path::PathBuf;
    use tokio::net::TcpListener;

    struct Harness {
        _dir: tempfile::TempDir,
        project: PathBuf,
        supervisor: Supervisor,
        events: broadcast::Receiver<Event>,
    }

    fn settings(dir: &Path) -> OrchestratorSettings {
        OrchestratorSettings {
            max_output_lines: 500,
            port_search_span: 200,
            readiness_timeout: Duration::from_secs(10),
            readiness_poll: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(300),
            health_interval: Duration::from_millis(200),
            health_failure_threshold: 2,
            crash_window: Duration::from_secs(300),
            max_crashes: 2,
            stop_grace: Duration::from_secs(1),
            restart_settle: Duration::from_millis(50),
            registry_path: dir.join("processes.json"),
            env: HashMap::new(),
        }
    }

    fn service(name: &str, cmd: &str, required: bool) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            cmd: Some(cmd.to_string()),
            cwd: Some(".".to_string()),
            port: Some(free_port()),
            health_path: None,
            required: Some(required),
            preview: None,
            port_env: None,
            env_file: None,
            env: None,
        }
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn harness(services: Vec<ServiceConfig>, tweak: impl FnOnce(&mut OrchestratorSettings)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        std::fs::create_dir(&project).unwrap();
        let mut settings = settings(dir.path());
        tweak(&mut settings);
        let catalog = ServiceCatalog::from_config(&services).unwrap();
        let registry = ProcessRegistry::new(settings.registry_path.clone());
        let supervisor = Supervisor::new(settings, catalog, registry);
        let events = supervisor.subscribe();
        Harness {
            _dir: dir,
            project,
            supervisor,
            events,
        }
    }

    async fn next_event<F>(events: &mut broadcast::Receiver<Event>, mut pred: F) -> Event
    where
        F: FnMut(&Event) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(15), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Serves HTTP on `role`'s allocated port once the group exists.
    async fn serve_role_when_allocated(
        supervisor: Supervisor,
        project_id: &'static str,
        role: &'static str,
        delay: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let port = loop {
                let allocations = supervisor.get_port_allocations(project_id).await;
                if let Some(a) = allocations.iter().find(|a| a.role == role) {
                    break a.port;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            };
            tokio::time::sleep(delay).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            serve(listener, "200 OK");
            std::future::pending::<()>().await;
        })
    }

    #[tokio::test]
    async fn single_process_becomes_ready_and_stops_cleanly() {
        let mut h = harness(vec![service("aggregator", "sleep 30", true)], |_| {});
        let server =
            serve_role_when_allocated(h.supervisor.clone(), "p1", "aggregator", Duration::from_millis(500))
                .await;

        let port = h
            .supervisor
            .start_dev_server("p1", &h.project, &[])
            .await
            .unwrap();
        assert_eq!(h.supervisor.get_process_status("p1").await, ProcessState::Running);
        let ready = next_event(&mut h.events, |e| matches!(e, Event::ProcessReady { .. })).await;
        assert!(matches!(ready, Event::ProcessReady { port: p, .. } if p == port));

        let key = registry_key("p1", "aggregator");
        let entry = h.supervisor.registry().get_persisted_process(&key).unwrap().unwrap();
        assert_eq!(entry.port, port);
        let env = std::fs::read_to_string(h.project.join(".env.local")).unwrap();
        assert!(env.contains(&format!("PORT={}", port)));

        h.supervisor.stop_dev_server("p1", false).await.unwrap();
        server.abort();
        assert_eq!(h.supervisor.get_process_status("p1").await, ProcessState::Stopped);
        assert!(h.supervisor.get_port_allocations("p1").await.is_empty());
        assert!(h.supervisor.get_port("p1").await.is_none());
        assert!(h
            .supervisor
            .registry()
            .get_all_persisted_processes()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn concurrent_starts_spawn_one_group() {
        let mut h = harness(vec![service("aggregator", "sleep 30", false)], |_| {});
        let (a, b) = tokio::join!(
            h.supervisor.start_dev_server("p2", &h.project, &[]),
            h.supervisor.start_dev_server("p2", &h.project, &[]),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        let again = h.supervisor.start_dev_server("p2", &h.project, &[]).await.unwrap();
        assert_eq!(Some(again), h.supervisor.get_port("p2").await);

        let mut spawned = 0;
        while let Ok(event) = h.events.try_recv() {
            if matches!(event, Event::ProcessSpawned { .. }) {
                spawned += 1;
            }
        }
        assert_eq!(spawned, 1);
        h.supervisor.stop_all().await;
        assert!(h.supervisor.project_ids().await.is_empty());
    }

    #[tokio::test]
    async fn optional_backend_does_not_gate_readiness() {
        let mut h = harness(
            vec![
                service("frontend", "sleep 30", true),
                service("backend", "sleep 30", false),
            ],
            |_| {},
        );
        let server =
            serve_role_when_allocated(h.supervisor.clone(), "p3", "frontend", Duration::ZERO).await;
        let services = vec!["frontend".to_string(), "backend".to_string()];
        let port = h
            .supervisor
            .start_dev_server("p3", &h.project, &services)
            .await
            .unwrap();
        let allocations = h.supervisor.get_port_allocations("p3").await;
        assert_eq!(allocations.len(), 2);
        assert_eq!(
            allocations.iter().find(|a| a.role == "frontend").map(|a| a.port),
            Some(port)
        );
        assert_eq!(h.supervisor.get_process_status("p3").await, ProcessState::Running);

        let health = h.supervisor.trigger_health_check("p3").await.unwrap();
        assert_eq!(health["frontend"].http_responding, crate::process::CheckResult::Pass);
        assert_eq!(health["backend"].http_responding, crate::process::CheckResult::Fail);
        assert_eq!(health["backend"].process_alive, crate::process::CheckResult::Pass);

        let critical = next_event(&mut h.events, |e| {
            matches!(e, Event::ProcessHealthCritical { .. })
        })
        .await;
        assert!(matches!(critical, Event::ProcessHealthCritical { status, .. } if status.role == "backend"));
        assert_eq!(h.supervisor.get_process_status("p3").await, ProcessState::Running);

        h.supervisor.stop_all().await;
        server.abort();
    }

    #[tokio::test]
    async fn crashes_are_counted_across_restarts() {
        let mut h = harness(vec![service("aggregator", "sh -c 'sleep 1; exit 1'", false)], |_| {});
        h.supervisor.start_dev_server("p4", &h.project, &[]).await.unwrap();
        assert_eq!(h.supervisor.get_process_status("p4").await, ProcessState::Running);

        let crash = next_event(&mut h.events, |e| matches!(e, Event::ProcessCrashed { .. })).await;
        let Event::ProcessCrashed { crash, .. } = crash else { unreachable!() };
        assert_eq!(crash.code, Some(1));
        assert_eq!(crash.crash_count, 1);
        assert_eq!(h.supervisor.get_process_status("p4").await, ProcessState::Crashed);
        assert!(h.supervisor.trigger_health_check("p4").await.is_none());

        h.supervisor
            .restart_dev_server("p4", &h.project, &[])
            .await
            .unwrap();
        let crash = next_event(&mut h.events, |e| matches!(e, Event::ProcessCrashed { .. })).await;
        let Event::ProcessCrashed { crash, .. } = crash else { unreachable!() };
        assert_eq!(crash.crash_count, 2);
        let error = next_event(&mut h.events, |e| matches!(e, Event::ProcessError { .. })).await;
        assert!(matches!(error, Event::ProcessError { message, .. } if message.contains("crashed too many times")));

        let output = h.supervisor.get_process_output("p4", None).await;
        assert!(output.iter().any(|l| l.message.contains("process ended with code 1")));
        h.supervisor.stop_dev_server("p4", true).await.unwrap();
    }

    #[tokio::test]
    async fn readiness_timeout_leaves_group_in_error() {
        let mut h = harness(vec![service("aggregator", "sleep 30", true)], |s| {
            s.readiness_timeout = Duration::from_millis(800);
        });
        let port = h.supervisor.start_dev_server("p5", &h.project, &[]).await.unwrap();
        assert_eq!(Some(port), h.supervisor.get_port("p5").await);
        assert_eq!(h.supervisor.get_process_status("p5").await, ProcessState::Error);
        let error = next_event(&mut h.events, |e| matches!(e, Event::ProcessError { .. })).await;
        assert!(matches!(error, Event::ProcessError { message, .. } if message.starts_with("aggregator did not respond")));

        h.supervisor.stop_dev_server("p5", false).await.unwrap();
        assert_eq!(h.supervisor.get_process_status("p5").await, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let mut h = harness(
            vec![service("aggregator", "devrack-no-such-binary --flag", true)],
            |_| {},
        );
        let err = h
            .supervisor
            .start_dev_server("p6", &h.project, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Spawn { ref role, .. } if role == "aggregator"));
        assert_eq!(h.supervisor.get_process_status("p6").await, ProcessState::Error);
        next_event(&mut h.events, |e| matches!(e, Event::ProcessError { .. })).await;
        h.supervisor.stop_dev_server("p6", true).await.unwrap();
        assert!(h.supervisor.get_port_allocations("p6").await.is_empty());
    }

    #[tokio::test]
    async fn current_project_needs_force_to_stop() {
        let h = harness(vec![service("aggregator", "sleep 30", false)], |_| {});
        h.supervisor.start_dev_server("p7", &h.project, &[]).await.unwrap();
        h.supervisor.set_current_project(Some("p7".to_string())).await;
        let err = h.supervisor.stop_dev_server("p7", false).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ProjectInFocus { .. }));
        assert_eq!(h.supervisor.get_process_status("p7").await, ProcessState::Running);
        h.supervisor.stop_dev_server("p7", true).await.unwrap();
        assert_eq!(h.supervisor.get_process_status("p7").await, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn critical_output_is_escalated() {
        let mut h = harness(
            vec![service(
                "aggregator",
                "sh -c 'echo hello; echo \"Error: listen EADDRINUSE :::3000\" 1>&2; echo \"error TS2304\"; sleep 30'",
                false,
            )],
            |_| {},
        );
        h.supervisor.start_dev_server("p8", &h.project, &[]).await.unwrap();
        let (mut escalated, mut plain_error) = (Vec::new(), false);
        while escalated.is_empty() || !plain_error {
            match next_event(&mut h.events, |e| {
                matches!(e, Event::ProcessError { .. } | Event::ProcessOutput { .. })
            })
            .await
            {
                Event::ProcessError { message, .. } => escalated.push(message),
                Event::ProcessOutput { line, .. } => plain_error |= line.message == "error TS2304",
                _ => {}
            }
        }
        assert_eq!(escalated.len(), 1);
        assert!(escalated[0].contains("port already in use"));
        let output = h.supervisor.get_process_output("p8", Some(3)).await;
        assert_eq!(output.len(), 3);
        let role_output = h.supervisor.get_role_output("p8", "aggregator", None).await;
        assert!(role_output.iter().any(|l| l.message == "hello"));
        assert!(role_output
            .iter()
            .any(|l| l.stream == StreamKind::Stderr && l.message.contains("EADDRINUSE")));
        h.supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn stop_detaches_start_in_flight() {
        let mut h = harness(vec![service("aggregator", "sleep 30", true)], |_| {});
        let first = {
            let supervisor = h.supervisor.clone();
            let project = h.project.clone();
            tokio::spawn(async move { supervisor.start_dev_server("p9", &project, &[]).await })
        };
        next_event(&mut h.events, |e| matches!(e, Event::ProcessSpawned { .. })).await;
        h.supervisor.stop_dev_server("p9", true).await.unwrap();

        let server =
            serve_role_when_allocated(h.supervisor.clone(), "p9", "aggregator", Duration::ZERO).await;
        let port = h.supervisor.start_dev_server("p9", &h.project, &[]).await.unwrap();
        assert_eq!(h.supervisor.get_process_status("p9").await, ProcessState::Running);
        assert_eq!(h.supervisor.get_port("p9").await, Some(port));
        first.await.unwrap().unwrap();
        assert_eq!(h.supervisor.get_process_status("p9").await, ProcessState::Running);

        h.supervisor.stop_all().await;
        server.abort();
    }

    #[tokio::test]
    async fn late_exit_keeps_newer_registry_entry() {
        let h = harness(vec![service("aggregator", "sleep 30", false)], |_| {});
        let key = registry_key("p10", "aggregator");
        h.supervisor.start_dev_server("p10", &h.project, &[]).await.unwrap();
        let old_pid = h.supervisor.registry().get_persisted_process(&key).unwrap().unwrap().pid;
        h.supervisor.stop_dev_server("p10", true).await.unwrap();

        h.supervisor.start_dev_server("p10", &h.project, &[]).await.unwrap();
        let new_pid = h.supervisor.registry().get_persisted_process(&key).unwrap().unwrap().pid;
        assert_ne!(old_pid, new_pid);

        let exit = ExitInfo {
            code: Some(0),
            signal: None,
        };
        h.supervisor.handle_exit("p10", 1, "aggregator", old_pid, exit).await;
        let entry = h.supervisor.registry().get_persisted_process(&key).unwrap().unwrap();
        assert_eq!(entry.pid, new_pid);
        assert_eq!(h.supervisor.get_process_status("p10").await, ProcessState::Running);

        h.supervisor.stop_dev_server("p10", true).await.unwrap();
        assert!(h.supervisor.registry().get_persisted_process(&key).unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_kills_process_that_ignores_term() {
        let h = harness(
            vec![service("aggregator", "sh -c \"trap '' TERM; sleep 30\"", false)],
            |s| s.stop_grace = Duration::from_millis(500),
        );
        h.supervisor.start_dev_server("p11", &h.project, &[]).await.unwrap();
        let key = registry_key("p11", "aggregator");
        let pid = h.supervisor.registry().get_persisted_process(&key).unwrap().unwrap().pid;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = Instant::now();
        h.supervisor.stop_dev_server("p11", true).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(!signal::is_process_alive(pid));
        assert_eq!(h.supervisor.get_process_status("p11").await, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn crash_ceiling_fires_once_and_window_expires() {
        let mut h = harness(
            vec![service("aggregator", "sh -c 'sleep 0.3; exit 1'", false)],
            |s| s.crash_window = Duration::from_secs(2),
        );
        let mut ceiling_errors = 0;
        let mut crash_counts = Vec::new();
        for round in 0..3 {
            if round == 0 {
                h.supervisor.start_dev_server("p12", &h.project, &[]).await.unwrap();
            } else {
                h.supervisor.restart_dev_server("p12", &h.project, &[]).await.unwrap();
            }
            loop {
                match next_event(&mut h.events, |e| {
                    matches!(e, Event::ProcessCrashed { .. } | Event::ProcessError { .. })
                })
                .await
                {
                    Event::ProcessCrashed { crash, .. } => {
                        crash_counts.push(crash.crash_count);
                        break;
                    }
                    Event::ProcessError { message, .. } => {
                        ceiling_errors += message.contains("crashed too many times") as usize;
                    }
                    _ => {}
                }
            }
        }
        while let Ok(event) = h.events.try_recv() {
            if let Event::ProcessError { message, .. } = event {
                ceiling_errors += message.contains("crashed too many times") as usize;
            }
        }
        assert_eq!(crash_counts, vec![1, 2, 3]);
        assert_eq!(ceiling_errors, 1);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        h.supervisor.restart_dev_server("p12", &h.project, &[]).await.unwrap();
        let crash = next_event(&mut h.events, |e| matches!(e, Event::ProcessCrashed { .. })).await;
        let Event::ProcessCrashed { crash, .. } = crash else { unreachable!() };
        assert_eq!(crash.crash_count, 1);
        h.supervisor.stop_dev_server("p12", true).await.unwrap();
    }

    #[tokio::test]
    async fn overlapping_health_checks_share_one_round() {
        let h = harness(
            vec![
                service("frontend", "sleep 30", true),
                service("backend", "sleep 30", false),
            ],
            |s| s.health_interval = Duration::from_secs(60),
        );
        let server =
            serve_role_when_allocated(h.supervisor.clone(), "p13", "frontend", Duration::ZERO).await;
        let services = vec!["frontend".to_string(), "backend".to_string()];
        h.supervisor.start_dev_server("p13", &h.project, &services).await.unwrap();

        let (a, b) = tokio::join!(
            h.supervisor.trigger_health_check("p13"),
            h.supervisor.trigger_health_check("p13"),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a["backend"].consecutive_failures, 1);
        assert_eq!(b["backend"].consecutive_failures, 1);
        assert_eq!(
            h.supervisor.get_health_status("p13").await["backend"].consecutive_failures,
            1
        );

        h.supervisor.stop_all().await;
        server.abort();
    }

    #[tokio::test]
    async fn long_lines_are_read_in_chunks() {
        let long = "x".repeat(MAX_LINE_BYTES as usize + 100);
        let input = format!("{}\nnext\n", long);
        let mut reader = input.as_bytes();
        let mut buf = Vec::new();

        assert_eq!(read_capped_line(&mut reader, &mut buf).await.unwrap(), MAX_LINE_BYTES as usize);
        assert!(!buf.ends_with(b"\n"));
        buf.clear();
        assert_eq!(read_capped_line(&mut reader, &mut buf).await.unwrap(), 101);
        buf.clear();
        read_capped_line(&mut reader, &mut buf).await.unwrap();
        assert_eq!(buf, b"next\n");
        buf.clear();
        assert_eq!(read_capped_line(&mut reader, &mut buf).await.unwrap(), 0);
    }
}

//! devrack: runs a project's dev servers and streams what they do.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, reclaims processes orphaned by an earlier session and
//! bridges supervisor events, stdin commands and OS signals for one project.

use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use devrack::config::{self, Config};
use devrack::process::ExitInfo;
use devrack::registry::CleanupReport;
use devrack::signal;
use devrack::{
    Event, OrchestratorResult, OrchestratorSettings, ProcessRegistry, ServiceCatalog, Supervisor,
};

const CONFIG_FILE: &str = "devrack.toml";
const DEFAULT_OUTPUT_LINES: usize = 50;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrack",
    version,
    about = "Runs and supervises per-project dev servers",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to devrack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any devrack.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a project's dev servers and stream their output.
    Run(RunArgs),
    /// Stop processes left running by a previous session.
    Cleanup {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List processes recorded in the registry.
    Ps {
        /// Print entries as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show version information.
    Version,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Project directory.
    project_path: PathBuf,
    /// Project identifier (defaults to the directory name).
    #[arg(long)]
    project_id: Option<String>,
    /// Service to run; repeat to run several side by side (default: aggregator).
    #[arg(long = "service", short = 's')]
    services: Vec<String>,
    /// Print events as JSON lines.
    #[arg(long)]
    json: bool,
    /// Skip the orphan cleanup at startup.
    #[arg(long)]
    no_cleanup: bool,
}

/// Input from outside the supervisor.
#[derive(Debug)]
enum Control {
    Input(String),
    Shutdown { signal: &'static str },
}

/// A stdin command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Restart,
    Status,
    Health,
    Output(usize),
    Quit,
    Help,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    if let Commands::Version = cli.command {
        println!("devrack {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = load_config_file(&cli)?;
    let settings = OrchestratorSettings::from_config(&config)?;
    match &cli.command {
        Commands::Run(args) => run(args, &config, settings).await,
        Commands::Cleanup { json } => {
            let registry = ProcessRegistry::new(settings.registry_path.clone());
            let report = registry.cleanup_stale_processes(settings.stop_grace).await?;
            print_cleanup_report(&report, *json)
        }
        Commands::Ps { json } => {
            let registry = ProcessRegistry::new(settings.registry_path.clone());
            print_registry(&registry, *json)
        }
        Commands::Version => Ok(()),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("DEVRACK_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config_file(cli: &Cli) -> Result<Config> {
    if cli.no_config {
        return Ok(Config::default());
    }
    match cli.config.clone().or_else(default_config_path) {
        Some(path) => config::load_config(&path),
        None => Ok(Config::default()),
    }
}

fn default_config_path() -> Option<PathBuf> {
    let path = Path::new(CONFIG_FILE);
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

async fn run(args: &RunArgs, config: &Config, settings: OrchestratorSettings) -> Result<()> {
    let project_path = args
        .project_path
        .canonicalize()
        .with_context(|| format!("project path {} not found", args.project_path.display()))?;
    let project_id = match &args.project_id {
        Some(id) => id.clone(),
        None => project_path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .context("cannot derive a project id from the path; pass --project-id")?,
    };

    let registry = ProcessRegistry::new(settings.registry_path.clone());
    if !args.no_cleanup {
        let report = registry.cleanup_stale_processes(settings.stop_grace).await?;
        if report.reclaimed() > 0 {
            info!(reclaimed = report.reclaimed(), "stopped processes left by a previous session");
        }
        if !report.kept.is_empty() {
            info!(kept = report.kept.len(), "left processes of another running devrack alone");
        }
    }

    let catalog = ServiceCatalog::from_config(&config.services)?;
    if let Some(unknown) = args.services.iter().find(|name| catalog.get(name).is_none()) {
        bail!(
            "unknown service {:?}; known services: {}",
            unknown,
            catalog.names().collect::<Vec<_>>().join(", ")
        );
    }
    let supervisor = Supervisor::new(settings, catalog, registry);
    let mut events = supervisor.subscribe();
    supervisor.set_current_project(Some(project_id.clone())).await;

    let (control_tx, mut control_rx) = mpsc::channel(32);
    spawn_signal_listener(control_tx.clone());
    spawn_stdin_listener(control_tx);

    let renderer = Renderer { json: args.json };
    let mut start = spawn_start(&supervisor, &project_id, &project_path, &args.services, false);
    let mut start_pending = true;

    loop {
        tokio::select! {
            result = &mut start, if start_pending => {
                start_pending = false;
                match result {
                    Ok(Ok(port)) => debug!(project_id = %project_id, port, "start finished"),
                    Ok(Err(err)) => renderer.note(&format!("start failed: {}", err)),
                    Err(err) => warn!(error = %err, "start task failed"),
                }
            }
            event = events.recv() => match event {
                Ok(event) if event.project_id() == project_id => renderer.render(&event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event renderer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            control = control_rx.recv() => match control {
                Some(Control::Input(line)) => match parse_command(&line) {
                    Some(Command::Quit) => break,
                    Some(Command::Restart) => {
                        renderer.note("restarting");
                        start = spawn_start(&supervisor, &project_id, &project_path, &args.services, true);
                        start_pending = true;
                    }
                    Some(command) => handle_command(command, &supervisor, &project_id, &renderer).await,
                    None => {}
                },
                Some(Control::Shutdown { signal }) => {
                    info!(signal, "shutting down");
                    break;
                }
                None => break,
            },
        }
    }

    supervisor.stop_all().await;
    while let Ok(event) = events.try_recv() {
        if event.project_id() == project_id {
            renderer.render(&event);
        }
    }
    Ok(())
}

/// Runs a start (or restart) in the background so events keep rendering meanwhile.
fn spawn_start(
    supervisor: &Supervisor,
    project_id: &str,
    project_path: &Path,
    services: &[String],
    restart: bool,
) -> JoinHandle<OrchestratorResult<u16>> {
    let supervisor = supervisor.clone();
    let project_id = project_id.to_string();
    let project_path = project_path.to_path_buf();
    let services = services.to_vec();
    tokio::spawn(async move {
        if restart {
            supervisor
                .restart_dev_server(&project_id, &project_path, &services)
                .await
        } else {
            supervisor
                .start_dev_server(&project_id, &project_path, &services)
                .await
        }
    })
}

fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    let command = match parts.next()? {
        "r" | "restart" => Command::Restart,
        "s" | "status" => Command::Status,
        "h" | "health" => Command::Health,
        "o" | "output" => {
            let limit = parts
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap_or(DEFAULT_OUTPUT_LINES);
            Command::Output(limit)
        }
        "q" | "quit" => Command::Quit,
        _ => Command::Help,
    };
    Some(command)
}

async fn handle_command(
    command: Command,
    supervisor: &Supervisor,
    project_id: &str,
    renderer: &Renderer,
) {
    match command {
        Command::Status => {
            let state = supervisor.get_process_status(project_id).await;
            let members = supervisor.get_member_states(project_id).await;
            let allocations = supervisor.get_port_allocations(project_id).await;
            renderer.note(&format!("{} is {}", project_id, state.label()));
            for (role, state) in members {
                let port = allocations
                    .iter()
                    .find(|a| a.role == role)
                    .map(|a| a.port.to_string())
                    .unwrap_or_else(|| "-".to_string());
                renderer.note(&format!("  {:<12} {:<9} port {}", role, state.label(), port));
            }
            if let Some(port) = supervisor.get_port(project_id).await {
                renderer.note(&format!("preview: http://localhost:{}", port));
            }
        }
        Command::Health => match supervisor.trigger_health_check(project_id).await {
            Some(statuses) => {
                let mut roles: Vec<_> = statuses.into_iter().collect();
                roles.sort_by(|a, b| a.0.cmp(&b.0));
                for (role, status) in roles {
                    renderer.note(&format!(
                        "  {:<12} {} (alive {:?}, http {:?}, port {:?})",
                        role,
                        if status.healthy { "healthy" } else { "unhealthy" },
                        status.process_alive,
                        status.http_responding,
                        status.port_allocated
                    ));
                }
            }
            None => renderer.note("not running; nothing to check"),
        },
        Command::Output(limit) => {
            for line in supervisor.get_process_output(project_id, Some(limit)).await {
                println!("{}", line.message);
            }
        }
        Command::Help => {
            renderer.note("commands: r restart, s status, h health, o [N] output, q quit");
        }
        Command::Restart | Command::Quit => {}
    }
}

/// Prints supervisor events, as text or JSON lines.
struct Renderer {
    json: bool,
}

impl Renderer {
    fn render(&self, event: &Event) {
        if self.json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{}", line),
                Err(err) => warn!(error = %err, "failed to serialize event"),
            }
            return;
        }
        match event {
            Event::ProcessOutput { line, .. } => println!("{}", line.message),
            Event::ProcessStatusChanged { project_id, state } => {
                self.note(&format!("{} is {}", project_id, state.label()));
            }
            Event::ProcessSpawned { role, pid, .. } => {
                self.note(&format!("{} started (pid {})", role, pid));
            }
            Event::ProcessReady { port, .. } => {
                self.note(&format!("ready: http://localhost:{}", port));
            }
            Event::ProcessError { message, .. } => {
                eprintln!("{}", format_tool_message(&format!("error: {}", message)));
            }
            Event::ProcessCrashed { crash, .. } => {
                let exit = ExitInfo {
                    code: crash.code,
                    signal: crash.signal,
                };
                self.note(&format!(
                    "{} crashed: {} (crash #{})",
                    crash.process_id,
                    exit.describe(),
                    crash.crash_count
                ));
            }
            Event::ProcessHealthChanged { status, .. } => {
                debug!(role = %status.role, healthy = status.healthy, "health checked");
            }
            Event::ProcessHealthCritical { status, .. } => {
                self.note(&format!(
                    "{} is unhealthy after {} failed checks",
                    status.role, status.consecutive_failures
                ));
            }
        }
    }

    fn note(&self, text: &str) {
        if self.json {
            #[derive(Serialize)]
            struct Note<'a> {
                event: &'static str,
                message: &'a str,
            }
            if let Ok(line) = serde_json::to_string(&Note {
                event: "note",
                message: text,
            }) {
                println!("{}", line);
            }
        } else {
            println!("{}", format_tool_message(text));
        }
    }
}

fn format_tool_message(text: &str) -> String {
    format!("[devrack] {}", text)
}

fn print_cleanup_report(report: &CleanupReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for key in &report.kept {
        println!("{:<32} kept, its devrack is still running", key);
    }
    if report.entries.is_empty() {
        if report.kept.is_empty() {
            println!("{}", format_tool_message("registry is empty; nothing to clean up"));
        }
        return Ok(());
    }
    for entry in &report.entries {
        println!(
            "{:<32} pid {:<8} port {:<6} {:?}",
            entry.key, entry.pid, entry.port, entry.outcome
        );
    }
    println!(
        "{}",
        format_tool_message(&format!(
            "{} of {} recorded processes were still running",
            report.reclaimed(),
            report.entries.len()
        ))
    );
    Ok(())
}

#[derive(Debug, Serialize)]
struct PsEntry {
    key: String,
    pid: u32,
    port: u16,
    owner: u32,
    alive: bool,
    started: String,
}

fn print_registry(registry: &ProcessRegistry, json: bool) -> Result<()> {
    let entries: Vec<PsEntry> = registry
        .get_all_persisted_processes()
        .with_context(|| format!("failed to read {}", registry.path().display()))?
        .into_iter()
        .map(|entry| PsEntry {
            alive: signal::is_process_alive(entry.pid),
            started: entry.timestamp.to_rfc3339(),
            key: entry.key,
            pid: entry.pid,
            port: entry.port,
            owner: entry.owner,
        })
        .collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("{}", format_tool_message("no recorded processes"));
        return Ok(());
    }
    for entry in entries {
        println!(
            "{:<32} pid {:<8} port {:<6} owner {:<8} {:<5} {}",
            entry.key,
            entry.pid,
            entry.port,
            entry.owner,
            if entry.alive { "alive" } else { "dead" },
            entry.started
        );
    }
    Ok(())
}

fn spawn_signal_listener(tx: mpsc::Sender<Control>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = tx.send(Control::Shutdown { signal: "SIGINT" }).await;
                }
                _ = sigterm.recv() => {
                    let _ = tx.send(Control::Shutdown { signal: "SIGTERM" }).await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx.send(Control::Shutdown { signal: "CTRL-C" }).await;
        }
    });
}

fn spawn_stdin_listener(tx: mpsc::Sender<Control>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.blocking_send(Control::Input(line)).is_err() {
                break;
            }
        }
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stdin_commands() {
        assert_eq!(parse_command("r"), Some(Command::Restart));
        assert_eq!(parse_command("  s "), Some(Command::Status));
        assert_eq!(parse_command("o 20"), Some(Command::Output(20)));
        assert_eq!(parse_command("o"), Some(Command::Output(DEFAULT_OUTPUT_LINES)));
        assert_eq!(parse_command("o lots"), Some(Command::Output(DEFAULT_OUTPUT_LINES)));
        assert_eq!(parse_command("q"), Some(Command::Quit));
        assert_eq!(parse_command("wat"), Some(Command::Help));
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn run_args_collect_services() {
        let cli = Cli::parse_from([
            "devrack", "run", "./app", "--service", "frontend", "-s", "backend", "--json",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.services, vec!["frontend", "backend"]);
        assert!(args.json);
        assert_eq!(args.project_path, PathBuf::from("./app"));
    }
}

//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use usb_safegate::cleanup::ledger::{CleanupEntry, load_ledger};
use usb_safegate::cleanup::scheduler::{CleanupScheduler, LedgerStatus, SweepReport};
use usb_safegate::collab::webdav::WebDavUploader;
use usb_safegate::core::config::{Config, MAX_RETENTION_DAYS};
use usb_safegate::daemon::service::run_daemon;
use usb_safegate::daemon::status::{ServicePhase, ServiceStatus, StatusReporter};
use usb_safegate::pipeline::collaborators::{UploadOutcome, Uploader};
use usb_safegate::platform::pal::{Device, detect_platform};

/// USB safe gateway: scan removable drives, upload clean files, mail a link.
#[derive(Debug, Parser)]
#[command(
    name = "safegate",
    author,
    version,
    about = "USB Safe Gateway - scan, upload and share removable media",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the gateway in the foreground until SIGTERM/SIGINT.
    Daemon,
    /// Show the status record written by the daemon.
    Status,
    /// List currently attached external storage devices.
    Devices,
    /// Inspect and administer the cleanup ledger.
    Cleanup(CleanupArgs),
    /// Self-test: configuration, platform, ledger and external commands.
    Check,
    /// Print the effective configuration as TOML.
    Config,
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct CleanupArgs {
    #[command(subcommand)]
    command: Option<CleanupCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CleanupCommand {
    /// List scheduled artifacts with days elapsed and remaining (default).
    List,
    /// Delete artifacts now: one by display name or remote id, or all.
    Run {
        /// Display name or remote identifier of a single entry.
        name: Option<String>,
    },
    /// Forget an entry without deleting anything.
    Remove {
        /// Display name or remote identifier.
        name: String,
    },
    /// Register an artifact that was uploaded outside the daemon.
    Add(AddArgs),
}

#[derive(Debug, Clone, Args)]
struct AddArgs {
    /// Local archive path.
    path: PathBuf,
    /// Remote identifier (e.g. `USB_Transfers/usb_transfer_20250101_120000.zip`).
    remote_id: String,
    /// Retention in days (defaults to `cleanup.retention_days`).
    #[arg(
        long,
        value_name = "DAYS",
        value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_RETENTION_DAYS))
    )]
    days: Option<u32>,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Target shell.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or refused operation.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl From<usb_safegate::core::errors::SafegateError> for CliError {
    fn from(err: usb_safegate::core::errors::SafegateError) -> Self {
        Self::Runtime(err.to_string())
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Daemon => run_daemon(load_config(cli)?).map_err(CliError::from),
        Command::Status => run_status(cli),
        Command::Devices => run_devices(cli),
        Command::Cleanup(args) => run_cleanup(cli, args),
        Command::Check => run_check(cli),
        Command::Config => run_config(cli),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    Config::load(cli.config.as_deref()).map_err(CliError::from)
}

// ──────────────────── status ────────────────────

fn run_status(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let path = &config.paths.status_file;
    let status = match StatusReporter::read_status(path) {
        Ok(status) => Some(status),
        Err(_) if !path.exists() => None,
        Err(e) => return Err(CliError::Runtime(e)),
    };

    match output_mode(cli) {
        OutputMode::Json => {
            let payload = status.as_ref().map_or_else(
                || json!({ "running": false, "status_file": path, "status": Value::Null }),
                |s| json!({ "running": s.writer_alive(), "status_file": path, "status": s }),
            );
            write_json_line(&payload)?;
        }
        OutputMode::Human => match &status {
            None => println!(
                "USB Safe Gateway: not running (no status record at {})",
                path.display()
            ),
            Some(status) => print_status_human(status),
        },
    }
    Ok(())
}

fn print_status_human(status: &ServiceStatus) {
    let state = if status.writer_alive() {
        format!("running (pid {})", status.pid).green().to_string()
    } else if status.phase == ServicePhase::Stopped {
        "stopped".normal().to_string()
    } else {
        format!("stale record (pid {} is gone)", status.pid).yellow().to_string()
    };
    println!("USB Safe Gateway v{}", status.version);
    println!("  Daemon:    {state}");
    println!("  Phase:     {}", phase_label(status.phase));
    println!("  Message:   {}", status.message);
    println!("  Processed: {}", status.processing_count);
    println!("  Started:   {}", status.started_at);
    println!("  Uptime:    {}", format_uptime(status.uptime_seconds));
    if let Some(last) = &status.last_activity {
        println!("  Activity:  {last}");
    }
    if !status.errors.is_empty() {
        println!("\nRecent errors:");
        for error in &status.errors {
            println!("  {}  {}", error.timestamp, error.message.red());
        }
    }
}

fn phase_label(phase: ServicePhase) -> String {
    let text = format!("{phase:?}").to_lowercase();
    match phase {
        ServicePhase::Success => text.green().to_string(),
        ServicePhase::Warning => text.yellow().to_string(),
        ServicePhase::Error => text.red().bold().to_string(),
        ServicePhase::Scanning | ServicePhase::Uploading | ServicePhase::Processing => {
            text.cyan().to_string()
        }
        ServicePhase::Idle | ServicePhase::Stopped => text,
    }
}

// ──────────────────── devices ────────────────────

fn run_devices(cli: &Cli) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let platform = detect_platform(&config.monitor.external_transports)?;
    let devices = platform.external_devices()?;

    match output_mode(cli) {
        OutputMode::Json => write_json_line(&json!({ "devices": devices }))?,
        OutputMode::Human => print_devices_human(&devices),
    }
    Ok(())
}

fn print_devices_human(devices: &[Device]) {
    if devices.is_empty() {
        println!("No external storage devices mounted.");
        return;
    }
    println!(
        "  {:<14}  {:<20}  {:>10}  {:<8}  {}",
        "Device", "Label", "Capacity", "Bus", "Mounted at"
    );
    println!("  {}", "-".repeat(72));
    for device in devices {
        println!(
            "  {:<14}  {:<20}  {:>10}  {:<8}  {}",
            device.path.display(),
            device.label,
            device.capacity,
            device.transport,
            device
                .mount_point
                .as_ref()
                .map_or_else(|| "-".to_string(), |p| p.display().to_string()),
        );
    }
}

// ──────────────────── cleanup ────────────────────

/// Stand-in remote used by ledger commands that never delete.
struct DetachedRemote;

impl Uploader for DetachedRemote {
    fn upload(&self, _path: &Path) -> UploadOutcome {
        UploadOutcome::Failed {
            reason: "no upload server configured".to_string(),
        }
    }

    fn create_public_link(&self, _remote_id: &str) -> Option<String> {
        None
    }

    fn delete(&self, _remote_id: &str) -> bool {
        false
    }
}

fn open_scheduler(config: &Config, remote: Arc<dyn Uploader>) -> CleanupScheduler {
    CleanupScheduler::open(
        config.paths.ledger_file.clone(),
        config.cleanup.retention_days,
        remote,
        None,
    )
}

/// Ledger mutations race the daemon's own writes; refuse while it runs.
fn ensure_daemon_stopped(config: &Config) -> Result<(), CliError> {
    match StatusReporter::read_status(&config.paths.status_file) {
        Ok(status) if status.writer_alive() => Err(CliError::User(format!(
            "the daemon (pid {}) owns the cleanup ledger; stop it first, or send it SIGUSR1 to request a sweep",
            status.pid
        ))),
        _ => Ok(()),
    }
}

fn run_cleanup(cli: &Cli, args: &CleanupArgs) -> Result<(), CliError> {
    let config = load_config(cli)?;
    let mode = output_mode(cli);

    match args.command.as_ref().unwrap_or(&CleanupCommand::List) {
        CleanupCommand::List => {
            let scheduler = open_scheduler(&config, Arc::new(DetachedRemote));
            let status = scheduler.status();
            match mode {
                OutputMode::Json => write_json_line(&serde_json::to_value(&status)?)?,
                OutputMode::Human => print_ledger_human(&status, scheduler.ledger_path()),
            }
        }
        CleanupCommand::Run { name } => {
            ensure_daemon_stopped(&config)?;
            let remote = Arc::new(WebDavUploader::new(&config.upload)?);
            let scheduler = open_scheduler(&config, remote);
            if let Some(name) = name {
                if !scheduler.entries().iter().any(|e| e.matches(name)) {
                    return Err(CliError::User(format!("no scheduled artifact named {name:?}")));
                }
            }
            let report = scheduler.force_cleanup(name.as_deref());
            emit_sweep_report(mode, &report)?;
            if report.failed > 0 {
                return Err(CliError::Runtime(format!(
                    "{} of {} deletions failed; the entries stay scheduled",
                    report.failed, report.due
                )));
            }
        }
        CleanupCommand::Remove { name } => {
            ensure_daemon_stopped(&config)?;
            let scheduler = open_scheduler(&config, Arc::new(DetachedRemote));
            if !scheduler.remove_from_schedule(name) {
                return Err(CliError::User(format!("no scheduled artifact named {name:?}")));
            }
            match mode {
                OutputMode::Json => write_json_line(&json!({ "removed": name }))?,
                OutputMode::Human => println!("Removed {name} from the cleanup schedule."),
            }
        }
        CleanupCommand::Add(add) => {
            ensure_daemon_stopped(&config)?;
            let scheduler = open_scheduler(&config, Arc::new(DetachedRemote));
            let days = add.days.unwrap_or(config.cleanup.retention_days);
            let entry = scheduler.add_manual_cleanup(&add.path, &add.remote_id, days);
            emit_added(mode, &entry)?;
        }
    }
    Ok(())
}

fn print_ledger_human(status: &LedgerStatus, ledger: &Path) {
    println!("Cleanup ledger: {}", ledger.display());
    println!(
        "  {} scheduled, {} pending, {} expired",
        status.total_scheduled, status.pending, status.expired
    );
    if status.entries.is_empty() {
        return;
    }
    println!();
    println!(
        "  {:<40}  {:>7}  {:>9}  {}",
        "Artifact", "Elapsed", "Remaining", "Remote"
    );
    println!("  {}", "-".repeat(80));
    for entry in &status.entries {
        let remaining = if entry.days_remaining <= 0 {
            "due".yellow().to_string()
        } else {
            format!("{}d", entry.days_remaining)
        };
        println!(
            "  {:<40}  {:>6}d  {:>9}  {}",
            entry.display_name, entry.days_elapsed, remaining, entry.remote_id
        );
    }
}

fn emit_sweep_report(mode: OutputMode, report: &SweepReport) -> Result<(), CliError> {
    match mode {
        OutputMode::Json => write_json_line(&serde_json::to_value(report)?)?,
        OutputMode::Human => {
            println!(
                "Cleanup: {} examined, {} deleted, {} failed",
                report.examined, report.deleted, report.failed
            );
        }
    }
    Ok(())
}

fn emit_added(mode: OutputMode, entry: &CleanupEntry) -> Result<(), CliError> {
    match mode {
        OutputMode::Json => write_json_line(&json!({
            "added": entry.display_name,
            "remote_id": entry.remote_id,
            "retention_days": entry.retention_days,
            "due_at": entry.due_at().to_rfc3339(),
        }))?,
        OutputMode::Human => println!(
            "Scheduled {} for deletion in {} days ({}).",
            entry.display_name,
            entry.retention_days,
            entry.due_at().format("%Y-%m-%d %H:%M UTC")
        ),
    }
    Ok(())
}

// ──────────────────── check ────────────────────

#[derive(Debug, Serialize)]
struct CheckResult {
    name: &'static str,
    ok: bool,
    /// Advisory checks never fail the command.
    required: bool,
    detail: String,
}

impl CheckResult {
    fn new(name: &'static str, required: bool, outcome: Result<String, String>) -> Self {
        let (ok, detail) = match outcome {
            Ok(detail) => (true, detail),
            Err(detail) => (false, detail),
        };
        Self {
            name,
            ok,
            required,
            detail,
        }
    }
}

fn run_check(cli: &Cli) -> Result<(), CliError> {
    let mut results = Vec::new();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => {
            results.push(CheckResult::new(
                "config",
                true,
                Ok(format!("{} valid", config.paths.config_file.display())),
            ));
            config
        }
        Err(e) => {
            results.push(CheckResult::new("config", true, Err(e.to_string())));
            return finish_check(cli, &results);
        }
    };

    results.push(CheckResult::new(
        "platform",
        true,
        detect_platform(&config.monitor.external_transports)
            .and_then(|p| p.external_devices())
            .map(|devices| format!("{} external device(s) visible", devices.len()))
            .map_err(|e| e.to_string()),
    ));
    results.push(CheckResult::new(
        "ledger",
        true,
        load_ledger(&config.paths.ledger_file)
            .map(|outcome| {
                format!(
                    "{} entries, {} unreadable",
                    outcome.entries.len(),
                    outcome.dropped
                )
            })
            .map_err(|e| e.to_string()),
    ));
    results.push(CheckResult::new(
        "upload",
        true,
        WebDavUploader::new(&config.upload)
            .map(|_| config.upload.base_url.clone())
            .map_err(|e| e.to_string()),
    ));
    results.push(command_check("scanner", &config.scanner.command));
    results.push(command_check("curl", "curl"));
    results.push(command_check(
        "sendmail",
        &config.notify.sendmail_command.to_string_lossy(),
    ));
    results.push(CheckResult::new(
        "recipient",
        false,
        config
            .recipient()
            .map(ToString::to_string)
            .ok_or_else(|| "no recipient configured; uploads will not be announced".to_string()),
    ));
    finish_check(cli, &results)
}

fn command_check(name: &'static str, command: &str) -> CheckResult {
    CheckResult::new(
        name,
        true,
        find_command(command)
            .map(|path| path.display().to_string())
            .ok_or_else(|| format!("{command} not found")),
    )
}

/// Resolve `command` the way `Command::new` would: as given when it contains
/// a separator, otherwise through `PATH`.
fn find_command(command: &str) -> Option<PathBuf> {
    if command.is_empty() {
        return None;
    }
    if command.contains('/') {
        let path = PathBuf::from(command);
        return path.is_file().then_some(path);
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
}

fn finish_check(cli: &Cli, results: &[CheckResult]) -> Result<(), CliError> {
    let failed = results.iter().filter(|r| r.required && !r.ok).count();
    match output_mode(cli) {
        OutputMode::Json => write_json_line(&json!({
            "ok": failed == 0,
            "checked_at": Utc::now().to_rfc3339(),
            "checks": results,
        }))?,
        OutputMode::Human => {
            for result in results {
                let mark = match (result.ok, result.required) {
                    (true, _) => "ok".green(),
                    (false, true) => "FAIL".red().bold(),
                    (false, false) => "warn".yellow(),
                };
                println!("  [{mark:>4}] {:<10} {}", result.name, result.detail);
            }
        }
    }
    if failed > 0 {
        return Err(CliError::Runtime(format!("{failed} check(s) failed")));
    }
    Ok(())
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli) -> Result<(), CliError> {
    let mut config = load_config(cli)?;
    if !config.upload.password.is_empty() {
        config.upload.password = "********".to_string();
    }
    match output_mode(cli) {
        OutputMode::Json => write_json_line(&serde_json::to_value(&config)?)?,
        OutputMode::Human => {
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| CliError::Runtime(format!("failed to render config: {e}")))?;
            print!("{rendered}");
        }
    }
    Ok(())
}

// ──────────────────── output ────────────────────

fn format_uptime(seconds: u64) -> String {
    let (days, rem) = (seconds / 86_400, seconds % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let minutes = rem / 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m {}s", rem % 60)
    }
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("SG_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use ticket_dispatch::config::{self, CONFIG_FILE_NAME};
use ticket_dispatch::launcher::{
    install_signal_handlers, is_shutdown_requested, kill_all_children, CommandSessionLauncher,
    SessionLauncher,
};
use ticket_dispatch::lock::{self, StoreLock};
use ticket_dispatch::log::parse_log_level;
use ticket_dispatch::orchestrator::DispatchEvent;
use ticket_dispatch::service::Dispatcher;
use ticket_dispatch::store::{self, CsvTicketStore};
use ticket_dispatch::tickets;
use ticket_dispatch::types::{parse_role, Role, Ticket, TicketStatus};
use ticket_dispatch::{log_debug, log_info, log_warn};

/// How often the run loop checks the signal flag.
const SHUTDOWN_POLL_MS: u64 = 200;

/// How often the run loop logs the active sessions.
const ACTIVE_REPORT_SECS: u64 = 60;

const TICKETS_HEADER: &str = "id,title,status,role,assignee,dependencies\n";

#[derive(Parser)]
#[command(
    name = "ticket-dispatch",
    about = "Dispatch agent sessions for tickets as they become eligible"
)]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/ticket-dispatch.toml).
    /// When specified, relative store paths resolve from the config file's
    /// parent directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and an empty ticket store
    Init,
    /// Watch the ticket store and dispatch sessions until interrupted
    Run,
    /// Show tickets with their resolved role and eligibility
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Validate config, ticket store, and launcher availability
    Check,
    /// Launch a session for one ticket now, bypassing queue and cooldowns
    Launch {
        /// Ticket ID to launch
        ticket_id: String,
        /// Role to launch as (swe, qa, pm, docs)
        #[arg(long)]
        role: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => ticket_dispatch::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let root = &cli.root;
    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Commands::Init => handle_init(root),
        Commands::Run => handle_run(root, config_path).await,
        Commands::Status { json } => handle_status(root, config_path, json),
        Commands::Check => handle_check(root, config_path),
        Commands::Launch { ticket_id, role } => {
            handle_launch(root, config_path, &ticket_id, role).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn handle_init(root: &Path) -> Result<(), String> {
    let mut created = Vec::new();

    let config_path = root.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        fs::write(&config_path, DEFAULT_CONFIG)
            .map_err(|e| format!("Failed to write {}: {}", config_path.display(), e))?;
        created.push(CONFIG_FILE_NAME);
    }

    let tickets_path = root.join("tickets.csv");
    if !tickets_path.exists() {
        fs::write(&tickets_path, TICKETS_HEADER)
            .map_err(|e| format!("Failed to write {}: {}", tickets_path.display(), e))?;
        created.push("tickets.csv");
    }

    // Append the runtime dir to .gitignore if not already present
    let gitignore_path = root.join(".gitignore");
    let gitignore_entry = format!("{}/", lock::RUNTIME_DIR);
    let existing_gitignore = if gitignore_path.exists() {
        fs::read_to_string(&gitignore_path)
            .map_err(|e| format!("Failed to read .gitignore: {}", e))?
    } else {
        String::new()
    };

    let has_entry = existing_gitignore
        .lines()
        .any(|line| line.trim() == gitignore_entry);

    if !has_entry {
        let mut contents = existing_gitignore;
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(&gitignore_entry);
        contents.push('\n');

        fs::write(&gitignore_path, contents)
            .map_err(|e| format!("Failed to write .gitignore: {}", e))?;
    }

    println!("Initialized ticket-dispatch in {}", root.display());
    if created.is_empty() {
        println!("  Config and ticket store already present");
    } else {
        println!("  Created: {}", created.join(", "));
    }
    if !has_entry {
        println!("  Updated: .gitignore");
    }

    Ok(())
}

async fn handle_run(root: &Path, config_path: Option<&Path>) -> Result<(), String> {
    install_signal_handlers()?;

    log_info!("--- ticket-dispatch ---");

    let config = config::load_config_from(config_path, root)?;
    let base = config::base_dir(config_path, root);
    let store_path = store::locate_store(&config.store, &base)?;
    log_info!("[pre] Ticket store: {}", store_path.display());

    log_info!("[pre] Acquiring store lock...");
    let _lock = StoreLock::acquire(&store_path)?;

    let launcher = CommandSessionLauncher::new(config.launcher.clone(), root);
    log_info!("[pre] Verifying launch commands...");
    let availability = launcher.verify_commands();
    for command in &availability {
        if !command.available {
            log_warn!(
                "[pre] {} ({}) not found on PATH{}",
                command.name,
                command.program,
                command
                    .install_hint
                    .as_deref()
                    .map(|h| format!(". {}", h))
                    .unwrap_or_default()
            );
        }
    }
    if !availability.iter().any(|c| c.available) {
        log_warn!("[pre] No launch command is available; every launch will fail");
    }

    log_info!(
        "[config] max_concurrent={}, cooldown={}s, dispatch_delay={}ms, poll={}s, watch={}",
        config.orchestrator.max_concurrent,
        config.orchestrator.cooldown_secs,
        config.orchestrator.dispatch_delay_ms,
        config.monitor.poll_interval_secs,
        config.monitor.watch
    );

    let source = Arc::new(CsvTicketStore::new(store_path));
    let mut dispatcher = Dispatcher::new(config, source, Arc::new(launcher));
    let mut events = dispatcher.subscribe();
    dispatcher.start()?;

    let mut shutdown_poll = tokio::time::interval(Duration::from_millis(SHUTDOWN_POLL_MS));
    let mut report = tokio::time::interval(Duration::from_secs(ACTIVE_REPORT_SECS));
    report.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => {
                    log_warn!("Missed {} dispatcher event(s)", missed)
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown_poll.tick() => {
                if is_shutdown_requested() {
                    log_info!("Shutdown requested, stopping...");
                    break;
                }
            }
            _ = report.tick() => report_active(&dispatcher).await,
        }
    }

    // Launch processes are reaped even when the dispatcher failed to stop cleanly
    let stopped = dispatcher.stop().await;
    let cleanup = tokio::task::spawn_blocking(kill_all_children).await;
    stopped?;
    cleanup.map_err(|e| format!("Failed to clean up launch processes: {}", e))?;

    Ok(())
}

fn log_event(event: &DispatchEvent) {
    match event {
        DispatchEvent::Started => log_debug!("[dispatch] started"),
        DispatchEvent::Stopped => log_debug!("[dispatch] stopped"),
        // Already logged where it was raised
        DispatchEvent::Error(msg) => log_debug!("[dispatch] error: {}", msg),
        DispatchEvent::SessionLaunched { ticket_id, role } => {
            log_debug!("[dispatch] session launched: {}:{}", role, ticket_id)
        }
        DispatchEvent::SessionCompleted { ticket_id, role } => {
            log_debug!("[dispatch] session completed: {}:{}", role, ticket_id)
        }
    }
}

async fn report_active(dispatcher: &Dispatcher<CsvTicketStore, CommandSessionLauncher>) {
    match dispatcher.active_sessions().await {
        Ok(sessions) if sessions.is_empty() => log_debug!("[session] No active sessions"),
        Ok(sessions) => {
            let summary: Vec<String> = sessions
                .iter()
                .map(|s| format!("{}:{} ({})", s.role, s.ticket_id, format_elapsed(s.elapsed)))
                .collect();
            log_info!("[session] Active: {}", summary.join(", "));
        }
        Err(e) => log_warn!("[session] Could not query active sessions: {}", e),
    }
}

#[derive(Serialize)]
struct StatusRow<'a> {
    id: &'a str,
    status: &'a TicketStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<Role>,
    eligibility: String,
    title: &'a str,
}

fn handle_status(root: &Path, config_path: Option<&Path>, json: bool) -> Result<(), String> {
    let config = config::load_config_from(config_path, root)?;
    let base = config::base_dir(config_path, root);
    let store_path = store::locate_store(&config.store, &base)?;
    let all = store::load_tickets_blocking(&store_path)?;

    let rows: Vec<StatusRow> = all
        .iter()
        .map(|t| StatusRow {
            id: &t.id,
            status: &t.status,
            role: t.work_role(),
            eligibility: eligibility(t, &all),
            title: &t.title,
        })
        .collect();

    if json {
        let out = serde_json::to_string_pretty(&rows)
            .map_err(|e| format!("Failed to serialize status: {}", e))?;
        println!("{}", out);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No tickets in {}.", store_path.display());
        return Ok(());
    }

    println!(
        "{:<10} {:<12} {:<6} {:<28} TITLE",
        "ID", "STATUS", "ROLE", "ELIGIBILITY"
    );
    println!("{}", "-".repeat(90));

    for row in &rows {
        let role = row.role.map(Role::as_str).unwrap_or("?");
        println!(
            "{:<10} {:<12} {:<6} {:<28} {}",
            row.id,
            row.status.as_str(),
            role,
            truncate_title(&row.eligibility, 28),
            truncate_title(row.title, 36)
        );
    }

    let eligible = rows
        .iter()
        .filter(|r| r.eligibility.starts_with("eligible"))
        .count();
    println!("\n{} ticket(s) total, {} eligible", rows.len(), eligible);

    Ok(())
}

fn eligibility(ticket: &Ticket, all: &[Ticket]) -> String {
    match ticket.eligible_role() {
        Some(role) => match tickets::unmet_dep_summary(ticket, all) {
            None => format!("eligible ({})", role),
            Some(summary) => format!("waiting: {}", summary),
        },
        None if ticket.status == TicketStatus::Todo => {
            format!("invalid role '{}'", ticket.role)
        }
        None => "-".to_string(),
    }
}

fn handle_check(root: &Path, config_path: Option<&Path>) -> Result<(), String> {
    let config = config::load_config_from(config_path, root)?;
    println!("[ok]   Config");

    let base = config::base_dir(config_path, root);
    let store_path = store::locate_store(&config.store, &base)?;
    let all = store::load_tickets_blocking(&store_path)?;
    println!(
        "[ok]   Ticket store {} ({} ticket(s))",
        store_path.display(),
        all.len()
    );

    let ids: HashSet<&str> = all.iter().map(|t| t.id.as_str()).collect();
    for ticket in &all {
        for dep in ticket.dependencies.iter().filter(|d| !ids.contains(d.as_str())) {
            println!("[warn] {} depends on missing ticket {}", ticket.id, dep);
        }
        if ticket.work_role().is_none() {
            println!(
                "[warn] {} has unrecognized role '{}'",
                ticket.id, ticket.role
            );
        }
    }

    let launcher = CommandSessionLauncher::new(config.launcher, root);
    for command in launcher.verify_commands() {
        if command.available {
            println!("[ok]   Launcher {} ({})", command.name, command.program);
        } else {
            let hint = command
                .install_hint
                .map(|h| format!(": {}", h))
                .unwrap_or_default();
            println!(
                "[warn] Launcher {} ({}) not on PATH{}",
                command.name, command.program, hint
            );
        }
    }

    Ok(())
}

async fn handle_launch(
    root: &Path,
    config_path: Option<&Path>,
    ticket_id: &str,
    role: Option<String>,
) -> Result<(), String> {
    let config = config::load_config_from(config_path, root)?;
    let base = config::base_dir(config_path, root);
    let store_path = store::locate_store(&config.store, &base)?;
    let all = store::load_tickets_blocking(&store_path)?;

    let ticket = all
        .iter()
        .find(|t| t.id == ticket_id)
        .ok_or_else(|| format!("Ticket {} not found in {}", ticket_id, store_path.display()))?;

    let role = match role {
        Some(raw) => parse_role(&raw)?,
        None => ticket
            .eligible_role()
            .or_else(|| ticket.work_role())
            .ok_or_else(|| {
                format!(
                    "Ticket {} has unrecognized role '{}'; pass --role",
                    ticket.id, ticket.role
                )
            })?,
    };

    install_signal_handlers()?;
    let launcher = CommandSessionLauncher::new(config.launcher, root);
    let handle = launcher.launch(ticket, role).await?;

    println!(
        "Launched {} session for {} via {} ({})",
        role, ticket.id, handle.method, handle.id
    );
    Ok(())
}

// --- Display helpers ---

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Truncate a title for display, respecting UTF-8 character boundaries.
fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        return title.to_string();
    }
    let truncated: String = title.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", truncated)
}

const DEFAULT_CONFIG: &str = r#"[store]
path = "tickets.csv"
fallback_path = ".cursor/tickets.csv"

[monitor]
poll_interval_secs = 10
debounce_ms = 500
watch = true

[orchestrator]
max_concurrent = 2
cooldown_secs = 300        # also the fallback timeout for sessions that never report back
dispatch_delay_ms = 2000
restart_settle_ms = 500
close_sessions = false

[launcher]
timeout_secs = 5
# model = "claude-3.5-sonnet"
# workspace = "."

# [launcher.prompts]
# swe = "run swe agent on {ticket_id}"
# qa = "Use @.cursor/rules/qa-agent.mdc to review {ticket_id}"

# Launch methods are tried in order; the first to succeed wins.
[[launcher.commands]]
name = "cursor-agent"
program = "cursor-agent"
args = ["-p", "{prompt}"]
model_args = ["-m", "{model}"]
requires_prompt = true

[[launcher.commands]]
name = "cursor"
program = "cursor"
args = ["{workspace}"]
"#;

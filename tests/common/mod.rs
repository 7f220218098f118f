#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ticket_dispatch::config::{DispatchConfig, MonitorConfig, OrchestratorConfig};
use ticket_dispatch::types::{Ticket, TicketStatus};

/// Creates a `Ticket` with minimal defaults.
///
/// The title is auto-generated as `"Test ticket {id}"`; role, assignee and
/// dependencies are empty, so the ticket resolves to the `swe` role.
pub fn make_ticket(id: &str, status: TicketStatus) -> Ticket {
    Ticket {
        title: format!("Test ticket {}", id),
        ..Ticket::new(id, status)
    }
}

pub fn make_ticket_with_deps(id: &str, status: TicketStatus, deps: &[&str]) -> Ticket {
    let mut ticket = make_ticket(id, status);
    ticket.dependencies = deps.iter().map(|d| d.to_string()).collect();
    ticket
}

pub fn make_ticket_with_role(id: &str, status: TicketStatus, role: &str) -> Ticket {
    let mut ticket = make_ticket(id, status);
    ticket.role = role.to_string();
    ticket
}

/// Orchestrator settings for paused-clock tests.
///
/// Cooldown is an hour so it never expires unless a test advances the
/// clock on purpose; the dispatch and settle delays are short.
pub fn test_orchestrator_config(max_concurrent: u32) -> OrchestratorConfig {
    OrchestratorConfig {
        max_concurrent,
        cooldown_secs: 3600,
        dispatch_delay_ms: 10,
        restart_settle_ms: 10,
        close_sessions: false,
    }
}

pub fn test_config(max_concurrent: u32) -> DispatchConfig {
    DispatchConfig {
        orchestrator: test_orchestrator_config(max_concurrent),
        monitor: MonitorConfig {
            poll_interval_secs: 1,
            debounce_ms: 10,
            watch: false,
        },
        ..Default::default()
    }
}

/// Let spawned work, drain steps and short delays run to completion.
///
/// With a paused clock the runtime auto-advances, so this returns once every
/// task is idle and a second has passed on the virtual clock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}

/// Writes a ticket store CSV into `dir` and returns its path.
pub fn write_store(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create store dir");
    }
    fs::write(&path, contents).expect("Failed to write ticket store");
    path
}

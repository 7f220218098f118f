use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::MonitorConfig;
use crate::error::DispatchError;
use crate::orchestrator::{DispatchEvent, OrchestratorHandle};
use crate::store::TicketSource;
use crate::tickets;
use crate::types::{Role, SessionKey, Ticket, TicketStatus};
use crate::{log_debug, log_error, log_info, log_warn};

/// Why a ticket became eligible in this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EligibleReason {
    /// First time seen in an eligible state.
    New,
    /// Status changed back into an eligible status while still marked processed.
    Reentered,
    /// Was waiting on dependencies that are now all completed.
    DependenciesMet,
    /// Re-emitted because a dependency just reached completed.
    Cascade,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Eligible {
        ticket: Ticket,
        role: Role,
        reason: EligibleReason,
    },
    /// The session working `role` on this ticket appears to be done.
    RoleCompleted {
        ticket: Ticket,
        role: Role,
        from: TicketStatus,
        to: TicketStatus,
    },
    /// Ticket returned to todo for rework.
    SentBack { ticket: Ticket, from: TicketStatus },
}

#[derive(Debug, Clone)]
struct Observed {
    status: TicketStatus,
    deps_satisfied: bool,
}

/// Diffs successive ticket snapshots into events.
///
/// Pure state machine; `run_monitor` feeds it from the store.
#[derive(Debug, Default)]
pub struct ChangeMonitor {
    previous: Option<HashMap<String, Observed>>,
    processed: HashSet<SessionKey>,
    reported_missing: HashSet<(String, String)>,
}

impl ChangeMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `(role, ticket)` is currently marked as already emitted.
    pub fn is_processed(&self, key: &SessionKey) -> bool {
        self.processed.contains(key)
    }

    /// Process one full snapshot and return this pass's events.
    ///
    /// Order within the batch: todo eligibility, in_review eligibility, then
    /// completion, rework and cascade detections. Each `(role, ticket)` key
    /// appears at most once as `Eligible`.
    pub fn process(&mut self, tickets: &[Ticket]) -> Vec<MonitorEvent> {
        let index = tickets::status_index(tickets);
        let satisfied: HashMap<&str, bool> = tickets
            .iter()
            .map(|t| (t.id.as_str(), tickets::satisfied_in(t, &index)))
            .collect();

        self.warn_missing_dependencies(tickets);

        let mut events = Vec::new();
        let mut emitted = HashSet::new();

        for status in [TicketStatus::Todo, TicketStatus::InReview] {
            for ticket in tickets.iter().filter(|t| t.status == status) {
                let Some(role) = ticket.eligible_role() else {
                    log_debug!(
                        "[monitor] {} has unrecognized role '{}', not dispatchable",
                        ticket.id,
                        ticket.role
                    );
                    continue;
                };
                if !satisfied.get(ticket.id.as_str()).copied().unwrap_or(false) {
                    continue;
                }

                let key = SessionKey::new(role, &ticket.id);
                let prev = self.previous.as_ref().and_then(|p| p.get(&ticket.id));
                let waited = prev.is_some_and(|p| !p.deps_satisfied);

                let reason = if !self.processed.contains(&key) {
                    Some(if waited {
                        EligibleReason::DependenciesMet
                    } else {
                        EligibleReason::New
                    })
                } else if prev.is_some_and(|p| p.status != ticket.status) {
                    Some(EligibleReason::Reentered)
                } else if waited {
                    Some(EligibleReason::DependenciesMet)
                } else {
                    None
                };

                if let Some(reason) = reason {
                    self.processed.insert(key.clone());
                    if emitted.insert(key) {
                        events.push(MonitorEvent::Eligible {
                            ticket: ticket.clone(),
                            role,
                            reason,
                        });
                    }
                }
            }
        }

        let mut cascade_roots: Vec<&str> = Vec::new();
        if let Some(previous) = &self.previous {
            for ticket in tickets {
                let Some(prev) = previous.get(&ticket.id) else {
                    log_debug!("[monitor] New ticket {} ({})", ticket.id, ticket.status);
                    continue;
                };
                if prev.status == ticket.status {
                    continue;
                }

                let from = prev.status.clone();
                let to = ticket.status.clone();
                log_debug!("[monitor] {}: {} -> {}", ticket.id, from, to);

                let finished = matches!(
                    to,
                    TicketStatus::Completed | TicketStatus::Blocked | TicketStatus::Cancelled
                );
                let completed_role = match from {
                    TicketStatus::Todo | TicketStatus::InProgress
                        if finished || to == TicketStatus::InReview =>
                    {
                        ticket.work_role()
                    }
                    TicketStatus::InReview if finished => Some(Role::Qa),
                    _ => None,
                };
                if let Some(role) = completed_role {
                    events.push(MonitorEvent::RoleCompleted {
                        ticket: ticket.clone(),
                        role,
                        from: from.clone(),
                        to: to.clone(),
                    });
                }

                if to == TicketStatus::Todo {
                    events.push(MonitorEvent::SentBack {
                        ticket: ticket.clone(),
                        from,
                    });
                }

                if to == TicketStatus::Completed {
                    cascade_roots.push(ticket.id.as_str());
                }
            }

            for id in previous.keys() {
                if !index.contains_key(id.as_str()) {
                    log_info!("[monitor] Ticket {} was removed from the store", id);
                }
            }
        }

        for root in cascade_roots {
            self.cascade(root, tickets, &satisfied, &mut emitted, &mut events);
        }

        // Drop markers for keys no longer in an eligible status so a later return is "new"
        let eligible_now: HashSet<SessionKey> = tickets
            .iter()
            .filter_map(|t| t.eligible_role().map(|role| SessionKey::new(role, &t.id)))
            .collect();
        self.processed.retain(|key| eligible_now.contains(key));

        self.previous = Some(
            tickets
                .iter()
                .map(|t| {
                    (
                        t.id.clone(),
                        Observed {
                            status: t.status.clone(),
                            deps_satisfied: satisfied.get(t.id.as_str()).copied().unwrap_or(false),
                        },
                    )
                })
                .collect(),
        );

        events
    }

    /// Force-emit dependents of `completed_id` that are now fully unblocked.
    fn cascade(
        &mut self,
        completed_id: &str,
        tickets: &[Ticket],
        satisfied: &HashMap<&str, bool>,
        emitted: &mut HashSet<SessionKey>,
        events: &mut Vec<MonitorEvent>,
    ) {
        let dependents = tickets.iter().filter(|t| {
            matches!(t.status, TicketStatus::Todo | TicketStatus::InReview)
                && t.dependencies.iter().any(|d| d == completed_id)
                && satisfied.get(t.id.as_str()).copied().unwrap_or(false)
        });

        for dependent in dependents {
            let Some(role) = dependent.eligible_role() else {
                continue;
            };
            let key = SessionKey::new(role, &dependent.id);
            self.processed.insert(key.clone());
            if emitted.insert(key) {
                log_info!(
                    "[monitor] {} unblocked by {} completing",
                    dependent.id,
                    completed_id
                );
                events.push(MonitorEvent::Eligible {
                    ticket: dependent.clone(),
                    role,
                    reason: EligibleReason::Cascade,
                });
            }
        }
    }

    fn warn_missing_dependencies(&mut self, tickets: &[Ticket]) {
        let ids: HashSet<&str> = tickets.iter().map(|t| t.id.as_str()).collect();
        let mut still_missing = HashSet::new();

        for ticket in tickets {
            for dep in &ticket.dependencies {
                if ids.contains(dep.as_str()) {
                    continue;
                }
                let pair = (ticket.id.clone(), dep.clone());
                if !self.reported_missing.contains(&pair) {
                    log_warn!(
                        "[monitor] {} depends on unknown ticket {}, it stays ineligible until that id exists",
                        ticket.id,
                        dep
                    );
                }
                still_missing.insert(pair);
            }
        }

        self.reported_missing = still_missing;
    }
}

// --- Watch / poll task ---

/// Watch the store's parent directory and signal on changes to the store file.
///
/// Editors often replace files instead of writing in place, so the directory
/// is watched rather than the file itself.
pub fn watch_store(path: &Path, tx: mpsc::Sender<()>) -> Result<RecommendedWatcher, DispatchError> {
    let file_name: Option<OsString> = path.file_name().map(|n| n.to_os_string());
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let Ok(event) = res else {
            return;
        };
        let touches_store = event
            .paths
            .iter()
            .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
        if touches_store {
            // Full channel means a refresh is already pending
            let _ = tx.try_send(());
        }
    })?;

    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Run the change monitor until `cancel` fires or the orchestrator goes away.
///
/// Polling and file-change notification both go through the same refresh,
/// one pass at a time, and each pass's events reach the orchestrator as one batch.
pub async fn run_monitor<S>(
    source: Arc<S>,
    config: MonitorConfig,
    orchestrator: OrchestratorHandle,
    events: broadcast::Sender<DispatchEvent>,
    cancel: CancellationToken,
) where
    S: TicketSource + 'static,
{
    let mut monitor = ChangeMonitor::new();
    let (watch_tx, mut watch_rx) = mpsc::channel::<()>(1);

    let _watcher = match source.watch_path() {
        Some(path) if config.watch => match watch_store(path, watch_tx) {
            Ok(watcher) => {
                log_debug!("[monitor] Watching {}", path.display());
                Some(watcher)
            }
            Err(e) => {
                log_warn!("[monitor] {}, falling back to polling only", e);
                None
            }
        },
        _ => None,
    };

    let mut poll = tokio::time::interval(config.poll_interval());
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = poll.tick() => {}
            Some(()) = watch_rx.recv() => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.debounce()) => {}
                }
                while watch_rx.try_recv().is_ok() {}
            }
        }

        if !refresh(&mut monitor, source.as_ref(), &orchestrator, &events).await {
            break;
        }
    }

    log_debug!("[monitor] Stopped");
}

/// One monitor pass. Returns false when the orchestrator is gone.
async fn refresh<S: TicketSource>(
    monitor: &mut ChangeMonitor,
    source: &S,
    orchestrator: &OrchestratorHandle,
    events: &broadcast::Sender<DispatchEvent>,
) -> bool {
    let tickets = match source.load().await {
        Ok(tickets) => tickets,
        Err(e) => {
            log_error!("[monitor] {}", e);
            let _ = events.send(DispatchEvent::Error(e.to_string()));
            return true;
        }
    };

    let batch = monitor.process(&tickets);
    if batch.is_empty() {
        return true;
    }

    log_debug!(
        "[monitor] {} event(s) from {} ticket(s)",
        batch.len(),
        tickets.len()
    );
    match orchestrator.submit_events(batch).await {
        Ok(()) => true,
        Err(e) => {
            log_warn!("[monitor] {}", e);
            false
        }
    }
}

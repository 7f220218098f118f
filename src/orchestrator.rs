use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::OrchestratorConfig;
use crate::error::DispatchError;
use crate::launcher::{SessionHandle, SessionLauncher};
use crate::monitor::MonitorEvent;
use crate::store::TicketSource;
use crate::tickets;
use crate::types::{QueueEntry, Role, SessionKey, Ticket, TicketStatus};
use crate::{log_debug, log_error, log_info, log_warn};

const CHANNEL_CAPACITY: usize = 32;

// --- Public types ---

/// Observability notifications. Not part of the control flow.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    Started,
    Stopped,
    Error(String),
    SessionLaunched { ticket_id: String, role: Role },
    SessionCompleted { ticket_id: String, role: Role },
}

/// Result of one dispatch attempt for the queue head.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Launched,
    SkippedActive,
    SkippedCooldown,
    MaxReached,
    Failed(String),
}

/// Single-flight drain state. A trigger during a drain only marks a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Idle,
    Draining,
    DrainingRestartPending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSessionInfo {
    pub ticket_id: String,
    pub role: Role,
    pub session_id: String,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorStatus {
    pub drain: DrainState,
    pub queued: Vec<SessionKey>,
    pub active: Vec<ActiveSessionInfo>,
    pub cooling_down: Vec<SessionKey>,
}

// --- Command enum ---

pub enum OrchestratorCommand {
    Enqueue {
        entry: QueueEntry,
        reply: oneshot::Sender<bool>,
    },
    /// One monitor pass, applied in order with a single drain trigger at the end.
    MonitorEvents {
        events: Vec<MonitorEvent>,
        reply: oneshot::Sender<()>,
    },
    Completed {
        ticket: Ticket,
        role: Role,
        from: TicketStatus,
        to: TicketStatus,
        reply: oneshot::Sender<()>,
    },
    SentBack {
        ticket: Ticket,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<OrchestratorStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Continuations the actor posts to itself from spawned work and timers.
enum Internal {
    DrainStep,
    HeadFetched {
        key: SessionKey,
        tickets: Vec<Ticket>,
    },
    LaunchFinished {
        key: SessionKey,
        result: Result<SessionHandle, String>,
    },
    CooldownExpired {
        key: SessionKey,
        generation: u64,
    },
    SessionTimedOut {
        key: SessionKey,
        generation: u64,
    },
    RestartDrain,
}

// --- OrchestratorHandle ---

#[derive(Clone)]
pub struct OrchestratorHandle {
    sender: mpsc::Sender<OrchestratorCommand>,
}

impl OrchestratorHandle {
    async fn send_command<T>(
        &self,
        command: OrchestratorCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, DispatchError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| DispatchError::OrchestratorClosed)?;
        rx.await.map_err(|_| DispatchError::OrchestratorClosed)
    }

    /// Queue a ticket for a role. Returns false if that key was already queued.
    pub async fn enqueue(&self, ticket: Ticket, role: Role) -> Result<bool, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            OrchestratorCommand::Enqueue {
                entry: QueueEntry::new(ticket, role),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn submit_events(&self, events: Vec<MonitorEvent>) -> Result<(), DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(OrchestratorCommand::MonitorEvents { events, reply }, rx)
            .await
    }

    pub async fn on_completion(
        &self,
        ticket: Ticket,
        role: Role,
        from: TicketStatus,
        to: TicketStatus,
    ) -> Result<(), DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            OrchestratorCommand::Completed {
                ticket,
                role,
                from,
                to,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn on_sent_back(&self, ticket: Ticket) -> Result<(), DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(OrchestratorCommand::SentBack { ticket, reply }, rx)
            .await
    }

    pub async fn status(&self) -> Result<OrchestratorStatus, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(OrchestratorCommand::Status { reply }, rx)
            .await
    }

    pub async fn active_sessions(&self) -> Result<Vec<ActiveSessionInfo>, DispatchError> {
        Ok(self.status().await?.active)
    }

    /// Clear all state and stop the actor.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(OrchestratorCommand::Shutdown { reply }, rx)
            .await
    }
}

// --- State ---

struct ActiveSession {
    handle: SessionHandle,
    started: Instant,
    started_at: DateTime<Local>,
    generation: u64,
    _fallback: DropGuard,
}

struct Cooldown {
    since: Instant,
    generation: u64,
    _expiry: DropGuard,
}

struct OrchestratorState<S, L> {
    config: OrchestratorConfig,
    source: Arc<S>,
    launcher: Arc<L>,
    events: broadcast::Sender<DispatchEvent>,
    internal: mpsc::UnboundedSender<Internal>,
    queue: VecDeque<QueueEntry>,
    active: HashMap<SessionKey, ActiveSession>,
    cooldowns: HashMap<SessionKey, Cooldown>,
    drain: DrainState,
    generation: u64,
}

impl<S, L> OrchestratorState<S, L>
where
    S: TicketSource + 'static,
    L: SessionLauncher + 'static,
{
    fn publish(&self, event: DispatchEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn has_capacity(&self) -> bool {
        self.active.len() < self.config.max_concurrent as usize
    }

    fn is_queued(&self, key: &SessionKey) -> bool {
        self.queue.iter().any(|entry| &entry.key() == key)
    }

    // --- Timers ---

    /// Post `msg` after `delay` unless the returned guard is dropped first.
    fn schedule(&self, delay: Duration, msg: Internal) -> DropGuard {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let tx = self.internal.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(msg);
                }
            }
        });
        token.drop_guard()
    }

    fn schedule_detached(&self, delay: Duration, msg: Internal) {
        let tx = self.internal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg);
        });
    }

    fn start_cooldown(&mut self, key: &SessionKey) {
        let generation = self.next_generation();
        let expiry = self.schedule(
            self.config.cooldown(),
            Internal::CooldownExpired {
                key: key.clone(),
                generation,
            },
        );
        // Replacing an entry drops its guard, which cancels the old timer
        self.cooldowns.insert(
            key.clone(),
            Cooldown {
                since: Instant::now(),
                generation,
                _expiry: expiry,
            },
        );
    }

    // --- Queue admission ---

    fn push_entry(&mut self, entry: QueueEntry) -> bool {
        let key = entry.key();
        if self.is_queued(&key) {
            log_debug!("[queue] [{}] Already queued", key);
            return false;
        }
        self.queue.push_back(entry);
        log_info!("[queue] [{}] Queued ({} waiting)", key, self.queue.len());
        true
    }

    // --- Drain loop ---

    fn kick_drain(&mut self) {
        match self.drain {
            DrainState::Idle => {
                self.drain = DrainState::Draining;
                let _ = self.internal.send(Internal::DrainStep);
            }
            DrainState::Draining => {
                log_debug!("[drain] Drain in progress, restart requested");
                self.drain = DrainState::DrainingRestartPending;
            }
            DrainState::DrainingRestartPending => {}
        }
    }

    fn drain_step(&mut self) {
        if self.drain == DrainState::Idle {
            return;
        }

        let Some(head) = self.queue.front() else {
            self.finish_drain();
            return;
        };

        if !self.has_capacity() {
            log_debug!(
                "[drain] At capacity ({}/{}), {} waiting",
                self.active.len(),
                self.config.max_concurrent,
                self.queue.len()
            );
            self.finish_drain();
            return;
        }

        // Dependencies may have changed since enqueue: re-read before dispatch
        let key = head.key();
        let source = Arc::clone(&self.source);
        let events = self.events.clone();
        let tx = self.internal.clone();
        tokio::spawn(async move {
            let tickets = match source.load().await {
                Ok(tickets) => tickets,
                Err(e) => {
                    log_warn!("[drain] Store read failed, treating as empty: {}", e);
                    let _ = events.send(DispatchEvent::Error(e.to_string()));
                    Vec::new()
                }
            };
            let _ = tx.send(Internal::HeadFetched { key, tickets });
        });
    }

    fn on_head_fetched(&mut self, key: SessionKey, tickets: Vec<Ticket>) {
        if self.drain == DrainState::Idle {
            return;
        }

        let Some(head) = self.queue.front() else {
            self.finish_drain();
            return;
        };
        if head.key() != key {
            let _ = self.internal.send(Internal::DrainStep);
            return;
        }

        // Prefer the live record; fall back to the queued snapshot if it vanished
        let ticket = tickets
            .iter()
            .find(|t| t.id == key.ticket_id)
            .cloned()
            .unwrap_or_else(|| head.ticket.clone());

        if !tickets::dependencies_satisfied(&ticket, &tickets) {
            let summary = tickets::unmet_dep_summary(&ticket, &tickets).unwrap_or_default();
            log_info!(
                "[drain] [{}] Dependencies no longer satisfied ({}), skipping",
                key,
                summary
            );
            self.queue.pop_front();
            self.after_pop();
            return;
        }

        match self.precheck(&key, &ticket) {
            Some(outcome) => self.conclude_dispatch(&key, outcome),
            None => self.start_launch(key, ticket),
        }
    }

    /// Policy checks that run before the launcher is called. `None` means launch.
    fn precheck(&mut self, key: &SessionKey, ticket: &Ticket) -> Option<DispatchOutcome> {
        let cooldown = self.config.cooldown();

        if let Some(session) = self.active.get(key) {
            if session.started.elapsed() < cooldown {
                return Some(DispatchOutcome::SkippedActive);
            }
            log_warn!("[session] [{}] Stale active session, removing", key);
            self.active.remove(key);
        }

        if let Some(entry) = self.cooldowns.get(key) {
            if entry.since.elapsed() >= cooldown {
                self.cooldowns.remove(key);
            } else if ticket.status == TicketStatus::Todo {
                log_info!("[drain] [{}] Back in todo, clearing cooldown", key);
                self.cooldowns.remove(key);
            } else {
                return Some(DispatchOutcome::SkippedCooldown);
            }
        }

        if !self.has_capacity() {
            return Some(DispatchOutcome::MaxReached);
        }

        None
    }

    fn start_launch(&mut self, key: SessionKey, ticket: Ticket) {
        log_info!("[launch] [{}] Launching session for {}", key, ticket.title);
        let launcher = Arc::clone(&self.launcher);
        let tx = self.internal.clone();
        let role = key.role;
        tokio::spawn(async move {
            // Inner task so a panicking launcher becomes a failed outcome
            let attempt = tokio::spawn(async move { launcher.launch(&ticket, role).await });
            let result = match attempt.await {
                Ok(result) => result,
                Err(e) => Err(format!("launcher panicked: {}", e)),
            };
            let _ = tx.send(Internal::LaunchFinished { key, result });
        });
    }

    fn finish_launch(&mut self, key: SessionKey, result: Result<SessionHandle, String>) {
        if self.drain == DrainState::Idle {
            return;
        }
        let outcome = match result {
            Ok(handle) => {
                self.record_session(&key, handle);
                DispatchOutcome::Launched
            }
            Err(e) => {
                log_error!("[launch] [{}] Launch failed: {}", key, e);
                self.publish(DispatchEvent::Error(format!("launch {} failed: {}", key, e)));
                DispatchOutcome::Failed(e)
            }
        };
        self.conclude_dispatch(&key, outcome);
    }

    fn record_session(&mut self, key: &SessionKey, handle: SessionHandle) {
        let generation = self.next_generation();
        let fallback = self.schedule(
            self.config.cooldown(),
            Internal::SessionTimedOut {
                key: key.clone(),
                generation,
            },
        );
        log_info!("[session] [{}] Launched ({})", key, handle.id);
        self.active.insert(
            key.clone(),
            ActiveSession {
                handle,
                started: Instant::now(),
                started_at: Local::now(),
                generation,
                _fallback: fallback,
            },
        );
        self.start_cooldown(key);
        self.publish(DispatchEvent::SessionLaunched {
            ticket_id: key.ticket_id.clone(),
            role: key.role,
        });
    }

    fn conclude_dispatch(&mut self, key: &SessionKey, outcome: DispatchOutcome) {
        match &outcome {
            DispatchOutcome::SkippedActive => {
                log_info!("[drain] [{}] Session already active, skipping", key)
            }
            DispatchOutcome::SkippedCooldown => {
                log_info!("[drain] [{}] In cooldown, skipping", key)
            }
            DispatchOutcome::MaxReached => {
                log_debug!("[drain] [{}] Max concurrency reached, waiting", key);
                self.finish_drain();
                return;
            }
            DispatchOutcome::Launched | DispatchOutcome::Failed(_) => {}
        }

        if self.queue.front().map(QueueEntry::key).as_ref() == Some(key) {
            self.queue.pop_front();
        }
        self.after_pop();
    }

    fn after_pop(&mut self) {
        if !self.queue.is_empty() && self.has_capacity() {
            self.schedule_detached(self.config.dispatch_delay(), Internal::DrainStep);
        } else {
            self.finish_drain();
        }
    }

    fn finish_drain(&mut self) {
        let restart = self.drain == DrainState::DrainingRestartPending;
        self.drain = DrainState::Idle;
        if !self.queue.is_empty() && (restart || self.has_capacity()) {
            self.schedule_detached(self.config.restart_settle(), Internal::RestartDrain);
        }
    }

    // --- Completion and rework ---

    fn handle_completion(&mut self, ticket: Ticket, role: Role, from: TicketStatus, to: TicketStatus) {
        let key = SessionKey::new(role, &ticket.id);

        match self.active.remove(&key) {
            None => log_warn!(
                "[session] [{}] Completed ({} -> {}) with no active session, ignoring",
                key,
                from,
                to
            ),
            Some(session) => {
                log_info!(
                    "[session] [{}] Completed ({} -> {}) after {}s",
                    key,
                    from,
                    to,
                    session.started.elapsed().as_secs()
                );
                self.start_cooldown(&key);
                if self.config.close_sessions {
                    let launcher = Arc::clone(&self.launcher);
                    let handle = session.handle;
                    tokio::spawn(async move { launcher.close(&handle).await });
                }
                self.publish(DispatchEvent::SessionCompleted {
                    ticket_id: key.ticket_id.clone(),
                    role,
                });
            }
        }

        let authored_into_review = role != Role::Qa
            && to == TicketStatus::InReview
            && matches!(from, TicketStatus::Todo | TicketStatus::InProgress);
        if authored_into_review && self.push_entry(QueueEntry::new(ticket, Role::Qa)) {
            log_debug!("[queue] [qa:{}] Ensured review entry", key.ticket_id);
        }
    }

    fn handle_sent_back(&mut self, ticket: &Ticket) {
        let primary = ticket.work_role().unwrap_or(Role::Swe);
        for role in [primary, Role::Qa] {
            let key = SessionKey::new(role, &ticket.id);
            if self.cooldowns.remove(&key).is_some() {
                log_debug!("[queue] [{}] Cooldown cleared for rework", key);
            }
        }

        let stray: Vec<SessionKey> = self
            .active
            .keys()
            .filter(|key| key.ticket_id == ticket.id)
            .cloned()
            .collect();
        for key in stray {
            log_warn!("[session] [{}] Removing active session on rework", key);
            self.active.remove(&key);
        }
    }

    fn apply_monitor_events(&mut self, events: Vec<MonitorEvent>) {
        for event in events {
            match event {
                MonitorEvent::Eligible { ticket, role, .. } => {
                    self.push_entry(QueueEntry::new(ticket, role));
                }
                MonitorEvent::RoleCompleted {
                    ticket,
                    role,
                    from,
                    to,
                } => self.handle_completion(ticket, role, from, to),
                MonitorEvent::SentBack { ticket, .. } => self.handle_sent_back(&ticket),
            }
        }
        self.kick_drain();
    }

    // --- Timers firing ---

    fn on_cooldown_expired(&mut self, key: SessionKey, generation: u64) {
        if self.cooldowns.get(&key).map(|c| c.generation) == Some(generation) {
            log_debug!("[queue] [{}] Cooldown expired", key);
            self.cooldowns.remove(&key);
        }
    }

    fn on_session_timed_out(&mut self, key: SessionKey, generation: u64) {
        if self.active.get(&key).map(|s| s.generation) != Some(generation) {
            return;
        }
        log_warn!(
            "[session] [{}] No completion seen within {}s, releasing slot",
            key,
            self.config.cooldown_secs
        );
        self.active.remove(&key);
        self.cooldowns.remove(&key);
        self.kick_drain();
    }

    // --- Queries ---

    fn status(&self) -> OrchestratorStatus {
        let mut active: Vec<ActiveSessionInfo> = self
            .active
            .iter()
            .map(|(key, session)| ActiveSessionInfo {
                ticket_id: key.ticket_id.clone(),
                role: key.role,
                session_id: session.handle.id.clone(),
                started_at: session.started_at,
                elapsed: session.started.elapsed(),
            })
            .collect();
        active.sort_by(|a, b| (&a.ticket_id, a.role).cmp(&(&b.ticket_id, b.role)));

        let mut cooling_down: Vec<SessionKey> = self.cooldowns.keys().cloned().collect();
        cooling_down.sort();

        OrchestratorStatus {
            drain: self.drain,
            queued: self.queue.iter().map(QueueEntry::key).collect(),
            active,
            cooling_down,
        }
    }

    async fn shutdown(&mut self) {
        log_info!(
            "[queue] Shutting down ({} queued, {} active)",
            self.queue.len(),
            self.active.len()
        );
        self.queue.clear();
        self.cooldowns.clear();
        self.drain = DrainState::Idle;
        let sessions: Vec<ActiveSession> = self.active.drain().map(|(_, s)| s).collect();
        if self.config.close_sessions {
            for session in &sessions {
                self.launcher.close(&session.handle).await;
            }
        }
    }

    fn handle_command(&mut self, cmd: OrchestratorCommand) {
        match cmd {
            OrchestratorCommand::Enqueue { entry, reply } => {
                let added = self.push_entry(entry);
                if added {
                    self.kick_drain();
                }
                let _ = reply.send(added);
            }
            OrchestratorCommand::MonitorEvents { events, reply } => {
                self.apply_monitor_events(events);
                let _ = reply.send(());
            }
            OrchestratorCommand::Completed {
                ticket,
                role,
                from,
                to,
                reply,
            } => {
                self.handle_completion(ticket, role, from, to);
                self.kick_drain();
                let _ = reply.send(());
            }
            OrchestratorCommand::SentBack { ticket, reply } => {
                self.handle_sent_back(&ticket);
                self.kick_drain();
                let _ = reply.send(());
            }
            OrchestratorCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            // Handled by the actor loop, which exits afterwards
            OrchestratorCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::DrainStep => self.drain_step(),
            Internal::HeadFetched { key, tickets } => self.on_head_fetched(key, tickets),
            Internal::LaunchFinished { key, result } => self.finish_launch(key, result),
            Internal::CooldownExpired { key, generation } => {
                self.on_cooldown_expired(key, generation)
            }
            Internal::SessionTimedOut { key, generation } => {
                self.on_session_timed_out(key, generation)
            }
            Internal::RestartDrain => self.kick_drain(),
        }
    }
}

// --- Actor loop ---

async fn run_orchestrator<S, L>(
    mut rx: mpsc::Receiver<OrchestratorCommand>,
    mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    mut state: OrchestratorState<S, L>,
) where
    S: TicketSource + 'static,
    L: SessionLauncher + 'static,
{
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(OrchestratorCommand::Shutdown { reply }) => {
                    state.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                Some(cmd) => state.handle_command(cmd),
                None => {
                    state.shutdown().await;
                    break;
                }
            },
            Some(msg) = internal_rx.recv() => state.handle_internal(msg),
        }
    }
}

// --- Spawn ---

pub fn spawn_orchestrator<S, L>(
    config: OrchestratorConfig,
    source: Arc<S>,
    launcher: Arc<L>,
    events: broadcast::Sender<DispatchEvent>,
) -> (OrchestratorHandle, tokio::task::JoinHandle<()>)
where
    S: TicketSource + 'static,
    L: SessionLauncher + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();

    let state = OrchestratorState {
        config,
        source,
        launcher,
        events,
        internal: internal_tx,
        queue: VecDeque::new(),
        active: HashMap::new(),
        cooldowns: HashMap::new(),
        drain: DrainState::Idle,
        generation: 0,
    };

    let task_handle = tokio::spawn(run_orchestrator(rx, internal_rx, state));

    (OrchestratorHandle { sender: tx }, task_handle)
}

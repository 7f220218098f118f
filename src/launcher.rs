use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use nix::unistd::Pid;

use crate::config::{LaunchCommand, LauncherConfig};
use crate::types::{Role, SessionKey, Ticket};
use crate::{log_debug, log_info, log_warn};

/// Maximum time to wait for graceful shutdown after SIGTERM before sending SIGKILL.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;

/// Polling interval when waiting for a process group to exit after SIGTERM.
const KILL_POLL_INTERVAL_MS: u64 = 100;

/// Global shutdown flag shared with signal handlers.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Check if a shutdown has been requested via signal.
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install SIGTERM and SIGINT handlers that set the shutdown flag.
///
/// Call once at program startup. Subsequent calls are safe (re-registers handlers).
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

// --- Process Registry ---

/// Process groups of launch attempts that have not finished yet.
///
/// `std::sync::Mutex` is fine here: no I/O happens under the lock.
fn process_registry() -> &'static Mutex<HashSet<Pid>> {
    static REGISTRY: OnceLock<Mutex<HashSet<Pid>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

pub fn register_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.insert(pgid);
    }
}

pub fn unregister_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.remove(&pgid);
    }
}

/// Kill every registered process group: SIGTERM, grace period, then SIGKILL.
///
/// Blocking. Called from the CLI after the dispatcher has stopped.
pub fn kill_all_children() {
    use nix::sys::signal::{killpg, Signal};

    let pgids: Vec<Pid> = {
        let Ok(registry) = process_registry().lock() else {
            return;
        };
        registry.iter().copied().collect()
    };

    if pgids.is_empty() {
        return;
    }

    log_info!("[launch] Terminating {} pending launch attempt(s)", pgids.len());

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

    while std::time::Instant::now() < deadline {
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    if let Ok(mut registry) = process_registry().lock() {
        registry.clear();
    }
}

// --- Launcher seam ---

/// Opaque handle to an opened session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionHandle {
    pub id: String,
    /// Name of the launch method that succeeded.
    pub method: String,
    /// Process group still running for a detached session, used by `close`.
    pub pgid: Option<i32>,
}

/// Opens agent sessions. Failures are reported in-band as `Err`.
pub trait SessionLauncher: Send + Sync {
    fn launch(
        &self,
        ticket: &Ticket,
        role: Role,
    ) -> impl Future<Output = Result<SessionHandle, String>> + Send;

    /// Best-effort close of a session previously returned by `launch`.
    fn close(&self, handle: &SessionHandle) -> impl Future<Output = ()> + Send;
}

/// Whether a configured launch command's program could be found.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandAvailability {
    pub name: String,
    pub program: String,
    pub available: bool,
    pub install_hint: Option<String>,
}

/// Launches sessions by running the configured commands in order.
pub struct CommandSessionLauncher {
    config: LauncherConfig,
    workspace: PathBuf,
}

impl CommandSessionLauncher {
    pub fn new(config: LauncherConfig, project_root: &Path) -> Self {
        let workspace = match config.workspace.as_deref() {
            Some(ws) if !ws.trim().is_empty() => project_root.join(ws),
            _ => project_root.to_path_buf(),
        };
        Self { config, workspace }
    }

    /// Render the role's prompt template for a ticket.
    pub fn build_prompt(&self, ticket: &Ticket, role: Role) -> String {
        let mut prompt = self
            .config
            .prompt_template(role)
            .replace("{ticket_id}", &ticket.id)
            .replace("{title}", &ticket.title)
            .replace("{role}", role.as_str());
        if let Some(model) = self.model() {
            prompt.push_str(&format!(" (model: {})", model));
        }
        prompt
    }

    fn model(&self) -> Option<&str> {
        self.config
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
    }

    fn render_args(
        &self,
        command: &LaunchCommand,
        prompt: &str,
        ticket: &Ticket,
        role: Role,
    ) -> Vec<String> {
        let model = self.model();
        let workspace = self.workspace.display().to_string();

        let extra = match model {
            Some(_) => command.model_args.as_slice(),
            None => &[],
        };

        command
            .args
            .iter()
            .chain(extra)
            .map(|arg| {
                arg.replace("{prompt}", prompt)
                    .replace("{model}", model.unwrap_or(""))
                    .replace("{workspace}", &workspace)
                    .replace("{ticket_id}", &ticket.id)
                    .replace("{role}", role.as_str())
            })
            .collect()
    }

    /// Check which configured programs are on PATH.
    pub fn verify_commands(&self) -> Vec<CommandAvailability> {
        self.config
            .commands
            .iter()
            .map(|command| CommandAvailability {
                name: command.name.clone(),
                program: command.program.clone(),
                available: program_on_path(&command.program),
                install_hint: command.install_hint.clone(),
            })
            .collect()
    }
}

fn program_on_path(program: &str) -> bool {
    if program.contains(std::path::MAIN_SEPARATOR) {
        return Path::new(program).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

impl SessionLauncher for CommandSessionLauncher {
    async fn launch(&self, ticket: &Ticket, role: Role) -> Result<SessionHandle, String> {
        let key = SessionKey::new(role, &ticket.id);
        let prompt = self.build_prompt(ticket, role);
        let timeout = self.config.timeout();
        let mut failures = Vec::new();

        for command in &self.config.commands {
            if command.requires_prompt && prompt.trim().is_empty() {
                log_debug!("[{}] Skipping {}: no prompt", key, command.name);
                continue;
            }

            let mut cmd = tokio::process::Command::new(&command.program);
            cmd.args(self.render_args(command, &prompt, ticket, role));
            cmd.current_dir(&self.workspace);

            log_debug!("[{}] Trying launch method {}", key, command.name);
            match run_launch_command(cmd, &command.name, timeout, command.detach).await {
                Ok(handle) => {
                    log_info!("[{}] Session opened via {}", key, command.name);
                    return Ok(handle);
                }
                Err(e) => {
                    log_debug!("[{}] {} failed: {}", key, command.name, e);
                    failures.push(format!("{}: {}", command.name, e));
                }
            }

            if is_shutdown_requested() {
                break;
            }
        }

        if failures.is_empty() {
            return Err("No launch method configured".to_string());
        }
        Err(format!("All launch methods failed ({})", failures.join("; ")))
    }

    async fn close(&self, handle: &SessionHandle) {
        match handle.pgid {
            Some(pgid) => {
                log_debug!("[session] Closing {} (pgid={})", handle.id, pgid);
                kill_process_group(pgid).await;
            }
            None => log_debug!("[session] {} has no process to close", handle.id),
        }
    }
}

/// Spawn one launch method in its own process group and wait for it.
///
/// Exit 0 within `timeout` is success. A process still running at the
/// timeout is a success only when `detach` is set; otherwise its group is
/// killed. A detached process is reaped in the background once it exits.
/// Checks the global shutdown flag after the wait.
pub async fn run_launch_command(
    mut cmd: tokio::process::Command,
    name: &str,
    timeout: Duration,
    detach: bool,
) -> Result<SessionHandle, String> {
    // stdin must be null: the child is in a background process group and a
    // terminal read would stop it with SIGTTIN.
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::null());
    cmd.stderr(std::process::Stdio::null());
    cmd.kill_on_drop(!detach);

    // SAFETY: pre_exec runs between fork() and exec() where only async-signal-safe
    // functions are permitted. setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("Failed to spawn: {}", e))?;

    let child_pid = child
        .id()
        .ok_or_else(|| "Failed to get child PID".to_string())? as i32;
    let pgid = Pid::from_raw(child_pid);
    log_debug!("[launch] {} spawned (pid={})", name, child_pid);

    register_child(pgid);

    let wait_result = tokio::time::timeout(timeout, child.wait()).await;
    let session_id = format!("{}-{}", name, child_pid);

    match wait_result {
        Err(_) if detach && !is_shutdown_requested() => {
            unregister_child(pgid);
            // Detached: reaped in the background once it exits
            let reaped = session_id.clone();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => log_debug!("[launch] {} exited ({})", reaped, status),
                    Err(e) => log_debug!("[launch] {} could not be reaped: {}", reaped, e),
                }
            });
            Ok(SessionHandle {
                id: session_id,
                method: name.to_string(),
                pgid: Some(child_pid),
            })
        }
        Err(_) => {
            log_debug!(
                "[launch] {} still running after {}s, killing process group",
                name,
                timeout.as_secs()
            );
            kill_process_group(child_pid).await;
            let _ = child.wait().await;
            unregister_child(pgid);
            Err(format!("Timed out after {} seconds", timeout.as_secs()))
        }
        Ok(wait_result) => {
            unregister_child(pgid);
            let exit_status = wait_result.map_err(|e| format!("Error waiting for process: {}", e))?;

            if is_shutdown_requested() {
                return Err("Shutdown requested".to_string());
            }

            if exit_status.success() {
                Ok(SessionHandle {
                    id: session_id,
                    method: name.to_string(),
                    pgid: None,
                })
            } else {
                Err(format!("Exited with status {:?}", exit_status.code()))
            }
        }
    }
}

/// Kill a process group by PID. Sends SIGTERM, polls for exit, then SIGKILL if needed.
///
/// The blocking poll-and-sleep loop runs on the blocking pool via `spawn_blocking`.
pub async fn kill_process_group(pgid: i32) {
    tokio::task::spawn_blocking(move || {
        use nix::sys::signal::{killpg, Signal};

        let pgid = Pid::from_raw(pgid);

        if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
            return;
        }

        let deadline =
            std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
        let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

        while std::time::Instant::now() < deadline {
            // Signal 0 checks if the process group exists without sending a signal
            match killpg(pgid, None) {
                Err(nix::errno::Errno::ESRCH) => return,
                _ => std::thread::sleep(poll_interval),
            }
        }

        let _ = killpg(pgid, Signal::SIGKILL);
    })
    .await
    .unwrap_or_else(|e| log_warn!("kill_process_group task panicked: {}", e));
}

// --- Mock ---

#[derive(Default)]
struct MockState {
    launches: Vec<SessionKey>,
    closed: Vec<String>,
    failing: HashSet<String>,
}

/// Launcher double that records calls instead of opening sessions.
#[derive(Default)]
pub struct MockSessionLauncher {
    state: Mutex<MockState>,
    delay: Option<Duration>,
}

impl MockSessionLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every launch sleeps for `delay` before reporting success.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Make launches for this ticket id fail.
    pub fn fail_ticket(&self, ticket_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.insert(ticket_id.to_string());
        }
    }

    /// Every launch attempted so far, in order, including failed ones.
    pub fn launches(&self) -> Vec<SessionKey> {
        self.state
            .lock()
            .map(|s| s.launches.clone())
            .unwrap_or_default()
    }

    pub fn launch_count(&self) -> usize {
        self.state.lock().map(|s| s.launches.len()).unwrap_or(0)
    }

    /// Ids of closed sessions.
    pub fn closed(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.closed.clone())
            .unwrap_or_default()
    }
}

impl SessionLauncher for MockSessionLauncher {
    async fn launch(&self, ticket: &Ticket, role: Role) -> Result<SessionHandle, String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| "MockSessionLauncher: state poisoned".to_string())?;
        state.launches.push(SessionKey::new(role, &ticket.id));

        if state.failing.contains(&ticket.id) {
            return Err(format!("mock launch failure for {}", ticket.id));
        }

        Ok(SessionHandle {
            id: format!("mock-{}", state.launches.len()),
            method: "mock".to_string(),
            pgid: None,
        })
    }

    async fn close(&self, handle: &SessionHandle) {
        if let Ok(mut state) = self.state.lock() {
            state.closed.push(handle.id.clone());
        }
    }
}

/// Set the shutdown flag for testing. Only available in test builds.
#[cfg(test)]
fn set_shutdown_flag_for_testing(value: bool) {
    shutdown_flag().store(value, Ordering::Relaxed);
}

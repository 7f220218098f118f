use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::launcher::SessionLauncher;
use crate::monitor::run_monitor;
use crate::orchestrator::{
    spawn_orchestrator, ActiveSessionInfo, DispatchEvent, OrchestratorHandle, OrchestratorStatus,
};
use crate::store::TicketSource;
use crate::{log_info, log_warn};

const EVENT_CAPACITY: usize = 256;

struct Running {
    orchestrator: OrchestratorHandle,
    cancel: CancellationToken,
    monitor_task: JoinHandle<()>,
    orchestrator_task: JoinHandle<()>,
}

/// Start/stop control over the monitor + orchestrator pair.
pub struct Dispatcher<S, L> {
    config: DispatchConfig,
    source: Arc<S>,
    launcher: Arc<L>,
    events: broadcast::Sender<DispatchEvent>,
    running: Option<Running>,
}

impl<S, L> Dispatcher<S, L>
where
    S: TicketSource + 'static,
    L: SessionLauncher + 'static,
{
    pub fn new(config: DispatchConfig, source: Arc<S>, launcher: Arc<L>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            source,
            launcher,
            events,
            running: None,
        }
    }

    /// Receive observability events. Subscribe before `start` to see `Started`.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Handle to the running orchestrator, e.g. to report completions directly.
    pub fn orchestrator(&self) -> Option<&OrchestratorHandle> {
        self.running.as_ref().map(|r| &r.orchestrator)
    }

    pub fn start(&mut self) -> Result<(), DispatchError> {
        if self.running.is_some() {
            return Err(DispatchError::AlreadyRunning);
        }

        let (orchestrator, orchestrator_task) = spawn_orchestrator(
            self.config.orchestrator.clone(),
            Arc::clone(&self.source),
            Arc::clone(&self.launcher),
            self.events.clone(),
        );

        let cancel = CancellationToken::new();
        let monitor_task = tokio::spawn(run_monitor(
            Arc::clone(&self.source),
            self.config.monitor.clone(),
            orchestrator.clone(),
            self.events.clone(),
            cancel.clone(),
        ));

        self.running = Some(Running {
            orchestrator,
            cancel,
            monitor_task,
            orchestrator_task,
        });

        log_info!(
            "Dispatcher started (max {} concurrent, cooldown {}s, poll every {}s)",
            self.config.orchestrator.max_concurrent,
            self.config.orchestrator.cooldown_secs,
            self.config.monitor.poll_interval_secs
        );
        let _ = self.events.send(DispatchEvent::Started);
        Ok(())
    }

    pub async fn status(&self) -> Result<OrchestratorStatus, DispatchError> {
        let running = self.running.as_ref().ok_or(DispatchError::NotRunning)?;
        running.orchestrator.status().await
    }

    /// Active sessions with their elapsed time. Empty when not running.
    pub async fn active_sessions(&self) -> Result<Vec<ActiveSessionInfo>, DispatchError> {
        match &self.running {
            Some(running) => running.orchestrator.active_sessions().await,
            None => Ok(Vec::new()),
        }
    }

    /// Stop monitoring, then shut the orchestrator down.
    pub async fn stop(&mut self) -> Result<(), DispatchError> {
        let running = self.running.take().ok_or(DispatchError::NotRunning)?;

        running.cancel.cancel();
        if let Err(e) = running.monitor_task.await {
            log_warn!("Monitor task ended abnormally: {}", e);
        }

        if let Err(e) = running.orchestrator.shutdown().await {
            log_warn!("Orchestrator shutdown: {}", e);
        }
        if let Err(e) = running.orchestrator_task.await {
            log_warn!("Orchestrator task ended abnormally: {}", e);
        }

        log_info!("Dispatcher stopped");
        let _ = self.events.send(DispatchEvent::Stopped);
        Ok(())
    }
}

use std::path::PathBuf;

/// Error enum for the dispatcher.
///
/// Categories:
/// - Fatal: abort startup (store cannot be located, bad config, lock held)
/// - Degraded: log, publish an `Error` event, keep running
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    // Fatal
    #[error("Ticket store not found (searched: {})", display_paths(.0))]
    StoreNotFound(Vec<PathBuf>),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Lock(String),

    // Degraded
    #[error("Failed to read ticket store {}: {source}", .path.display())]
    StoreRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("File watch unavailable: {0}")]
    Watch(#[from] notify::Error),

    #[error("Orchestrator shut down")]
    OrchestratorClosed,

    // Lifecycle misuse
    #[error("Dispatcher is already running")]
    AlreadyRunning,

    #[error("Dispatcher is not running")]
    NotRunning,
}

impl DispatchError {
    /// Returns true if the error should stop the process instead of degrading.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DispatchError::StoreNotFound(_) | DispatchError::Config(_) | DispatchError::Lock(_)
        )
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Lets CLI handlers that return `Result<T, String>` use `?` on dispatcher calls.
impl From<DispatchError> for String {
    fn from(err: DispatchError) -> String {
        err.to_string()
    }
}

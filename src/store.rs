use std::borrow::Cow;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::StoreConfig;
use crate::error::DispatchError;
use crate::tickets;
use crate::types::{Ticket, TicketStatus};
use crate::log_debug;

/// Where the dispatcher reads tickets from. Enables in-memory stores in tests.
pub trait TicketSource: Send + Sync {
    /// Read a fresh snapshot of every ticket.
    fn load(&self) -> impl Future<Output = Result<Vec<Ticket>, DispatchError>> + Send;

    /// File to watch for changes, if the source is file-backed.
    fn watch_path(&self) -> Option<&Path> {
        None
    }
}

/// CSV ticket store on disk. Never written, only read.
#[derive(Debug, Clone)]
pub struct CsvTicketStore {
    path: PathBuf,
}

impl CsvTicketStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TicketSource for CsvTicketStore {
    async fn load(&self) -> Result<Vec<Ticket>, DispatchError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(tickets::parse(&decode(&self.path, &bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(DispatchError::StoreRead {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn watch_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Synchronous read for one-shot CLI commands. A missing file is an error here.
pub fn load_tickets_blocking(path: &Path) -> Result<Vec<Ticket>, DispatchError> {
    let bytes = std::fs::read(path).map_err(|source| DispatchError::StoreRead {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(tickets::parse(&decode(path, &bytes)))
}

/// Spreadsheet exports are not always UTF-8. Bad sequences become U+FFFD
/// so one odd byte never hides the rest of the store.
fn decode<'a>(path: &Path, bytes: &'a [u8]) -> Cow<'a, str> {
    let text = String::from_utf8_lossy(bytes);
    if let Cow::Owned(_) = text {
        log_debug!(
            "[store] {} is not valid UTF-8, undecodable bytes were replaced",
            path.display()
        );
    }
    text
}

/// Resolve the store path: primary first, then the fallback.
pub fn locate_store(config: &StoreConfig, base: &Path) -> Result<PathBuf, DispatchError> {
    let candidates: Vec<PathBuf> = std::iter::once(config.path.as_str())
        .chain(config.fallback_path.as_deref())
        .filter(|p| !p.trim().is_empty())
        .map(|p| base.join(p))
        .collect();

    candidates
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .ok_or(DispatchError::StoreNotFound(candidates))
}

/// In-memory ticket source. Mutations are visible to the next `load`.
#[derive(Debug, Default)]
pub struct MemoryTicketSource {
    tickets: Mutex<Vec<Ticket>>,
}

impl MemoryTicketSource {
    pub fn new(tickets: Vec<Ticket>) -> Self {
        Self {
            tickets: Mutex::new(tickets),
        }
    }

    pub fn set(&self, tickets: Vec<Ticket>) {
        if let Ok(mut guard) = self.tickets.lock() {
            *guard = tickets;
        }
    }

    /// Change one ticket's status. Returns false if no ticket has that id.
    pub fn set_status(&self, id: &str, status: TicketStatus) -> bool {
        let Ok(mut guard) = self.tickets.lock() else {
            return false;
        };
        match guard.iter_mut().find(|t| t.id == id) {
            Some(ticket) => {
                ticket.status = status;
                true
            }
            None => false,
        }
    }

    pub fn push(&self, ticket: Ticket) {
        if let Ok(mut guard) = self.tickets.lock() {
            guard.push(ticket);
        }
    }

    pub fn snapshot(&self) -> Vec<Ticket> {
        self.tickets
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl TicketSource for MemoryTicketSource {
    async fn load(&self) -> Result<Vec<Ticket>, DispatchError> {
        Ok(self.snapshot())
    }
}

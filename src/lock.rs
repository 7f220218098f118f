use std::fs;
use std::path::{Path, PathBuf};

use crate::error::DispatchError;
use crate::{log_debug, log_warn};

/// Runtime state directory, created next to the ticket store it guards.
pub const RUNTIME_DIR: &str = ".ticket-dispatch";

/// Exclusive claim on one ticket store. Released on drop.
///
/// Two dispatchers pointed at the same CSV file conflict however they got
/// there: different project roots, `--config`, relative paths or symlinks
/// all resolve to one lock. Dispatchers on different stores never block
/// each other, even from the same project root.
#[must_use = "the store is released when StoreLock is dropped"]
pub struct StoreLock {
    file: fslock::LockFile,
    store: PathBuf,
    lock_path: PathBuf,
}

impl std::fmt::Debug for StoreLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLock")
            .field("store", &self.store)
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

impl StoreLock {
    /// Claim `store` for this process. The store file must exist.
    ///
    /// The holder's PID is written into the lock file so a second dispatcher
    /// can say who is serving the store.
    pub fn acquire(store: &Path) -> Result<StoreLock, DispatchError> {
        let store = store.canonicalize().map_err(|e| {
            DispatchError::Lock(format!(
                "Cannot resolve ticket store {}: {}",
                store.display(),
                e
            ))
        })?;
        let lock_path = lock_path_for(&store)?;

        if let Some(dir) = lock_path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                DispatchError::Lock(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }

        let mut file = fslock::LockFile::open(&lock_path).map_err(|e| {
            DispatchError::Lock(format!(
                "Failed to open lock file {}: {}",
                lock_path.display(),
                e
            ))
        })?;

        let acquired = file.try_lock_with_pid().map_err(|e| {
            DispatchError::Lock(format!("Failed to lock {}: {}", store.display(), e))
        })?;
        if !acquired {
            return Err(DispatchError::Lock(held_message(&store, &lock_path)));
        }

        log_debug!(
            "[pre] Locked {} via {}",
            store.display(),
            lock_path.display()
        );
        Ok(StoreLock {
            file,
            store,
            lock_path,
        })
    }

    /// Canonical path of the guarded store.
    pub fn store(&self) -> &Path {
        &self.store
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            log_warn!("Failed to release lock on {}: {}", self.store.display(), e);
        }
    }
}

/// `<store dir>/.ticket-dispatch/<store file>.lock`
fn lock_path_for(store: &Path) -> Result<PathBuf, DispatchError> {
    match (store.parent(), store.file_name()) {
        (Some(dir), Some(name)) => {
            let mut file_name = name.to_os_string();
            file_name.push(".lock");
            Ok(dir.join(RUNTIME_DIR).join(file_name))
        }
        _ => Err(DispatchError::Lock(format!(
            "{} is not a ticket store file",
            store.display()
        ))),
    }
}

fn held_message(store: &Path, lock_path: &Path) -> String {
    let holder = fs::read_to_string(lock_path)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok());

    match holder {
        Some(pid) if is_pid_alive(pid) => format!(
            "Ticket store {} is already being dispatched by PID {}",
            store.display(),
            pid
        ),
        // flock dies with its process, so a dead holder means the record is stale
        Some(pid) => format!(
            "Ticket store {} is locked but its recorded dispatcher (PID {}) is gone. \
             Remove {} to recover",
            store.display(),
            pid,
            lock_path.display()
        ),
        None => format!(
            "Ticket store {} is already being dispatched by another process",
            store.display()
        ),
    }
}

fn is_pid_alive(pid: i32) -> bool {
    // signal 0 only checks existence
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "id,status\n").unwrap();
        path
    }

    #[test]
    fn pid_liveness() {
        assert!(is_pid_alive(std::process::id() as i32));
        assert!(!is_pid_alive(99_999_999));
    }

    #[test]
    fn same_store_is_claimed_once_and_names_the_holder() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), "tickets.csv");

        let guard = StoreLock::acquire(&store).unwrap();
        let err = StoreLock::acquire(&store).unwrap_err();

        assert!(err.is_fatal());
        let message = err.to_string();
        assert!(message.contains("tickets.csv"), "error: {}", message);
        assert!(
            message.contains(&format!("PID {}", std::process::id())),
            "error: {}",
            message
        );
        assert_eq!(guard.store(), store.canonicalize().unwrap().as_path());
    }

    #[test]
    fn different_spellings_of_one_store_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), "tickets.csv");
        fs::create_dir(dir.path().join("sub")).unwrap();
        let roundabout = dir.path().join("sub").join("..").join("tickets.csv");

        let _guard = StoreLock::acquire(&store).unwrap();
        assert!(StoreLock::acquire(&roundabout).is_err());
    }

    #[test]
    fn different_stores_in_one_directory_do_not_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let first = store_in(dir.path(), "tickets.csv");
        let second = store_in(dir.path(), "backlog.csv");

        let a = StoreLock::acquire(&first).unwrap();
        let b = StoreLock::acquire(&second).unwrap();

        assert_ne!(a.lock_path(), b.lock_path());
        let expected = dir
            .path()
            .canonicalize()
            .unwrap()
            .join(RUNTIME_DIR)
            .join("tickets.csv.lock");
        assert_eq!(a.lock_path(), expected.as_path());
    }

    #[test]
    fn dropping_the_guard_releases_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), "tickets.csv");

        drop(StoreLock::acquire(&store).unwrap());
        assert!(StoreLock::acquire(&store).is_ok());
    }

    #[test]
    fn missing_store_cannot_be_locked() {
        let dir = tempfile::tempdir().unwrap();
        let err = StoreLock::acquire(&dir.path().join("absent.csv")).unwrap_err();
        assert!(err.to_string().contains("Cannot resolve ticket store"));
    }
}

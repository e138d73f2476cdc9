//! Process lock file and singleton enforcement
//!
//! One orchestrator per project. The lock file records the owning pid; a
//! dead pid means a crashed predecessor, so the stale lock is removed and
//! the slot treated as free.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use steward_core::{Result, StewardError};
use tracing::{debug, info, warn};

/// Contents of the lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockFile {
    pub pid: i32,
    pub started_at: DateTime<Utc>,
    pub project_dir: PathBuf,
}

/// Probe a pid for liveness (signal-0 style)
///
/// "Process exists but no permission" still counts as alive.
pub fn pid_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Manager for the per-project lock file
pub struct LockManager {
    path: PathBuf,
    is_alive: fn(i32) -> bool,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            is_alive: pid_alive,
        }
    }

    /// Test constructor with an injected liveness probe
    pub fn with_liveness(path: impl Into<PathBuf>, is_alive: fn(i32) -> bool) -> Self {
        Self {
            path: path.into(),
            is_alive,
        }
    }

    /// Pid of a live instance holding the lock, if any
    ///
    /// A stale lock (dead pid or unreadable contents) is removed and the
    /// slot reported free.
    pub fn check_for_running_instance(&self) -> Result<Option<i32>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let lock: LockFile = match serde_json::from_str(&raw) {
            Ok(lock) => lock,
            Err(e) => {
                warn!("Removing unreadable lock file: {}", e);
                let _ = std::fs::remove_file(&self.path);
                return Ok(None);
            }
        };

        if (self.is_alive)(lock.pid) {
            debug!("Lock held by live pid {}", lock.pid);
            Ok(Some(lock.pid))
        } else {
            info!("Removing stale lock from dead pid {}", lock.pid);
            let _ = std::fs::remove_file(&self.path);
            Ok(None)
        }
    }

    /// Acquire the lock for this process, failing if a live instance holds it
    pub fn acquire(&self, project_dir: &Path) -> Result<()> {
        if let Some(pid) = self.check_for_running_instance()? {
            return Err(StewardError::AlreadyRunning(pid));
        }

        let lock = LockFile {
            pid: std::process::id() as i32,
            started_at: Utc::now(),
            project_dir: project_dir.to_path_buf(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&lock)?)?;
        info!("Acquired lock for pid {}", lock.pid);
        Ok(())
    }

    /// Remove the lock file (best-effort; shutdown path must not fail)
    pub fn release(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove lock file: {}", e);
            }
        }
    }
}

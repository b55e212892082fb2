//! Single-writer lock over a workspace directory.
//!
//! The lock is a JSON file (`{"runId", "acquiredAt"}`) under the workspace
//! state directory. Check-and-create happens while holding an advisory `fs2`
//! lock on a sidecar guard file, so two processes cannot both observe "no
//! lock" and create one.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LockConfig;

const LOCK_FILE: &str = "workspace.lock";
const GUARD_FILE: &str = "workspace.lock.guard";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceLockInfo {
    pub run_id: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("workspace is locked by run {run_id}")]
    Locked { run_id: String },

    #[error("lock file IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("lock file {0} is unreadable and not yet stale")]
    Corrupt(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LockError + '_ {
    move |source| LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Held lock. Released on [`WorkspaceLock::release`] or drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
    info: WorkspaceLockInfo,
    released: AtomicBool,
}

impl WorkspaceLock {
    pub fn lock_path(workspace_root: &Path, config: &LockConfig) -> PathBuf {
        workspace_root.join(&config.dir_name).join(LOCK_FILE)
    }

    /// Take the lock for `run_id`, clearing a stale lock first.
    pub fn acquire(workspace_root: &Path, run_id: &str, config: &LockConfig) -> Result<Self, LockError> {
        let path = Self::lock_path(workspace_root, config);
        let dir = path.parent().unwrap_or(workspace_root).to_path_buf();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let guard_path = dir.join(GUARD_FILE);
        let guard = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&guard_path)
            .map_err(io_err(&guard_path))?;
        guard.lock_exclusive().map_err(io_err(&guard_path))?;
        let result = Self::acquire_locked(&path, run_id, config.max_age);
        if let Err(e) = FileExt::unlock(&guard) {
            tracing::warn!("Failed to unlock {}: {}", guard_path.display(), e);
        }
        result
    }

    fn acquire_locked(path: &Path, run_id: &str, max_age: Duration) -> Result<Self, LockError> {
        match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<WorkspaceLockInfo>(&bytes) {
                Ok(existing) => {
                    let age = (Utc::now() - existing.acquired_at)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    if age < max_age {
                        return Err(LockError::Locked {
                            run_id: existing.run_id,
                        });
                    }
                    tracing::warn!(
                        "Removing stale workspace lock held by run {} ({}s old)",
                        existing.run_id,
                        age.as_secs()
                    );
                    remove_if_present(path)?;
                }
                Err(e) => {
                    let age = fs::metadata(path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                        .unwrap_or(Duration::ZERO);
                    if age < max_age {
                        return Err(LockError::Corrupt(path.to_path_buf()));
                    }
                    tracing::warn!("Removing stale unreadable workspace lock: {}", e);
                    remove_if_present(path)?;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(path)(e)),
        }

        let info = WorkspaceLockInfo {
            run_id: run_id.to_string(),
            acquired_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&info).map_err(|e| LockError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let run_id = read_info(path).map(|i| i.run_id).unwrap_or_else(|| "unknown".to_string());
                return Err(LockError::Locked { run_id });
            }
            Err(e) => return Err(io_err(path)(e)),
        };
        file.write_all(&body).map_err(io_err(path))?;
        file.sync_all().map_err(io_err(path))?;

        tracing::info!("Acquired workspace lock {} for run {}", path.display(), run_id);
        Ok(Self {
            path: path.to_path_buf(),
            info,
            released: AtomicBool::new(false),
        })
    }

    pub fn info(&self) -> &WorkspaceLockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the lock file if it still belongs to this run.
    ///
    /// Returns whether a file was removed. Calling it again is a no-op.
    pub fn release(&self) -> Result<bool, LockError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        match read_info(&self.path) {
            Some(current) if current.run_id == self.info.run_id => {
                remove_if_present(&self.path)?;
                tracing::info!("Released workspace lock for run {}", self.info.run_id);
                Ok(true)
            }
            Some(current) => {
                tracing::warn!(
                    "Workspace lock now belongs to run {}; leaving it in place",
                    current.run_id
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("Failed to release workspace lock on drop: {}", e);
        }
    }
}

fn read_info(path: &Path) -> Option<WorkspaceLockInfo> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn remove_if_present(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path)(e)),
    }
}

// ============================================================================
// Signal-driven release
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    /// Conventional `128 + signo` exit status.
    pub fn exit_code(&self) -> i32 {
        let signo = match self {
            ShutdownSignal::Interrupt => libc::SIGINT,
            ShutdownSignal::Terminate => libc::SIGTERM,
        };
        128 + signo
    }
}

type ShutdownHook = Box<dyn Fn(ShutdownSignal) + Send + Sync>;

/// Releases the lock on the first interrupt or termination signal.
pub struct ShutdownHandler {
    lock: Arc<WorkspaceLock>,
    hook: Option<ShutdownHook>,
    fired: AtomicBool,
}

impl ShutdownHandler {
    pub fn new(lock: Arc<WorkspaceLock>) -> Self {
        Self {
            lock,
            hook: None,
            fired: AtomicBool::new(false),
        }
    }

    pub fn with_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(ShutdownSignal) + Send + Sync + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Release path. Returns the exit code on the first call, `None` after.
    pub fn trigger(&self, signal: ShutdownSignal) -> Option<i32> {
        if self.fired.swap(true, Ordering::SeqCst) {
            return None;
        }
        tracing::warn!("Received {:?}; releasing workspace lock", signal);
        if let Err(e) = self.lock.release() {
            tracing::error!("Failed to release workspace lock: {}", e);
        }
        if let Some(hook) = &self.hook {
            hook(signal);
        }
        Some(signal.exit_code())
    }

    /// Listen for SIGINT/SIGTERM and exit after releasing the lock.
    pub fn register(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let signal = wait_for_signal().await;
                if let Some(code) = self.trigger(signal) {
                    std::process::exit(code);
                }
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> ShutdownSignal {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => tokio::select! {
            _ = tokio::signal::ctrl_c() => ShutdownSignal::Interrupt,
            _ = term.recv() => ShutdownSignal::Terminate,
        },
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            ShutdownSignal::Interrupt
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> ShutdownSignal {
    let _ = tokio::signal::ctrl_c().await;
    ShutdownSignal::Interrupt
}

//! Single-instance execution guard
//!
//! [`SingleInstance`] wraps an operation so that at most one process on the
//! machine runs it at a time for a given application name. The lock is a
//! sentinel file (JSON: pid, hostname, timestamp) in a shared lock
//! directory, claimed atomically: the sentinel is fully written to a staging
//! file and hard-linked into place, so a competitor can never observe a
//! half-written lock file.
//!
//! If the previous holder terminated without releasing the lock, the stale
//! sentinel is detected via PID liveness, cleared, and the whole acquisition
//! is re-attempted once through the configured [`RetryPolicy`]. A second
//! abandonment is fatal ([`Error::LockAbandoned`]).
//!
//! The guard is NOT reentrant within a process: a second call while the lock
//! is held observes its own live PID as a legitimate holder and returns
//! [`RunOutcome::Skipped`] once the acquisition timeout elapses.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::template::machine_name;
use crate::{AppIdentity, Error, Result, RetryPolicy, RunOutcome};

/// Default bounded wait for lock acquisition.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Age past which an unparsable lock file stops counting as a holder.
const UNREADABLE_STALE_AFTER: Duration = Duration::from_secs(5);

/// Derive a lock name from an application friendly name.
///
/// Path separators and colons are replaced with underscores so the name is
/// usable as a file name; the mapping is deterministic and keeps distinct
/// reasonable application names distinct.
pub fn lock_name(app_name: &str) -> String {
    app_name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect()
}

/// Sentinel written to the lock file to claim exclusive execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSentinel {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at_ms: u64,
    pub app: String,
}

impl LockSentinel {
    /// Sentinel for the current process.
    pub fn current(app: impl Into<String>) -> Self {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Self {
            pid: std::process::id(),
            hostname: machine_name(),
            acquired_at_ms: now,
            app: app.into(),
        }
    }

    /// Whether the holder recorded in this sentinel is still alive.
    ///
    /// A holder on a different host cannot be verified and is assumed alive.
    pub fn is_holder_alive(&self) -> bool {
        if self.hostname != machine_name() {
            return true;
        }
        is_pid_alive(self.pid)
    }
}

/// Check whether a PID is alive on the local system.
///
/// `/proc` existence is used as a safe alternative to `kill(pid, 0)`.
fn is_pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// RAII handle to a held lock; removes the sentinel file on drop.
#[derive(Debug)]
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "lock released"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to release lock"),
        }
    }
}

/// Result of a single acquisition attempt.
#[derive(Debug)]
enum Acquire {
    Acquired(LockGuard),
    Busy,
    Abandoned(LockSentinel),
}

/// Single-instance execution guard keyed by application name.
pub struct SingleInstance {
    name: String,
    path: PathBuf,
    timeout: Duration,
    retry: RetryPolicy,
    on_stop: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl std::fmt::Debug for SingleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleInstance")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SingleInstance {
    /// Guard for the given application, locking in the OS temp directory.
    pub fn new(app: &AppIdentity) -> Self {
        Self::with_lock_dir(app, std::env::temp_dir())
    }

    /// Guard for the given application with an explicit lock directory.
    pub fn with_lock_dir(app: &AppIdentity, dir: impl Into<PathBuf>) -> Self {
        let name = lock_name(&app.name);
        let path = dir.into().join(format!("{name}.lock"));
        Self {
            name,
            path,
            timeout: DEFAULT_ACQUIRE_TIMEOUT,
            // Abandoned-lock recovery re-attempts the whole acquisition
            // exactly once; the policy supplies the delay and the
            // exhaustion bookkeeping.
            retry: RetryPolicy::new(0, Duration::from_millis(50)),
            on_stop: None,
        }
    }

    /// Override the bounded acquisition wait.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the abandoned-lock recovery policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Cleanup hook invoked after the guarded operation stops, whether it
    /// completed or was cancelled. Runs before the lock is released.
    pub fn with_stop_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Arc::new(hook));
        self
    }

    /// Lock name derived from the application name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the sentinel lock file.
    pub fn lock_path(&self) -> &Path {
        &self.path
    }

    /// Run `op` if no other instance holds the lock.
    ///
    /// Waits up to the configured timeout for the lock. Returns
    /// [`RunOutcome::Skipped`] without running `op` when another live holder
    /// keeps the lock for the whole wait. The lock is always released on the
    /// way out, including when `op` returns an error or panics.
    pub fn run_once<F>(&self, op: F) -> Result<RunOutcome>
    where
        F: FnOnce() -> Result<()>,
    {
        match self.acquire_within()? {
            Acquire::Acquired(guard) => self.execute(op, guard),
            Acquire::Busy => Ok(RunOutcome::Skipped),
            Acquire::Abandoned(sentinel) => {
                self.recover(&sentinel)?;
                match self.reacquire_after_recovery()? {
                    Acquire::Acquired(guard) => self.execute(op, guard),
                    Acquire::Busy => Ok(RunOutcome::Skipped),
                    Acquire::Abandoned(again) => Err(self.abandoned_fatal(&again)),
                }
            }
        }
    }

    /// Async variant of [`SingleInstance::run_once`].
    ///
    /// The same one-at-a-time cross-process contract holds. `cancel` aborts
    /// the guarded operation: the operation future is dropped, the stop hook
    /// runs, the lock is released, and [`RunOutcome::Cancelled`] is returned.
    pub async fn run_once_async<F, Fut>(
        &self,
        op: F,
        cancel: CancellationToken,
    ) -> Result<RunOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        match self.acquire_within_async(&cancel).await? {
            Acquire::Acquired(guard) => self.execute_async(op, guard, &cancel).await,
            Acquire::Busy => Ok(RunOutcome::Skipped),
            Acquire::Abandoned(sentinel) => {
                self.recover(&sentinel)?;
                match self.reacquire_after_recovery_async(&cancel).await? {
                    Acquire::Acquired(guard) => self.execute_async(op, guard, &cancel).await,
                    Acquire::Busy => Ok(RunOutcome::Skipped),
                    Acquire::Abandoned(again) => Err(self.abandoned_fatal(&again)),
                }
            }
        }
    }

    /// Re-attempt acquisition through the retry policy after clearing an
    /// abandoned sentinel. Observing abandonment again fails the attempt;
    /// policy exhaustion is mapped to the fatal [`Error::LockAbandoned`].
    fn reacquire_after_recovery(&self) -> Result<Acquire> {
        self.retry
            .run(|| match self.acquire_within()? {
                Acquire::Abandoned(again) => Err(self.abandoned_fatal(&again)),
                other => Ok(other),
            })
            .map_err(|e| self.fatal_after_recovery(e))
    }

    async fn reacquire_after_recovery_async(&self, cancel: &CancellationToken) -> Result<Acquire> {
        self.retry
            .run_async(|| async move {
                match self.acquire_within_async(cancel).await? {
                    Acquire::Abandoned(again) => Err(self.abandoned_fatal(&again)),
                    other => Ok(other),
                }
            })
            .await
            .map_err(|e| self.fatal_after_recovery(e))
    }

    fn execute<F>(&self, op: F, guard: LockGuard) -> Result<RunOutcome>
    where
        F: FnOnce() -> Result<()>,
    {
        let result = op();
        if let Some(hook) = &self.on_stop {
            hook();
        }
        drop(guard);
        result.map(|()| RunOutcome::Completed)
    }

    async fn execute_async<F, Fut>(
        &self,
        op: F,
        guard: LockGuard,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let result = tokio::select! {
            res = op() => res.map(|()| RunOutcome::Completed),
            () = cancel.cancelled() => {
                debug!(lock = %self.name, "guarded operation cancelled");
                Ok(RunOutcome::Cancelled)
            }
        };

        if let Some(hook) = &self.on_stop {
            hook();
        }
        drop(guard);
        result
    }

    /// Poll for the lock until acquired, abandoned, or the timeout elapses.
    fn acquire_within(&self) -> Result<Acquire> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.try_acquire()? {
                Acquire::Busy if Instant::now() < deadline => {
                    std::thread::sleep(POLL_INTERVAL.min(self.timeout));
                }
                other => return Ok(other),
            }
        }
    }

    async fn acquire_within_async(&self, cancel: &CancellationToken) -> Result<Acquire> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.try_acquire()? {
                Acquire::Busy if Instant::now() < deadline => {
                    tokio::select! {
                        () = tokio::time::sleep(POLL_INTERVAL.min(self.timeout)) => {}
                        () = cancel.cancelled() => return Ok(Acquire::Busy),
                    }
                }
                other => return Ok(other),
            }
        }
    }

    /// Single acquisition attempt.
    fn try_acquire(&self) -> Result<Acquire> {
        let sentinel = LockSentinel::current(&self.name);
        let staging = self
            .path
            .with_file_name(format!("{}.claim-{}", self.name, sentinel.pid));
        let result = self.claim_with(&sentinel, &staging);
        let _ = std::fs::remove_file(&staging);
        result
    }

    /// Write the sentinel to a staging file and link it into place. The link
    /// either installs a complete sentinel or fails with `AlreadyExists`;
    /// there is no window in which the lock file exists but is empty.
    fn claim_with(&self, sentinel: &LockSentinel, staging: &Path) -> Result<Acquire> {
        let staged = std::fs::File::create(staging)?;
        serde_json::to_writer(&staged, sentinel)?;
        staged.sync_all()?;

        match std::fs::hard_link(staging, &self.path) {
            Ok(()) => {
                debug!(lock = %self.name, pid = sentinel.pid, "lock acquired");
                Ok(Acquire::Acquired(LockGuard {
                    path: self.path.clone(),
                }))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => self.inspect_holder(),
            Err(e) => Err(e.into()),
        }
    }

    /// Decide whether the existing sentinel belongs to a live holder.
    fn inspect_holder(&self) -> Result<Acquire> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            // Holder released between the create attempt and the read.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Acquire::Busy),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<LockSentinel>(&contents) {
            Ok(sentinel) if sentinel.is_holder_alive() => Ok(Acquire::Busy),
            Ok(sentinel) => Ok(Acquire::Abandoned(sentinel)),
            Err(e) => {
                // Not every writer of the lock path is this crate. A recent
                // unreadable file may be a holder still mid-write, so it is
                // waited out; only a stale one is cleared.
                if self.lock_file_is_fresh() {
                    return Ok(Acquire::Busy);
                }
                warn!(lock = %self.name, error = %e, "unreadable lock sentinel");
                Ok(Acquire::Abandoned(LockSentinel {
                    pid: 0,
                    hostname: machine_name(),
                    acquired_at_ms: 0,
                    app: self.name.clone(),
                }))
            }
        }
    }

    /// Whether the lock file was modified within the staleness threshold.
    fn lock_file_is_fresh(&self) -> bool {
        std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .map(|age| age < UNREADABLE_STALE_AFTER)
            .unwrap_or(false)
    }

    /// Clear an abandoned sentinel so acquisition can be re-attempted.
    fn recover(&self, sentinel: &LockSentinel) -> Result<()> {
        warn!(
            lock = %self.name,
            pid = sentinel.pid,
            hostname = %sentinel.hostname,
            "recovering abandoned lock"
        );
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn abandoned_fatal(&self, sentinel: &LockSentinel) -> Error {
        Error::LockAbandoned {
            lock: self.name.clone(),
            reason: format!(
                "lock abandoned again by pid {} after recovery",
                sentinel.pid
            ),
        }
    }

    /// Map retry exhaustion during recovery to the fatal abandonment error.
    fn fatal_after_recovery(&self, err: Error) -> Error {
        match err {
            Error::RetryExhausted { last, .. } => Error::LockAbandoned {
                lock: self.name.clone(),
                reason: last,
            },
            other => other,
        }
    }
}

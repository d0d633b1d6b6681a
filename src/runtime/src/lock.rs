//! Cross-process store locks.
//!
//! Each logical key maps to one lock file under the store's `locks/`
//! directory, locked with `flock(2)`. Locks belong to the open file, so two
//! guards for the same key conflict even inside one process.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use a3s_rootfs_core::error::{Result, RootfsError};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tokio_util::sync::CancellationToken;

/// Key guarding store-wide operations.
pub const GLOBAL_LOCK: &str = "global";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lock flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

impl LockMode {
    fn nonblocking_arg(self) -> FlockArg {
        match self {
            LockMode::Exclusive => FlockArg::LockExclusiveNonblock,
            LockMode::Shared => FlockArg::LockSharedNonblock,
        }
    }
}

/// Held lock. Released when dropped.
pub struct LockGuard {
    key: String,
    mode: LockMode,
    _lock: Flock<File>,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        tracing::trace!(key = %self.key, mode = ?self.mode, "Released lock");
    }
}

/// Hands out flock-based locks keyed by name.
#[derive(Debug, Clone)]
pub struct Locksmith {
    dir: PathBuf,
}

impl Locksmith {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| RootfsError::LockError {
            key: dir.display().to_string(),
            message: format!("failed to create lock directory: {}", e),
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Exclusive lock, waiting as long as it takes.
    pub async fn lock(&self, key: &str, cancel: &CancellationToken) -> Result<LockGuard> {
        self.acquire(key, LockMode::Exclusive, None, cancel).await
    }

    /// Shared lock, waiting as long as it takes.
    pub async fn shared_lock(&self, key: &str, cancel: &CancellationToken) -> Result<LockGuard> {
        self.acquire(key, LockMode::Shared, None, cancel).await
    }

    /// Lock that gives up with [`RootfsError::TimeoutError`] after `timeout`.
    pub async fn lock_with_timeout(
        &self,
        key: &str,
        mode: LockMode,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockGuard> {
        self.acquire(key, mode, Some(timeout), cancel).await
    }

    /// Single non-blocking attempt.
    pub fn try_lock(&self, key: &str, mode: LockMode) -> Result<Option<LockGuard>> {
        let path = self.lock_path(key);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| RootfsError::LockError {
                key: key.to_string(),
                message: format!("failed to open {}: {}", path.display(), e),
            })?;

        match Flock::lock(file, mode.nonblocking_arg()) {
            Ok(lock) => {
                tracing::trace!(key = %key, mode = ?mode, "Acquired lock");
                Ok(Some(LockGuard {
                    key: key.to_string(),
                    mode,
                    _lock: lock,
                }))
            }
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(RootfsError::LockError {
                key: key.to_string(),
                message: errno.desc().to_string(),
            }),
        }
    }

    async fn acquire(
        &self,
        key: &str,
        mode: LockMode,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<LockGuard> {
        let started = Instant::now();
        let mut logged_wait = false;

        loop {
            if let Some(guard) = self.try_lock(key, mode)? {
                return Ok(guard);
            }

            if let Some(timeout) = timeout {
                if started.elapsed() >= timeout {
                    return Err(RootfsError::TimeoutError(format!(
                        "waited {:?} for {:?} lock on {}",
                        timeout, mode, key
                    )));
                }
            }

            if !logged_wait {
                tracing::debug!(key = %key, mode = ?mode, "Waiting for lock");
                logged_wait = true;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RootfsError::Cancelled(format!("waiting for lock {}", key)));
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", key.replace('/', "__")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn locksmith(tmp: &TempDir) -> Locksmith {
        Locksmith::new(&tmp.path().join("locks")).unwrap()
    }

    #[tokio::test]
    async fn test_exclusive_blocks_second_holder() {
        let tmp = TempDir::new().unwrap();
        let locks = locksmith(&tmp);
        let cancel = CancellationToken::new();

        let _held = locks.lock("image:web", &cancel).await.unwrap();
        let err = locks
            .lock_with_timeout(
                "image:web",
                LockMode::Exclusive,
                Duration::from_millis(120),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RootfsError::TimeoutError(_)));
    }

    #[tokio::test]
    async fn test_shared_locks_coexist() {
        let tmp = TempDir::new().unwrap();
        let locks = locksmith(&tmp);
        let cancel = CancellationToken::new();

        let first = locks.shared_lock(GLOBAL_LOCK, &cancel).await.unwrap();
        let second = locks.shared_lock(GLOBAL_LOCK, &cancel).await.unwrap();
        assert_eq!(first.mode(), LockMode::Shared);
        assert_eq!(second.key(), GLOBAL_LOCK);

        assert!(locks.try_lock(GLOBAL_LOCK, LockMode::Exclusive).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let tmp = TempDir::new().unwrap();
        let locks = locksmith(&tmp);
        let cancel = CancellationToken::new();

        let guard = locks.lock("k", &cancel).await.unwrap();
        drop(guard);
        assert!(locks.try_lock("k", LockMode::Exclusive).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let tmp = TempDir::new().unwrap();
        let locks = locksmith(&tmp);
        let cancel = CancellationToken::new();

        let guard = locks.lock("k", &cancel).await.unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(guard);
        });

        let acquired = locks
            .lock_with_timeout("k", LockMode::Exclusive, Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert_eq!(acquired.key(), "k");
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting() {
        let tmp = TempDir::new().unwrap();
        let locks = locksmith(&tmp);
        let cancel = CancellationToken::new();

        let _held = locks.lock("k", &cancel).await.unwrap();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            trigger.cancel();
        });

        let err = locks.lock("k", &cancel).await.unwrap_err();
        assert!(matches!(err, RootfsError::Cancelled(_)));
    }

    #[test]
    fn test_keys_are_flat_files() {
        let tmp = TempDir::new().unwrap();
        let locks = locksmith(&tmp);
        let guard = locks.try_lock("image:my/app", LockMode::Shared).unwrap();
        assert!(guard.is_some());
        assert!(tmp.path().join("locks/image:my__app.lock").exists());
    }
}

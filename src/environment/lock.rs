// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Per-environment deploy locks
//!
//! Deploying to an environment is mutually exclusive across runs. A run that
//! finds the lock held queues behind the holder; tokio's mutex hands the lock
//! out in FIFO order within a process.
//!
//! Runs started by separate processes share a state directory. When the
//! table is given a lock directory, every acquire also takes an exclusive OS
//! file lock on `<dir>/<environment>.lock`, waiting while another process
//! holds it. The OS drops the lock if the holder dies.

use std::collections::HashMap;
use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::errors::DeployflowError;

/// Take an exclusive lock on `path`, creating it if needed
///
/// Waits while another process (or another open handle) holds the lock. The
/// lock is released when the returned file is dropped.
pub(crate) async fn lock_file(path: &Path) -> Result<File, DeployflowError> {
    let lock_error = |e: std::io::Error| DeployflowError::StateError {
        message: format!("Failed to lock {}: {}", path.display(), e),
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(lock_error)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(lock_error)?;

    match file.try_lock() {
        Ok(()) => return Ok(file),
        Err(TryLockError::WouldBlock) => {
            tracing::info!(path = %path.display(), "lock held by another process; waiting");
        }
        Err(TryLockError::Error(e)) => return Err(lock_error(e)),
    }

    tokio::task::spawn_blocking(move || file.lock().map(|()| file))
        .await
        .map_err(|e| DeployflowError::StateError {
            message: format!("Lock wait for {} aborted: {}", path.display(), e),
        })?
        .map_err(lock_error)
}

/// Named locks keyed by environment
#[derive(Debug, Default)]
pub struct DeployLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    dir: Option<PathBuf>,
}

/// Held while a run deploys to an environment
#[derive(Debug)]
pub struct DeployGuard {
    environment: String,
    _file: Option<File>,
    _guard: OwnedMutexGuard<()>,
}

impl DeployGuard {
    pub fn environment(&self) -> &str {
        &self.environment
    }
}

impl Drop for DeployGuard {
    fn drop(&mut self) {
        tracing::debug!(environment = %self.environment, "released deploy lock");
    }
}

impl DeployLocks {
    /// Locks shared only by executors in this process
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks shared with every process using the same lock directory
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            locks: Mutex::default(),
            dir: Some(dir.into()),
        }
    }

    async fn lock_for(&self, environment: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(environment.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire the deploy lock, waiting behind any current holder
    pub async fn acquire(
        &self,
        environment: &str,
        run_id: &str,
    ) -> Result<DeployGuard, DeployflowError> {
        let lock = self.lock_for(environment).await;

        let guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::info!(
                    environment,
                    run_id,
                    "another run is deploying; queued for the deploy lock"
                );
                lock.lock_owned().await
            }
        };

        let file = match &self.dir {
            Some(dir) => Some(lock_file(&dir.join(format!("{}.lock", environment))).await?),
            None => None,
        };

        tracing::debug!(environment, run_id, "acquired deploy lock");
        Ok(DeployGuard {
            environment: environment.to_string(),
            _file: file,
            _guard: guard,
        })
    }

    /// Whether some run in this process currently holds the lock
    pub async fn is_locked(&self, environment: &str) -> bool {
        let locks = self.locks.lock().await;
        locks
            .get(environment)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_second_acquire_waits() {
        let locks = Arc::new(DeployLocks::new());
        let first = locks.acquire("staging", "run-1").await.unwrap();
        assert!(locks.is_locked("staging").await);

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("staging", "run-2").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.environment(), "staging");
    }

    #[tokio::test]
    async fn test_environments_are_independent() {
        let locks = DeployLocks::new();
        let _staging = locks.acquire("staging", "run-1").await.unwrap();

        let production = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire("production", "run-2"),
        )
        .await;
        assert!(production.unwrap().is_ok());
        assert!(!locks.is_locked("qa").await);
    }

    #[tokio::test]
    async fn test_lock_dir_is_shared_between_tables() {
        // Two tables over one directory stand in for two processes
        let temp_dir = TempDir::new().unwrap();
        let first_process = DeployLocks::in_dir(temp_dir.path().join("locks"));
        let second_process = Arc::new(DeployLocks::in_dir(temp_dir.path().join("locks")));

        let held = first_process.acquire("staging", "run-1").await.unwrap();
        assert!(temp_dir.path().join("locks/staging.lock").exists());

        let waiter = {
            let locks = second_process.clone();
            tokio::spawn(async move { locks.acquire("staging", "run-2").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // Other environments are not blocked
        assert!(second_process.acquire("production", "run-3").await.is_ok());

        drop(held);
        let second = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.environment(), "staging");
    }
}

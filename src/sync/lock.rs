//! Workspace-scoped sync lock.
//!
//! At most one preview or execute runs per workspace. The lock is a row in
//! `sync_locks`; [`WorkspaceLock`] releases it when dropped, including when
//! the owning future is cancelled.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crate::storage::SqliteStorage;
use crate::sync::types::{SyncError, SyncResult};

/// Holds the sync lock for one workspace and the storage it was taken on.
#[derive(Debug)]
pub struct WorkspaceLock<'a> {
    storage: &'a mut SqliteStorage,
    workspace: String,
    owner: String,
}

impl<'a> WorkspaceLock<'a> {
    /// Take the lock, failing immediately if another run holds it.
    ///
    /// Locks older than `ttl` are treated as abandoned and taken over.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SyncInProgress`] if the lock is held.
    pub fn acquire(storage: &'a mut SqliteStorage, workspace: &str, ttl: Duration) -> SyncResult<Self> {
        let owner = uuid::Uuid::new_v4().to_string();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        if let Some(holder) = storage.try_acquire_sync_lock(workspace, &owner, ttl_ms)? {
            return Err(SyncError::SyncInProgress {
                workspace: workspace.to_string(),
                owner: holder,
            });
        }
        tracing::debug!(workspace, owner = %owner, "Sync lock acquired");

        Ok(Self {
            storage,
            workspace: workspace.to_string(),
            owner,
        })
    }

    /// Owner token recorded in the lock row, also used as the audit actor.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[must_use]
    pub fn workspace(&self) -> &str {
        &self.workspace
    }
}

impl Deref for WorkspaceLock<'_> {
    type Target = SqliteStorage;

    fn deref(&self) -> &SqliteStorage {
        self.storage
    }
}

impl DerefMut for WorkspaceLock<'_> {
    fn deref_mut(&mut self) -> &mut SqliteStorage {
        self.storage
    }
}

impl Drop for WorkspaceLock<'_> {
    fn drop(&mut self) {
        match self.storage.release_sync_lock(&self.workspace, &self.owner) {
            Ok(()) => tracing::debug!(workspace = %self.workspace, "Sync lock released"),
            // The row expires after its TTL, so a failed release is recoverable
            Err(e) => tracing::warn!(workspace = %self.workspace, error = %e, "Failed to release sync lock"),
        }
    }
}

//! Git sync operations.
//!
//! This module mirrors platform entities and workspace files into a Git
//! branch and back:
//!
//! - **Refs**: workflow UUIDs ⇄ portable `path::function` references
//! - **Virtual files**: entities presented as canonical JSON files
//! - **Hashing**: Git blob hashing for change detection
//! - **Preview**: classify every path against the remote tree
//! - **Execute**: push and pull the paths an operator selected
//!
//! # Architecture
//!
//! The hash recorded at the last successful push or pull is the merge base
//! for three-way classification. SQLite triggers mark entities dirty on
//! every edit, so clean entities are classified from their stored hash
//! without serializing them. A preview's remote hashes are re-checked at
//! execute time, and the branch itself only moves by fast-forward.
//!
//! # Example
//!
//! ```ignore
//! use psync::sync::{execute, preview, SyncExecuteRequest, SyncOptions};
//!
//! let plan = preview(&mut storage, &host, &options).await?;
//! let request = SyncExecuteRequest {
//!     push_paths: plan.paths_with(SyncStatus::ToPush).map(String::from).collect(),
//!     ..Default::default()
//! };
//! let result = execute(&mut storage, &host, &options, Some(&plan), &request).await?;
//! ```

mod executor;
mod hash;
mod lock;
mod preview;
pub mod refs;
pub mod remote;
pub mod resolver;
mod types;
pub mod virtual_files;

use std::time::Duration;

use crate::config::SyncSettings;
use crate::storage::SqliteStorage;

// Re-export main types and functions
pub use executor::{PullOutcome, PushOutcome, SyncExecutor};
pub use hash::{blob_hash, has_changed};
pub use lock::WorkspaceLock;
pub use preview::{classify, SyncPreviewEngine};
pub use refs::{build_ref_map, to_internal, to_portable, WorkflowRefMap};
pub use remote::{GitHost, GitHubHost, RemoteError, RemoteTree, RetryPolicy, Retrying};
pub use resolver::{rank_candidates, Candidate, IdentityMatch};
pub use types::{
    AdoptedEntity, IdentityResolution, PathFailure, Resolution, ResolvedPlan, SyncEntry,
    SyncError, SyncExecuteRequest, SyncExecuteResult, SyncPlan, SyncResult, SyncStatus,
    UnresolvedRef,
};
pub use virtual_files::{deserialize_entity, serialize_entity, VirtualFile, VirtualFileProvider};

/// Per-run knobs shared by preview and execute.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Lock scope; one run per workspace at a time.
    pub workspace: String,
    /// Age after which a held lock counts as abandoned.
    pub lock_ttl: Duration,
    /// Worker threads for hashing entities during preview.
    pub hash_workers: usize,
    /// Recorded on audit events written by the run.
    pub actor: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            workspace: "default".to_string(),
            lock_ttl: Duration::from_secs(600),
            hash_workers: 4,
            actor: "psync".to_string(),
        }
    }
}

impl SyncOptions {
    #[must_use]
    pub fn from_settings(settings: &SyncSettings, actor: &str) -> Self {
        Self {
            workspace: settings.workspace.clone(),
            lock_ttl: Duration::from_secs(settings.lock_ttl_secs),
            hash_workers: settings.hash_workers,
            actor: actor.to_string(),
        }
    }
}

/// Compute a sync plan under the workspace lock.
///
/// # Errors
///
/// Returns [`SyncError::SyncInProgress`] if another run holds the lock, or
/// any error from reading local state or the remote tree.
pub async fn preview<H: GitHost>(
    storage: &mut SqliteStorage,
    host: &H,
    options: &SyncOptions,
) -> SyncResult<SyncPlan> {
    let lock = WorkspaceLock::acquire(storage, &options.workspace, options.lock_ttl)?;
    SyncPreviewEngine::new(&lock, host)
        .with_workers(options.hash_workers)
        .preview()
        .await
}

/// Execute a request under the workspace lock.
///
/// Without a saved `plan`, a fresh preview is computed first (under the same
/// lock), so nothing can be stale.
///
/// # Errors
///
/// Returns [`SyncError::SyncInProgress`] if another run holds the lock, or
/// an error if the remote tree cannot be fetched. Per-path failures are in
/// the result.
pub async fn execute<H: GitHost>(
    storage: &mut SqliteStorage,
    host: &H,
    options: &SyncOptions,
    plan: Option<&SyncPlan>,
    request: &SyncExecuteRequest,
) -> SyncResult<SyncExecuteResult> {
    let mut lock = WorkspaceLock::acquire(storage, &options.workspace, options.lock_ttl)?;

    let fresh;
    let plan = match plan {
        Some(plan) => plan,
        None => {
            fresh = SyncPreviewEngine::new(&lock, host)
                .with_workers(options.hash_workers)
                .preview()
                .await?;
            &fresh
        }
    };

    SyncExecutor::new(&mut lock, host, &options.actor)
        .execute(plan, request)
        .await
}

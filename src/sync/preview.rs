//! Sync preview: classify every path against the remote tree.
//!
//! The local side is the union of workspace files (hash tracked directly)
//! and virtual files (stored hash when current, otherwise serialized and
//! hashed). Each path is classified by comparing local, stored and remote
//! hashes, with the stored hash as the three-way merge base.
//!
//! Preview never mutates entity or sync state.

use std::collections::BTreeMap;

use crate::storage::SqliteStorage;
use crate::sync::refs::build_ref_map;
use crate::sync::remote::{GitHost, RemoteTree};
use crate::sync::types::{SyncEntry, SyncPlan, SyncResult, SyncStatus};
use crate::sync::virtual_files::{VirtualFile, VirtualFileProvider};

/// Classify one path from its `(local, stored, remote)` hashes.
#[must_use]
pub fn classify(local: Option<&str>, stored: Option<&str>, remote: Option<&str>) -> SyncStatus {
    match (local, remote) {
        (Some(_), None) => SyncStatus::ToPush,
        (None, Some(_)) => SyncStatus::ToPull,
        (None, None) => SyncStatus::Unchanged,
        (Some(l), Some(r)) if l == r => SyncStatus::Unchanged,
        (Some(l), Some(r)) => match stored {
            Some(s) if r == s => SyncStatus::ToPush,
            Some(s) if l == s => SyncStatus::ToPull,
            _ => SyncStatus::Conflict,
        },
    }
}

/// Local view of one path.
#[derive(Debug, Clone)]
struct LocalPath {
    hash: String,
    stored: Option<String>,
    entity_id: Option<String>,
}

/// Computes sync plans.
pub struct SyncPreviewEngine<'a, H> {
    storage: &'a SqliteStorage,
    host: &'a H,
    workers: usize,
}

impl<'a, H: GitHost> SyncPreviewEngine<'a, H> {
    #[must_use]
    pub const fn new(storage: &'a SqliteStorage, host: &'a H) -> Self {
        Self {
            storage,
            host,
            workers: 1,
        }
    }

    /// Bound the worker pool used to hash entities without a current
    /// stored hash.
    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = if workers == 0 { 1 } else { workers };
        self
    }

    /// Fetch the remote tree and classify every local and remote path.
    ///
    /// # Errors
    ///
    /// Returns an error if local state cannot be read or the remote tree
    /// cannot be fetched.
    pub async fn preview(&self) -> SyncResult<SyncPlan> {
        let remote = self.host.fetch_tree().await?;
        self.preview_against(&remote)
    }

    /// Classify against an already fetched remote tree.
    ///
    /// # Errors
    ///
    /// Returns an error if local state cannot be read or serialized.
    pub fn preview_against(&self, remote: &RemoteTree) -> SyncResult<SyncPlan> {
        let map = build_ref_map(&self.storage.list_workflows()?);
        let provider = VirtualFileProvider::new(self.storage, &map).with_workers(self.workers);

        let mut virtual_files = provider.list_all(false)?;
        let stale = virtual_files
            .iter()
            .filter(|f| !f.stored_hash_is_current())
            .count();
        if stale > 0 {
            tracing::debug!(count = stale, "Hashing entities without a current stored hash");
        }
        provider.materialize(&mut virtual_files, |f| !f.stored_hash_is_current())?;

        let local = self.local_paths(&virtual_files)?;
        let mut entries: Vec<SyncEntry> = Vec::with_capacity(local.len() + remote.blobs.len());

        for (path, state) in &local {
            let remote_hash = remote.blobs.get(path).map(String::as_str);
            let status = classify(Some(&state.hash), state.stored.as_deref(), remote_hash);
            tracing::debug!(path = %path, status = %status, "Classified");
            entries.push(SyncEntry {
                path: path.clone(),
                local_hash: Some(state.hash.clone()),
                stored_hash: state.stored.clone(),
                remote_hash: remote_hash.map(ToString::to_string),
                status,
                entity_id: state.entity_id.clone(),
            });
        }

        let orphans = orphaned_paths(&virtual_files, &local);
        for (path, remote_hash) in &remote.blobs {
            if local.contains_key(path) {
                continue;
            }
            let entry = match orphans.get(path.as_str()) {
                Some(file) => orphan_entry(path, file, remote_hash),
                None => SyncEntry {
                    path: path.clone(),
                    local_hash: None,
                    stored_hash: None,
                    remote_hash: Some(remote_hash.clone()),
                    status: SyncStatus::ToPull,
                    entity_id: None,
                },
            };
            entries.push(entry);
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(SyncPlan {
            remote_commit: remote.commit.clone(),
            entries,
        })
    }

    fn local_paths(&self, virtual_files: &[VirtualFile]) -> SyncResult<BTreeMap<String, LocalPath>> {
        let mut local = BTreeMap::new();

        for file in self.storage.list_workspace_files()? {
            local.insert(
                file.path,
                LocalPath {
                    hash: file.content_hash,
                    stored: file.last_synced_hash,
                    entity_id: None,
                },
            );
        }

        for file in virtual_files {
            let Some(hash) = file.local_hash() else {
                continue;
            };
            let state = LocalPath {
                hash: hash.to_string(),
                stored: file.stored_hash.clone(),
                entity_id: Some(file.entity.id.clone()),
            };
            if local.insert(file.path.clone(), state).is_some() {
                tracing::warn!(path = %file.path, "Workspace file shadowed by an entity with the same path");
            }
        }

        Ok(local)
    }
}

/// Old paths of entities whose path changed since their last sync
/// (application slug renames), unless the old path is in use locally.
fn orphaned_paths<'f>(
    virtual_files: &'f [VirtualFile],
    local: &BTreeMap<String, LocalPath>,
) -> BTreeMap<&'f str, &'f VirtualFile> {
    let mut orphans = BTreeMap::new();
    for file in virtual_files {
        if let Some(old) = file.entity.last_synced_path.as_deref() {
            if old != file.path && !local.contains_key(old) {
                orphans.entry(old).or_insert(file);
            }
        }
    }
    orphans
}

/// An orphan still holding the content we last synced can be deleted.
/// If someone changed it remotely since, it is a conflict.
fn orphan_entry(path: &str, file: &VirtualFile, remote_hash: &str) -> SyncEntry {
    let stored = file.entity.last_synced_hash.clone();
    let status = if stored.as_deref() == Some(remote_hash) {
        SyncStatus::ToDelete
    } else {
        SyncStatus::Conflict
    };
    SyncEntry {
        path: path.to_string(),
        local_hash: None,
        stored_hash: stored,
        remote_hash: Some(remote_hash.to_string()),
        status,
        entity_id: Some(file.entity.id.clone()),
    }
}

//! Sync execution: apply the operator's choices from a preview.
//!
//! Push builds one commit for every pushed path and fast-forwards the branch;
//! synced hashes are recorded only after the branch update succeeds. Pull
//! imports each path in its own transaction, so one bad file never blocks
//! the rest.

use std::collections::BTreeSet;

use crate::model::{EntityKind, PathKey};
use crate::storage::{EntityImport, SqliteStorage, SyncedRecord};
use crate::sync::hash::blob_hash;
use crate::sync::refs::{build_ref_map, to_internal, WorkflowRefMap};
use crate::sync::remote::{GitHost, RemoteError, RemoteTree, TreeChange};
use crate::sync::resolver::{resolve_conflicts, resolve_identity, IdentityMatch};
use crate::sync::types::{
    AdoptedEntity, PathFailure, SyncEntry, SyncError, SyncExecuteRequest, SyncExecuteResult,
    SyncPlan, SyncResult, SyncStatus, UnresolvedRef,
};
use crate::sync::virtual_files::{deserialize_entity, VirtualFileProvider};

/// Result of a push.
#[derive(Debug, Default)]
pub struct PushOutcome {
    pub pushed: Vec<String>,
    pub failed: Vec<PathFailure>,
    pub commit: Option<String>,
}

/// Result of a pull.
#[derive(Debug, Default)]
pub struct PullOutcome {
    pub pulled: Vec<String>,
    pub failed: Vec<PathFailure>,
    pub adopted: Vec<AdoptedEntity>,
    pub unresolved_refs: Vec<UnresolvedRef>,
}

/// Where a pushed path's content came from.
enum Source {
    Entity {
        id: String,
        dirty_version: Option<i64>,
    },
    File,
    /// Orphan left by a slug rename.
    Delete,
}

struct StagedPath {
    path: String,
    content: Vec<u8>,
    source: Source,
}

impl StagedPath {
    fn record(&self, hash: &str) -> Option<SyncedRecord> {
        match &self.source {
            Source::Entity { id, dirty_version } => Some(SyncedRecord::Entity {
                id: id.clone(),
                hash: hash.to_string(),
                path: self.path.clone(),
                dirty_version: *dirty_version,
            }),
            Source::File => Some(SyncedRecord::File {
                path: self.path.clone(),
                hash: hash.to_string(),
            }),
            Source::Delete => None,
        }
    }
}

#[derive(Default)]
struct Applied {
    adopted: Option<AdoptedEntity>,
    unresolved: Vec<String>,
}

/// Applies push and pull operations for one sync run.
pub struct SyncExecutor<'a, H> {
    storage: &'a mut SqliteStorage,
    host: &'a H,
    actor: String,
}

impl<'a, H: GitHost> SyncExecutor<'a, H> {
    pub fn new(storage: &'a mut SqliteStorage, host: &'a H, actor: &str) -> Self {
        Self {
            storage,
            host,
            actor: actor.to_string(),
        }
    }

    /// Execute a request against the plan it was made from.
    ///
    /// The remote tree is fetched again first. Any requested path whose
    /// remote hash moved since the preview is reported as a conflict and
    /// left alone.
    ///
    /// # Errors
    ///
    /// Returns an error only if the remote tree or local workflows cannot be
    /// read; per-path problems are reported in the result.
    pub async fn execute(
        &mut self,
        plan: &SyncPlan,
        request: &SyncExecuteRequest,
    ) -> SyncResult<SyncExecuteResult> {
        let mut result = SyncExecuteResult::default();
        let mut resolved = resolve_conflicts(plan, request);
        for path in &resolved.unresolved {
            result.add_conflict(path);
        }

        let fresh = self.host.fetch_tree().await?;
        if fresh.commit != plan.remote_commit {
            tracing::debug!(
                planned = ?plan.remote_commit,
                current = ?fresh.commit,
                "Remote moved since preview; checking requested paths"
            );
        }

        let requested: Vec<String> = resolved.push.iter().chain(&resolved.pull).cloned().collect();
        for path in requested {
            let keep = match plan.entry(&path) {
                None => {
                    let err = SyncError::UnknownPath(format!("{path} is not part of the preview"));
                    result.failed.push(PathFailure::new(&path, &err));
                    false
                }
                Some(entry) if fresh.blobs.get(&path) != entry.remote_hash.as_ref() => {
                    let err = SyncError::StalePreview { path: path.clone() };
                    tracing::warn!(path = %path, "{err}; excluded");
                    result.add_conflict(&path);
                    false
                }
                Some(_) => true,
            };
            if !keep {
                resolved.push.remove(&path);
                resolved.pull.remove(&path);
            }
        }

        let pushed = self.push(&resolved.push, plan, &fresh).await?;
        result.pushed = pushed.pushed;
        result.failed.extend(pushed.failed);
        result.commit = pushed.commit;

        let pulled = self.pull(&resolved.pull, &fresh, request).await?;
        result.pulled = pulled.pulled;
        result.failed.extend(pulled.failed);
        result.adopted = pulled.adopted;
        result.unresolved_refs = pulled.unresolved_refs;

        tracing::info!(
            pushed = result.pushed.len(),
            pulled = result.pulled.len(),
            failed = result.failed.len(),
            conflicts = result.conflicts.len(),
            "Sync executed"
        );
        Ok(result)
    }

    /// Push `paths` as one commit on top of `remote`.
    ///
    /// Either every readable path lands in the commit and is recorded, or
    /// (on any remote failure) all of them fail and nothing is recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if local workflows cannot be read.
    pub async fn push(
        &mut self,
        paths: &BTreeSet<String>,
        plan: &SyncPlan,
        remote: &RemoteTree,
    ) -> SyncResult<PushOutcome> {
        let mut outcome = PushOutcome::default();
        if paths.is_empty() {
            return Ok(outcome);
        }

        let staged = self.stage(paths, plan, &mut outcome.failed)?;
        if staged.is_empty() {
            return Ok(outcome);
        }

        let (commit, records) = match self.commit(&staged, remote).await {
            Ok(committed) => committed,
            Err(e) => {
                tracing::error!(error = %e, paths = staged.len(), "Push failed; nothing recorded");
                let err = SyncError::Remote(e);
                outcome
                    .failed
                    .extend(staged.iter().map(|s| PathFailure::new(&s.path, &err)));
                return Ok(outcome);
            }
        };

        if let Err(e) = self.storage.record_synced(&records, &self.actor) {
            // The commit is on the branch; the next preview sees these paths
            // as unchanged or to_push again.
            tracing::error!(commit = %commit, error = %e, "Pushed but failed to record synced hashes");
            let err = SyncError::Database(format!("pushed in {commit} but not recorded: {e}"));
            outcome
                .failed
                .extend(staged.iter().map(|s| PathFailure::new(&s.path, &err)));
            outcome.commit = Some(commit);
            return Ok(outcome);
        }

        for item in &staged {
            tracing::info!(path = %item.path, commit = %commit, "Pushed");
        }
        outcome.pushed = staged.into_iter().map(|s| s.path).collect();
        outcome.commit = Some(commit);
        Ok(outcome)
    }

    fn stage(
        &self,
        paths: &BTreeSet<String>,
        plan: &SyncPlan,
        failed: &mut Vec<PathFailure>,
    ) -> SyncResult<Vec<StagedPath>> {
        let map = build_ref_map(&self.storage.list_workflows()?);
        let provider = VirtualFileProvider::new(&*self.storage, &map);

        let mut staged = Vec::with_capacity(paths.len());
        for path in paths {
            let orphan = match plan.entry(path) {
                Some(entry) => self.is_orphan(entry, path)?,
                None => false,
            };
            if orphan {
                staged.push(StagedPath {
                    path: path.clone(),
                    content: Vec::new(),
                    source: Source::Delete,
                });
                continue;
            }

            match self.read_local(&provider, path) {
                Ok(item) => staged.push(item),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Cannot read local content");
                    failed.push(PathFailure::new(path, &e));
                }
            }
        }
        Ok(staged)
    }

    /// An entry with no local content whose entity now lives elsewhere is an
    /// old path left by a rename. Pushing it, whether planned as a delete or
    /// kept local over a remote edit, removes it.
    fn is_orphan(&self, entry: &SyncEntry, path: &str) -> SyncResult<bool> {
        if entry.status == SyncStatus::ToDelete {
            return Ok(true);
        }
        let Some(id) = entry.entity_id.as_deref() else {
            return Ok(false);
        };
        if entry.local_hash.is_some() {
            return Ok(false);
        }
        Ok(self
            .storage
            .get_entity(id)?
            .is_none_or(|entity| entity.path() != path))
    }

    /// Entities win over workspace files at the same path, as in preview.
    fn read_local(&self, provider: &VirtualFileProvider<'_>, path: &str) -> SyncResult<StagedPath> {
        match provider.get_content(path) {
            Ok((content, entity)) => Ok(StagedPath {
                path: path.to_string(),
                content,
                source: Source::Entity {
                    id: entity.id,
                    dirty_version: entity.dirty_version,
                },
            }),
            Err(SyncError::UnknownPath(_) | SyncError::NotFound(_)) => {
                let file = self
                    .storage
                    .get_workspace_file(path)?
                    .ok_or_else(|| SyncError::UnknownPath(path.to_string()))?;
                Ok(StagedPath {
                    path: path.to_string(),
                    content: file.content,
                    source: Source::File,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn commit(
        &self,
        staged: &[StagedPath],
        remote: &RemoteTree,
    ) -> Result<(String, Vec<SyncedRecord>), RemoteError> {
        let mut changes = Vec::with_capacity(staged.len());
        let mut records = Vec::with_capacity(staged.len());

        for item in staged {
            let blob = if matches!(item.source, Source::Delete) {
                None
            } else {
                let sha = self.host.create_blob(&item.content).await?;
                let local = blob_hash(&item.content);
                if sha != local {
                    tracing::warn!(path = %item.path, local = %local, remote = %sha, "Remote blob hash differs from local hash");
                }
                records.extend(item.record(&sha));
                Some(sha)
            };
            changes.push(TreeChange {
                path: item.path.clone(),
                blob,
            });
        }

        let tree = self.host.create_tree(remote.tree.as_deref(), &changes).await?;
        let parents: Vec<String> = remote.commit.iter().cloned().collect();
        let message = commit_message(&changes);
        let commit = self.host.create_commit(&message, &tree, &parents).await?;
        self.host.update_ref(remote.commit.as_deref(), &commit).await?;
        Ok((commit, records))
    }

    /// Pull `paths` from `remote`, one transaction per path.
    ///
    /// # Errors
    ///
    /// Returns an error if local workflows cannot be read.
    pub async fn pull(
        &mut self,
        paths: &BTreeSet<String>,
        remote: &RemoteTree,
        request: &SyncExecuteRequest,
    ) -> SyncResult<PullOutcome> {
        let mut outcome = PullOutcome::default();
        if paths.is_empty() {
            return Ok(outcome);
        }
        let map = build_ref_map(&self.storage.list_workflows()?);

        for path in paths {
            let Some(sha) = remote.blobs.get(path) else {
                let err = SyncError::NotFound(format!("{path} is not in the remote tree"));
                outcome.failed.push(PathFailure::new(path, &err));
                continue;
            };

            let content = match self.host.fetch_blob(sha).await {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Failed to fetch remote content");
                    outcome.failed.push(PathFailure::new(path, &SyncError::Remote(e)));
                    continue;
                }
            };

            match self.apply_pulled(path, sha, &content, &map, request) {
                Ok(applied) => {
                    tracing::info!(path = %path, hash = %sha, "Pulled");
                    outcome.pulled.push(path.clone());
                    outcome.adopted.extend(applied.adopted);
                    outcome
                        .unresolved_refs
                        .extend(applied.unresolved.into_iter().map(|portable_ref| UnresolvedRef {
                            path: path.clone(),
                            portable_ref,
                        }));
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Pull failed for path");
                    let failure = PathFailure::new(path, &e);
                    let failure = match e {
                        SyncError::MalformedContent { .. } | SyncError::MalformedPayload { .. } => {
                            failure.with_remote_content(&content)
                        }
                        _ => failure,
                    };
                    outcome.failed.push(failure);
                }
            }
        }

        Ok(outcome)
    }

    fn apply_pulled(
        &mut self,
        path: &str,
        sha: &str,
        content: &[u8],
        map: &WorkflowRefMap,
        request: &SyncExecuteRequest,
    ) -> SyncResult<Applied> {
        let Some((kind, key)) = EntityKind::parse_path(path) else {
            self.storage
                .import_workspace_file(path, content, sha, &self.actor)?;
            return Ok(Applied::default());
        };

        let doc = deserialize_entity(path, content)?;
        let (payload, unresolved) = match &doc.export {
            Some(meta) => {
                let ref_paths: Vec<&str> = meta.ref_paths.iter().map(String::as_str).collect();
                to_internal(&doc.payload, &ref_paths, map)?
            }
            None => (doc.payload.clone(), Vec::new()),
        };

        let matched = resolve_identity(
            &*self.storage,
            path,
            &doc,
            request.identity_resolutions.get(path),
            request.allow_name_matching,
        )?;

        let slug = match key {
            PathKey::Slug(slug) => {
                if doc.slug.as_ref().is_some_and(|s| *s != slug) {
                    tracing::warn!(path, "Document slug differs from its path; using the path");
                }
                Some(slug)
            }
            PathKey::Id(_) => None,
        };

        let import = EntityImport {
            id: matched.id(),
            kind,
            name: &doc.name,
            slug: slug.as_deref(),
            payload: &payload,
            synced_hash: sha,
            synced_path: path,
            adopted: matched.is_adopted(),
        };
        let created = self.storage.import_entity(&import, &self.actor)?;
        tracing::debug!(path, id = matched.id(), created, "Imported entity");

        let adopted = match matched {
            IdentityMatch::Adopted {
                local_id,
                incoming_id,
            } => Some(AdoptedEntity {
                path: path.to_string(),
                local_id,
                incoming_id,
            }),
            _ => None,
        };
        Ok(Applied {
            adopted,
            unresolved,
        })
    }
}

fn commit_message(changes: &[TreeChange]) -> String {
    let deleted = changes.iter().filter(|c| c.blob.is_none()).count();
    let updated = changes.len() - deleted;
    let mut message = format!("psync: update {updated} path(s)");
    if deleted > 0 {
        message.push_str(&format!(", delete {deleted}"));
    }
    message.push_str("\n\n");
    for change in changes {
        let verb = if change.blob.is_some() { "update" } else { "delete" };
        message.push_str(&format!("{verb} {}\n", change.path));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlatformEntity;
    use crate::storage::events::EventType;
    use crate::sync::remote::testing::MemoryGitHost;
    use crate::sync::types::{IdentityResolution, Resolution};
    use crate::sync::{execute, preview, SyncOptions};
    use serde_json::json;
    use tempfile::TempDir;

    const BILLING: &str = "6b1c0a52-8f0e-4f6e-9d57-3f3b8a1d2c10";

    fn options() -> SyncOptions {
        SyncOptions {
            hash_workers: 2,
            ..SyncOptions::default()
        }
    }

    fn seeded() -> (SqliteStorage, PlatformEntity) {
        let mut storage = SqliteStorage::open_memory().unwrap();
        storage
            .upsert_workflow(Some(BILLING), "workflows/billing.py", "charge", "test")
            .unwrap();
        storage
            .put_workspace_file("workflows/billing.py", b"def charge():\n    pass\n", "test")
            .unwrap();
        let form = PlatformEntity::new(
            EntityKind::Form,
            "Intake".into(),
            json!({"workflow_id": BILLING, "fields": []}),
        );
        storage.create_entity(&form, "test").unwrap();
        (storage, form)
    }

    fn push_all(plan: &SyncPlan) -> SyncExecuteRequest {
        SyncExecuteRequest {
            push_paths: plan
                .entries
                .iter()
                .filter(|e| matches!(e.status, SyncStatus::ToPush | SyncStatus::ToDelete))
                .map(|e| e.path.clone())
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_export() {
        let (mut storage, form) = seeded();
        let host = MemoryGitHost::new();

        let plan = preview(&mut storage, &host, &options()).await.unwrap();
        assert_eq!(plan.counts()["to_push"], 2);

        let result = execute(&mut storage, &host, &options(), Some(&plan), &push_all(&plan))
            .await
            .unwrap();
        assert!(result.is_complete(), "{result:?}");
        assert_eq!(result.pushed.len(), 2);
        assert_eq!(result.commit, host.head());

        let content = String::from_utf8(host.file(&form.path()).unwrap()).unwrap();
        assert!(content.contains("workflows/billing.py::charge"));
        assert!(!content.contains(BILLING));

        let stored = storage.get_entity(&form.id).unwrap().unwrap();
        assert!(!stored.is_dirty());
        assert_eq!(stored.last_synced_path.as_deref(), Some(form.path().as_str()));

        let again = preview(&mut storage, &host, &options()).await.unwrap();
        assert!(again.is_clean(), "{:?}", again.entries);
    }

    #[tokio::test]
    async fn test_partial_pull_failure() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let host = MemoryGitHost::new();

        let good = uuid::Uuid::new_v4().to_string();
        let bad = uuid::Uuid::new_v4().to_string();
        let good_path = EntityKind::Form.path_for(&good);
        let bad_path = EntityKind::Form.path_for(&bad);
        host.put_file(
            &good_path,
            format!("{{\"id\": \"{good}\", \"name\": \"Good\", \"fields\": []}}\n").as_bytes(),
        );
        host.put_file(&bad_path, b"{\"id\": \"oops\", \"name\": ");
        host.put_file("workflows/billing.py", b"def charge(): pass\n");

        let plan = preview(&mut storage, &host, &options()).await.unwrap();
        let request = SyncExecuteRequest {
            pull_paths: plan.paths_with(SyncStatus::ToPull).map(ToString::to_string).collect(),
            ..Default::default()
        };
        assert_eq!(request.pull_paths.len(), 3);

        let result = execute(&mut storage, &host, &options(), Some(&plan), &request)
            .await
            .unwrap();
        assert_eq!(result.pulled.len(), 2);
        assert_eq!(result.failed.len(), 1);
        let failure = &result.failed[0];
        assert_eq!(failure.path, bad_path);
        assert!(failure.remote_content.as_deref().unwrap().contains("oops"));

        assert!(storage.get_entity(&good).unwrap().is_some());
        assert!(storage.get_entity(&bad).unwrap().is_none());
        assert!(storage.get_workspace_file("workflows/billing.py").unwrap().is_some());

        // Good paths settle; the failed one stays pending
        let again = preview(&mut storage, &host, &options()).await.unwrap();
        assert_eq!(again.entry(&good_path).unwrap().status, SyncStatus::Unchanged);
        assert_eq!(again.entry(&bad_path).unwrap().status, SyncStatus::ToPull);
    }

    #[tokio::test]
    async fn test_pull_resolves_refs_and_reports_unresolved() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        storage
            .upsert_workflow(Some(BILLING), "workflows/billing.py", "charge", "test")
            .unwrap();
        let host = MemoryGitHost::new();

        let id = uuid::Uuid::new_v4().to_string();
        let path = EntityKind::Agent.path_for(&id);
        let doc = json!({
            "id": id,
            "name": "Helper",
            "tool_ids": ["workflows/billing.py::charge", "workflows/missing.py::gone"],
            "_export": {"version": "1", "ref_paths": ["$.tool_ids[*]"]}
        });
        host.put_file(&path, serde_json::to_string_pretty(&doc).unwrap().as_bytes());

        let plan = preview(&mut storage, &host, &options()).await.unwrap();
        let request = SyncExecuteRequest {
            pull_paths: vec![path.clone()],
            ..Default::default()
        };
        let result = execute(&mut storage, &host, &options(), Some(&plan), &request)
            .await
            .unwrap();

        assert_eq!(result.pulled, vec![path.clone()]);
        assert_eq!(result.unresolved_refs.len(), 1);
        assert_eq!(result.unresolved_refs[0].portable_ref, "workflows/missing.py::gone");

        let agent = storage.get_entity(&id).unwrap().unwrap();
        assert_eq!(agent.payload["tool_ids"][0], BILLING);
        assert_eq!(agent.payload["tool_ids"][1], "workflows/missing.py::gone");
        assert!(!agent.is_dirty());
    }

    #[tokio::test]
    async fn test_identity_adoption() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let local = PlatformEntity::new(EntityKind::Agent, "Helper".into(), json!({"tool_ids": []}));
        storage.create_entity(&local, "test").unwrap();

        let host = MemoryGitHost::new();
        let incoming = uuid::Uuid::new_v4().to_string();
        let path = EntityKind::Agent.path_for(&incoming);
        host.put_file(
            &path,
            format!("{{\"id\": \"{incoming}\", \"name\": \"Helper\", \"tool_ids\": [\"x\"]}}\n").as_bytes(),
        );

        let plan = preview(&mut storage, &host, &options()).await.unwrap();
        let mut request = SyncExecuteRequest {
            pull_paths: vec![path.clone()],
            ..Default::default()
        };
        request.allow_name_matching = true;
        let result = execute(&mut storage, &host, &options(), Some(&plan), &request)
            .await
            .unwrap();
        assert_eq!(result.pulled, vec![path.clone()]);
        assert_eq!(result.adopted.len(), 1);
        assert_eq!(result.adopted[0].local_id, local.id);
        assert_eq!(result.adopted[0].incoming_id.as_deref(), Some(incoming.as_str()));

        let agents = storage.list_entities(Some(EntityKind::Agent)).unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, local.id);
        assert_eq!(agents[0].payload["tool_ids"][0], "x");
        assert!(agents[0].is_dirty());

        let history = storage.history("entity", &local.id, 10).unwrap();
        assert_eq!(history[0].event_type, EventType::EntityAdopted);
        assert_eq!(history[0].operation, "import_entity");
        assert_eq!(history[0].actor, options().actor);

        // Next run pushes the local identity and retires the incoming path
        let next = preview(&mut storage, &host, &options()).await.unwrap();
        assert_eq!(next.entry(&local.path()).unwrap().status, SyncStatus::ToPush);
        assert_eq!(next.entry(&path).unwrap().status, SyncStatus::ToDelete);
    }

    #[tokio::test]
    async fn test_ambiguous_identity_fails_only_that_path() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        for _ in 0..2 {
            let form = PlatformEntity::new(EntityKind::Form, "Intake".into(), json!({}));
            storage.create_entity(&form, "test").unwrap();
        }
        let host = MemoryGitHost::new();
        let path = EntityKind::Form.path_for(&uuid::Uuid::new_v4().to_string());
        host.put_file(&path, b"{\"name\": \"Intake\"}\n");
        host.put_file("README.md", b"# hi\n");

        let plan = preview(&mut storage, &host, &options()).await.unwrap();
        let mut request = SyncExecuteRequest {
            pull_paths: vec![path.clone(), "README.md".into()],
            ..Default::default()
        };
        let result = execute(&mut storage, &host, &options(), Some(&plan), &request)
            .await
            .unwrap();
        assert_eq!(result.pulled, vec!["README.md".to_string()]);
        assert_eq!(result.failed.len(), 1);
        assert!(result.failed[0].error.contains("requires manual resolution"));
        assert_eq!(result.failed[0].candidates.len(), 2);

        // An explicit choice settles it
        let target = result.failed[0].candidates[0].clone();
        request.pull_paths = vec![path.clone()];
        request
            .identity_resolutions
            .insert(path.clone(), IdentityResolution::Adopt(target.clone()));
        let result = execute(&mut storage, &host, &options(), None, &request)
            .await
            .unwrap();
        assert!(result.is_complete(), "{result:?}");
        assert_eq!(result.adopted[0].local_id, target);
    }

    #[tokio::test]
    async fn test_stale_preview_is_excluded() {
        let (mut storage, form) = seeded();
        let host = MemoryGitHost::new();

        let plan = preview(&mut storage, &host, &options()).await.unwrap();
        // Another client writes the same path after the preview
        host.put_file(&form.path(), b"{\"name\": \"Theirs\"}\n");

        let result = execute(&mut storage, &host, &options(), Some(&plan), &push_all(&plan))
            .await
            .unwrap();
        assert_eq!(result.conflicts, vec![form.path()]);
        assert_eq!(result.pushed, vec!["workflows/billing.py".to_string()]);
        assert_eq!(host.file(&form.path()).unwrap(), b"{\"name\": \"Theirs\"}\n");
        assert!(storage.get_entity(&form.id).unwrap().unwrap().is_dirty());
    }

    #[tokio::test]
    async fn test_failed_ref_update_records_nothing() {
        let (mut storage, form) = seeded();
        let host = MemoryGitHost::new();

        let plan = preview(&mut storage, &host, &options()).await.unwrap();
        host.fail_next(
            "update_ref",
            RemoteError::NonFastForward {
                branch: "main".into(),
            },
        );
        let result = execute(&mut storage, &host, &options(), Some(&plan), &push_all(&plan))
            .await
            .unwrap();

        assert!(result.pushed.is_empty());
        assert_eq!(result.failed.len(), 2);
        assert!(result.commit.is_none());
        assert!(host.head().is_none());

        let stored = storage.get_entity(&form.id).unwrap().unwrap();
        assert!(stored.is_dirty());
        assert!(stored.last_synced_hash.is_none());
        let file = storage.get_workspace_file("workflows/billing.py").unwrap().unwrap();
        assert!(file.last_synced_hash.is_none());
    }

    #[tokio::test]
    async fn test_unresolved_conflict_is_not_applied() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        storage.put_workspace_file("notes.md", b"mine\n", "test").unwrap();
        let host = MemoryGitHost::new();
        host.put_file("notes.md", b"theirs\n");

        let plan = preview(&mut storage, &host, &options()).await.unwrap();
        assert_eq!(plan.entry("notes.md").unwrap().status, SyncStatus::Conflict);

        let mut request = SyncExecuteRequest {
            push_paths: vec!["notes.md".into()],
            ..Default::default()
        };
        let result = execute(&mut storage, &host, &options(), Some(&plan), &request)
            .await
            .unwrap();
        assert_eq!(result.conflicts, vec!["notes.md".to_string()]);
        assert!(result.pushed.is_empty());

        request
            .conflict_resolutions
            .insert("notes.md".into(), Resolution::KeepRemote);
        let result = execute(&mut storage, &host, &options(), Some(&plan), &request)
            .await
            .unwrap();
        assert_eq!(result.pulled, vec!["notes.md".to_string()]);
        let file = storage.get_workspace_file("notes.md").unwrap().unwrap();
        assert_eq!(file.content, b"theirs\n");
    }

    #[tokio::test]
    async fn test_slug_rename_moves_file_in_one_commit() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let app = PlatformEntity::new(EntityKind::Application, "Portal".into(), json!({"pages": []}));
        storage.create_entity(&app, "test").unwrap();
        let host = MemoryGitHost::new();

        let plan = preview(&mut storage, &host, &options()).await.unwrap();
        execute(&mut storage, &host, &options(), Some(&plan), &push_all(&plan))
            .await
            .unwrap();
        assert_eq!(host.paths(), vec!["apps/portal.app.json".to_string()]);

        storage
            .update_entity(&app.id, None, Some("customer-portal"), None, "test")
            .unwrap();
        let plan = preview(&mut storage, &host, &options()).await.unwrap();
        let head = host.head();
        let result = execute(&mut storage, &host, &options(), Some(&plan), &push_all(&plan))
            .await
            .unwrap();
        assert!(result.is_complete(), "{result:?}");
        assert_ne!(host.head(), head);
        assert_eq!(host.paths(), vec!["apps/customer-portal.app.json".to_string()]);
        assert_eq!(host.call_count("create_commit"), 2);

        let again = preview(&mut storage, &host, &options()).await.unwrap();
        assert!(again.is_clean(), "{:?}", again.entries);
    }

    #[tokio::test]
    async fn test_late_workflow_registration_repushes_portable_ref() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let form = PlatformEntity::new(
            EntityKind::Form,
            "Intake".into(),
            json!({"workflow_id": BILLING, "fields": []}),
        );
        storage.create_entity(&form, "test").unwrap();
        let host = MemoryGitHost::new();

        let plan = preview(&mut storage, &host, &options()).await.unwrap();
        execute(&mut storage, &host, &options(), Some(&plan), &push_all(&plan))
            .await
            .unwrap();
        let content = String::from_utf8(host.file(&form.path()).unwrap()).unwrap();
        assert!(content.contains(BILLING));

        storage
            .upsert_workflow(Some(BILLING), "workflows/billing.py", "charge", "test")
            .unwrap();
        let plan = preview(&mut storage, &host, &options()).await.unwrap();
        assert_eq!(plan.entry(&form.path()).unwrap().status, SyncStatus::ToPush);

        let result = execute(&mut storage, &host, &options(), Some(&plan), &push_all(&plan))
            .await
            .unwrap();
        assert!(result.is_complete(), "{result:?}");
        let content = String::from_utf8(host.file(&form.path()).unwrap()).unwrap();
        assert!(content.contains("workflows/billing.py::charge"));
        assert!(!content.contains(BILLING));
    }

    #[tokio::test]
    async fn test_keep_local_on_edited_old_slug_path_deletes_it() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let app = PlatformEntity::new(EntityKind::Application, "Portal".into(), json!({"pages": []}));
        storage.create_entity(&app, "test").unwrap();
        let host = MemoryGitHost::new();

        let plan = preview(&mut storage, &host, &options()).await.unwrap();
        execute(&mut storage, &host, &options(), Some(&plan), &push_all(&plan))
            .await
            .unwrap();

        storage
            .update_entity(&app.id, None, Some("customer-portal"), None, "test")
            .unwrap();
        host.put_file(
            "apps/portal.app.json",
            format!("{{\"id\": \"{}\", \"name\": \"Portal v2\", \"pages\": []}}\n", app.id).as_bytes(),
        );

        let plan = preview(&mut storage, &host, &options()).await.unwrap();
        let old = plan.entry("apps/portal.app.json").unwrap();
        assert_eq!(old.status, SyncStatus::Conflict);
        assert!(old.local_hash.is_none());
        assert_eq!(
            plan.entry("apps/customer-portal.app.json").unwrap().status,
            SyncStatus::ToPush
        );

        let mut request = push_all(&plan);
        request
            .conflict_resolutions
            .insert("apps/portal.app.json".into(), Resolution::KeepLocal);
        let result = execute(&mut storage, &host, &options(), Some(&plan), &request)
            .await
            .unwrap();
        assert!(result.failed.is_empty(), "{:?}", result.failed);
        assert!(result.pushed.contains(&"apps/portal.app.json".to_string()));
        assert_eq!(host.paths(), vec!["apps/customer-portal.app.json".to_string()]);

        let stored = storage.get_entity(&app.id).unwrap().unwrap();
        assert_eq!(stored.name, "Portal");
        assert_eq!(
            stored.last_synced_path.as_deref(),
            Some("apps/customer-portal.app.json")
        );

        let again = preview(&mut storage, &host, &options()).await.unwrap();
        assert!(again.is_clean(), "{:?}", again.entries);
    }

    #[tokio::test]
    async fn test_concurrent_run_is_rejected() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("psync.db");
        let mut first = SqliteStorage::open(&db).unwrap();
        let mut second = SqliteStorage::open(&db).unwrap();
        let host = MemoryGitHost::new();

        let _held = crate::sync::WorkspaceLock::acquire(
            &mut first,
            "default",
            std::time::Duration::from_secs(60),
        )
        .unwrap();
        let err = preview(&mut second, &host, &options()).await.unwrap_err();
        assert!(matches!(err, SyncError::SyncInProgress { .. }));
        assert_eq!(host.call_count("fetch_tree"), 0);
    }
}

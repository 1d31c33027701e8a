//! Sync types for preview and execute.
//!
//! A sync run produces a [`SyncPlan`] of classified [`SyncEntry`] rows, and
//! executing a [`SyncExecuteRequest`] against that plan produces a
//! [`SyncExecuteResult`] with per-path outcomes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::sync::remote::RemoteError;

/// Classification of one path relative to the remote tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Only the local side changed since the last sync.
    ToPush,
    /// Only the remote side changed since the last sync.
    ToPull,
    /// Both sides changed (or no merge base exists). Never auto-resolved.
    Conflict,
    /// Local and remote agree.
    Unchanged,
    /// Orphaned remote path left behind by an application slug rename.
    ToDelete,
}

impl SyncStatus {
    /// Get the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ToPush => "to_push",
            Self::ToPull => "to_pull",
            Self::Conflict => "conflict",
            Self::Unchanged => "unchanged",
            Self::ToDelete => "to_delete",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "to_push" | "push" => Ok(Self::ToPush),
            "to_pull" | "pull" => Ok(Self::ToPull),
            "conflict" => Ok(Self::Conflict),
            "unchanged" => Ok(Self::Unchanged),
            "to_delete" | "delete" => Ok(Self::ToDelete),
            _ => Err(format!("Unknown sync status: {s}")),
        }
    }
}

/// One row of a sync plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEntry {
    pub path: String,
    pub local_hash: Option<String>,
    pub stored_hash: Option<String>,
    pub remote_hash: Option<String>,
    pub status: SyncStatus,
    /// Backing entity for virtual-file paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

/// Output of a preview: the classified entries plus the remote snapshot
/// they were computed against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPlan {
    /// Branch head at preview time (`None` for an empty branch).
    pub remote_commit: Option<String>,
    /// Entries sorted by path.
    pub entries: Vec<SyncEntry>,
}

impl SyncPlan {
    /// Look up the entry for a path.
    #[must_use]
    pub fn entry(&self, path: &str) -> Option<&SyncEntry> {
        self.entries
            .binary_search_by(|e| e.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Paths with the given status.
    pub fn paths_with(&self, status: SyncStatus) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(move |e| e.status == status)
            .map(|e| e.path.as_str())
    }

    /// Count of entries per status.
    #[must_use]
    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.status.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// Whether every entry is unchanged.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.entries.iter().all(|e| e.status == SyncStatus::Unchanged)
    }
}

/// Explicit operator choice for a conflicting path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
}

/// Explicit operator choice for an ambiguous identity match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "id")]
pub enum IdentityResolution {
    /// Update this existing local entity, keeping its id.
    Adopt(String),
    /// Import as a brand-new entity.
    CreateNew,
}

impl std::str::FromStr for IdentityResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("adopt", id)) if !id.is_empty() => Ok(Self::Adopt(id.to_string())),
            None if s == "create_new" || s == "create-new" => Ok(Self::CreateNew),
            _ => Err(format!(
                "Invalid identity resolution '{s}' (expected adopt:<uuid> or create_new)"
            )),
        }
    }
}

/// Request body for `sync-execute`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncExecuteRequest {
    pub push_paths: Vec<String>,
    pub pull_paths: Vec<String>,
    pub conflict_resolutions: BTreeMap<String, Resolution>,
    pub identity_resolutions: BTreeMap<String, IdentityResolution>,
    /// Opt in to adopting same-named local entities on pull.
    pub allow_name_matching: bool,
}

/// A path that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathFailure {
    pub path: String,
    pub error: String,
    /// Remote bytes preserved for inspection when they failed to import.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_content: Option<String>,
    /// Ranked local candidates when the identity was ambiguous.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
}

impl PathFailure {
    #[must_use]
    pub fn new(path: &str, error: &SyncError) -> Self {
        let candidates = match error {
            SyncError::AmbiguousIdentity { candidates, .. } => candidates.clone(),
            _ => Vec::new(),
        };
        Self {
            path: path.to_string(),
            error: error.to_string(),
            remote_content: None,
            candidates,
        }
    }

    #[must_use]
    pub fn with_remote_content(mut self, content: &[u8]) -> Self {
        self.remote_content = Some(String::from_utf8_lossy(content).into_owned());
        self
    }
}

/// An entity updated under its existing local id after a name match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdoptedEntity {
    pub path: String,
    pub local_id: String,
    pub incoming_id: Option<String>,
}

/// A portable reference that could not be resolved on import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnresolvedRef {
    pub path: String,
    pub portable_ref: String,
}

/// Response body for `sync-execute`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncExecuteResult {
    pub pushed: Vec<String>,
    pub pulled: Vec<String>,
    pub failed: Vec<PathFailure>,
    /// Paths excluded because they conflict (unresolved or stale).
    pub conflicts: Vec<String>,
    pub adopted: Vec<AdoptedEntity>,
    pub unresolved_refs: Vec<UnresolvedRef>,
    /// Commit created by the push, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

impl SyncExecuteResult {
    /// True when nothing failed and nothing was held back.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.conflicts.is_empty()
    }

    pub(crate) fn add_conflict(&mut self, path: &str) {
        if !self.conflicts.iter().any(|p| p == path) {
            self.conflicts.push(path.to_string());
        }
    }
}

/// Paths split into what will be pushed and pulled, after conflict handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPlan {
    pub push: BTreeSet<String>,
    pub pull: BTreeSet<String>,
    /// Conflicting paths the operator gave no decision for.
    pub unresolved: BTreeSet<String>,
}

/// Sync-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Remote host failure after retries.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Another run holds the workspace lock.
    #[error("Sync in progress for workspace '{workspace}' (held by {owner})")]
    SyncInProgress { workspace: String, owner: String },

    /// The remote branch changed since the preview.
    #[error("Remote changed since preview for {path}")]
    StalePreview { path: String },

    /// No single local entity could be chosen for an incoming file.
    #[error("Ambiguous identity for {path}: requires manual resolution ({} candidate(s))", candidates.len())]
    AmbiguousIdentity {
        path: String,
        candidates: Vec<String>,
    },

    /// File content is not a valid entity document.
    #[error("Malformed content in {path}: {message}")]
    MalformedContent { path: String, message: String },

    /// A reference field holds a value of the wrong type.
    #[error("Malformed payload at {field}: expected string, found {found}")]
    MalformedPayload { field: String, found: String },

    /// Path matches no virtual-file convention and no workspace file.
    #[error("Unknown path: {0}")]
    UnknownPath(String),

    /// Path is well-formed but its entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<crate::error::Error> for SyncError {
    fn from(err: crate::error::Error) -> Self {
        match err {
            crate::error::Error::Sync(inner) => inner,
            crate::error::Error::Json(e) => Self::Json(e),
            other => Self::Database(other.to_string()),
        }
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

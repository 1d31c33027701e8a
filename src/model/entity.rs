//! Platform entity model.
//!
//! A platform entity is one exportable row (application, form, agent). Its
//! `kind` decides the file path it is mirrored to and which payload fields
//! hold references to workflows.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of entity kinds that participate in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Low-code application (pages, components). Path keyed by slug.
    Application,
    /// Form definition. Path keyed by UUID.
    Form,
    /// Agent definition. Path keyed by UUID.
    Agent,
}

/// How a virtual file path identifies its entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathKey {
    /// Human-readable slug (applications).
    Slug(String),
    /// Entity UUID (forms, agents).
    Id(String),
}

impl EntityKind {
    /// All kinds, in the order they are listed during preview.
    pub const ALL: [Self; 3] = [Self::Application, Self::Form, Self::Agent];

    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Form => "form",
            Self::Agent => "agent",
        }
    }

    /// Top-level directory in the repository.
    #[must_use]
    pub const fn dir(&self) -> &'static str {
        match self {
            Self::Application => "apps",
            Self::Form => "forms",
            Self::Agent => "agents",
        }
    }

    /// File name suffix, including the `.json` extension.
    #[must_use]
    pub const fn suffix(&self) -> &'static str {
        match self {
            Self::Application => ".app.json",
            Self::Form => ".form.json",
            Self::Agent => ".agent.json",
        }
    }

    /// Whether the file name is derived from a slug rather than the UUID.
    #[must_use]
    pub const fn keyed_by_slug(&self) -> bool {
        matches!(self, Self::Application)
    }

    /// JSON-path expressions of the payload fields holding workflow references.
    #[must_use]
    pub const fn ref_paths(&self) -> &'static [&'static str] {
        match self {
            Self::Application => &["$.pages[*]..workflow_id", "$.pages[*]..launch_workflow_id"],
            Self::Form => &[
                "$.workflow_id",
                "$.launch_workflow_id",
                "$.fields[*].data_provider_id",
            ],
            Self::Agent => &["$.tool_ids[*]"],
        }
    }

    /// Build the repository path for an entity of this kind.
    #[must_use]
    pub fn path_for(&self, key: &str) -> String {
        format!("{}/{}{}", self.dir(), key, self.suffix())
    }

    /// Parse a repository path back into kind and identifier.
    ///
    /// Returns `None` for anything that is not a virtual-file path, which
    /// callers treat as a plain workspace file.
    #[must_use]
    pub fn parse_path(path: &str) -> Option<(Self, PathKey)> {
        let (dir, file) = path.split_once('/')?;
        let kind = Self::ALL.into_iter().find(|k| k.dir() == dir)?;
        let stem = file.strip_suffix(kind.suffix())?;
        if stem.is_empty() || stem.contains('/') {
            return None;
        }

        if kind.keyed_by_slug() {
            Some((kind, PathKey::Slug(stem.to_string())))
        } else {
            let id = Uuid::parse_str(stem).ok()?;
            Some((kind, PathKey::Id(id.to_string())))
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "application" | "app" => Ok(Self::Application),
            "form" => Ok(Self::Form),
            "agent" => Ok(Self::Agent),
            _ => Err(format!("Unknown entity kind: {s}")),
        }
    }
}

/// A platform entity row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformEntity {
    /// Authoritative identity (UUID).
    pub id: String,

    /// Entity kind.
    pub kind: EntityKind,

    /// Human label, not unique.
    pub name: String,

    /// URL-safe slug (applications only).
    pub slug: Option<String>,

    /// Kind-specific payload (JSON object).
    pub payload: serde_json::Value,

    /// Blob hash recorded after the last successful push or pull.
    pub last_synced_hash: Option<String>,

    /// Repository path at the last successful sync.
    pub last_synced_path: Option<String>,

    /// Dirty-tracking version, bumped by triggers whenever name, slug or
    /// payload change. `None` means unchanged since the last sync.
    #[serde(skip)]
    pub dirty_version: Option<i64>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl PlatformEntity {
    /// Create a new, never-synced entity with a fresh UUID.
    pub fn new(kind: EntityKind, name: String, payload: serde_json::Value) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let slug = kind.keyed_by_slug().then(|| slugify(&name));

        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            name,
            slug,
            payload,
            last_synced_hash: None,
            last_synced_path: None,
            dirty_version: Some(1),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether local edits exist that the stored hash does not cover.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty_version.is_some()
    }

    /// Repository path of this entity's virtual file.
    #[must_use]
    pub fn path(&self) -> String {
        if self.kind.keyed_by_slug() {
            let slug = self
                .slug
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| slugify(&self.name));
            self.kind.path_for(&slug)
        } else {
            self.kind.path_for(&self.id)
        }
    }
}

/// A workflow-callable function. The target of every entity reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    /// Source file path relative to the workspace root.
    pub path: String,
    pub function_name: String,
    pub created_at: i64,
}

impl Workflow {
    /// Portable `path::function_name` form.
    #[must_use]
    pub fn portable_ref(&self) -> String {
        format!("{}::{}", self.path, self.function_name)
    }
}

/// A literally-stored workspace file (source code and the like).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceFile {
    pub path: String,
    #[serde(skip)]
    pub content: Vec<u8>,
    /// Blob hash of `content`, maintained on every write.
    pub content_hash: String,
    pub last_synced_hash: Option<String>,
    pub updated_at: i64,
}

/// Derive a URL-safe slug from a display name.
#[must_use]
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

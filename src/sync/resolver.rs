//! Conflict and identity resolution.
//!
//! Conflicts are never resolved automatically: each conflicting path needs an
//! explicit keep-local or keep-remote decision. Identity matching decides
//! whether an incoming entity file updates an existing local row or creates
//! a new one.

use serde::Serialize;
use uuid::Uuid;

use crate::model::{EntityKind, PathKey, PlatformEntity};
use crate::storage::SqliteStorage;
use crate::sync::types::{
    IdentityResolution, Resolution, ResolvedPlan, SyncError, SyncExecuteRequest, SyncPlan,
    SyncResult, SyncStatus,
};
use crate::sync::virtual_files::EntityDocument;
use crate::validate::name_similarity;

/// Maximum candidates reported for an ambiguous identity.
pub const MAX_CANDIDATES: usize = 5;

/// Minimum name similarity for a fuzzy candidate.
const MIN_SIMILARITY: f64 = 0.6;

/// Split the requested paths into push and pull sets.
///
/// Conflicting paths go where their resolution says. A conflicting path with
/// no resolution, or a path requested in both directions without one, is
/// held back in `unresolved`.
#[must_use]
pub fn resolve_conflicts(plan: &SyncPlan, request: &SyncExecuteRequest) -> ResolvedPlan {
    let mut resolved = ResolvedPlan::default();

    let requested = request
        .push_paths
        .iter()
        .chain(&request.pull_paths)
        .chain(request.conflict_resolutions.keys());

    for path in requested {
        if resolved.push.contains(path)
            || resolved.pull.contains(path)
            || resolved.unresolved.contains(path)
        {
            continue;
        }

        let conflicting = plan
            .entry(path)
            .is_some_and(|e| e.status == SyncStatus::Conflict);
        let wants_push = request.push_paths.contains(path);
        let wants_pull = request.pull_paths.contains(path);

        match request.conflict_resolutions.get(path) {
            Some(Resolution::KeepLocal) => {
                resolved.push.insert(path.clone());
            }
            Some(Resolution::KeepRemote) => {
                resolved.pull.insert(path.clone());
            }
            None if conflicting || (wants_push && wants_pull) => {
                tracing::info!(path = %path, "Conflict needs an explicit resolution; skipped");
                resolved.unresolved.insert(path.clone());
            }
            None if wants_push => {
                resolved.push.insert(path.clone());
            }
            None => {
                resolved.pull.insert(path.clone());
            }
        }
    }

    resolved
}

/// A local entity that an incoming file might correspond to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub id: String,
    pub name: String,
    pub slug: Option<String>,
    /// Name similarity in `[0.0, 1.0]`.
    pub score: f64,
    /// Exact (case-insensitive) name match, or same application slug.
    pub exact: bool,
}

impl Candidate {
    fn from_entity(entity: &PlatformEntity, name: &str, slug: Option<&str>) -> Self {
        let slug_match = slug.is_some() && entity.slug.as_deref() == slug;
        let score = name_similarity(&entity.name, name);
        Self {
            id: entity.id.clone(),
            name: entity.name.clone(),
            slug: entity.slug.clone(),
            exact: slug_match || entity.name.trim().eq_ignore_ascii_case(name.trim()),
            score,
        }
    }
}

/// Rank local entities of `kind` that resemble an incoming name (and slug,
/// for applications). Exact matches come first, then by similarity.
///
/// # Errors
///
/// Returns an error if the entities cannot be loaded.
pub fn rank_candidates(
    storage: &SqliteStorage,
    kind: EntityKind,
    name: &str,
    slug: Option<&str>,
) -> SyncResult<Vec<Candidate>> {
    let mut candidates: Vec<Candidate> = storage
        .list_entities(Some(kind))?
        .iter()
        .map(|e| Candidate::from_entity(e, name, slug))
        .filter(|c| c.exact || c.score >= MIN_SIMILARITY)
        .collect();

    candidates.sort_by(|a, b| {
        b.exact
            .cmp(&a.exact)
            .then_with(|| b.score.total_cmp(&a.score))
            .then_with(|| a.id.cmp(&b.id))
    });
    candidates.truncate(MAX_CANDIDATES);
    Ok(candidates)
}

/// Outcome of identity matching for one incoming entity file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityMatch {
    /// The incoming id already exists locally; update it in place.
    Existing(String),
    /// Update a local entity found by name, keeping its local id.
    Adopted {
        local_id: String,
        incoming_id: Option<String>,
    },
    /// No local counterpart; create under this id.
    Create(String),
}

impl IdentityMatch {
    /// Local id the import is written under.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Existing(id) | Self::Create(id) => id,
            Self::Adopted { local_id, .. } => local_id,
        }
    }

    #[must_use]
    pub const fn is_adopted(&self) -> bool {
        matches!(self, Self::Adopted { .. })
    }
}

/// Decide which local entity an incoming document maps to.
///
/// An explicit resolution always wins. Otherwise the embedded id (or the id
/// in the path) is matched first, then, when `allow_name_matching` is set,
/// the name (and slug for applications).
///
/// # Errors
///
/// Returns [`SyncError::AmbiguousIdentity`] when no single target can be
/// chosen, [`SyncError::NotFound`] when an explicit adopt target does not
/// exist, or [`SyncError::UnknownPath`] for a non-entity path.
pub fn resolve_identity(
    storage: &SqliteStorage,
    path: &str,
    doc: &EntityDocument,
    explicit: Option<&IdentityResolution>,
    allow_name_matching: bool,
) -> SyncResult<IdentityMatch> {
    let (kind, key) =
        EntityKind::parse_path(path).ok_or_else(|| SyncError::UnknownPath(path.to_string()))?;

    let (path_id, path_slug) = match key {
        PathKey::Id(id) => (Some(id), None),
        PathKey::Slug(slug) => (None, Some(slug)),
    };
    let incoming_id = doc.id.clone().or(path_id);
    // The path decides an application's slug
    let slug = if kind.keyed_by_slug() {
        path_slug.or_else(|| doc.slug.clone())
    } else {
        None
    };

    if let Some(resolution) = explicit {
        return explicit_match(storage, path, kind, incoming_id, resolution);
    }

    if let Some(id) = &incoming_id {
        if storage.get_entity(id)?.is_some_and(|e| e.kind == kind) {
            return Ok(IdentityMatch::Existing(id.clone()));
        }
    }

    let mut matches: Vec<PlatformEntity> = storage.find_entities_by_name(kind, &doc.name)?;
    if let Some(slug) = slug.as_deref() {
        if let Some(holder) = storage.get_entity_by_slug(slug)? {
            if !matches.iter().any(|e| e.id == holder.id) {
                matches.push(holder);
            }
        }
    }

    let ambiguous = || -> SyncResult<IdentityMatch> {
        let candidates = rank_candidates(storage, kind, &doc.name, slug.as_deref())?;
        Err(SyncError::AmbiguousIdentity {
            path: path.to_string(),
            candidates: candidates.into_iter().map(|c| c.id).collect(),
        })
    };

    if allow_name_matching {
        return match matches.as_slice() {
            [] => Ok(IdentityMatch::Create(new_id(storage, incoming_id)?)),
            [only] => {
                tracing::info!(path, local_id = %only.id, "Adopting local entity matched by name");
                Ok(IdentityMatch::Adopted {
                    local_id: only.id.clone(),
                    incoming_id,
                })
            }
            _ => ambiguous(),
        };
    }

    // Without opt-in, an anonymous file resembling local rows or an
    // application whose slug is taken cannot be placed safely.
    let slug_taken = slug.is_some() && matches.iter().any(|e| e.slug == slug);
    if (doc.id.is_none() && !matches.is_empty()) || slug_taken {
        return ambiguous();
    }
    Ok(IdentityMatch::Create(new_id(storage, incoming_id)?))
}

fn explicit_match(
    storage: &SqliteStorage,
    path: &str,
    kind: EntityKind,
    incoming_id: Option<String>,
    resolution: &IdentityResolution,
) -> SyncResult<IdentityMatch> {
    match resolution {
        IdentityResolution::Adopt(target) => {
            let entity = storage
                .get_entity(target)?
                .filter(|e| e.kind == kind)
                .ok_or_else(|| SyncError::NotFound(format!("{kind} {target} (adopt target for {path})")))?;
            if incoming_id.as_deref() == Some(entity.id.as_str()) {
                Ok(IdentityMatch::Existing(entity.id))
            } else {
                Ok(IdentityMatch::Adopted {
                    local_id: entity.id,
                    incoming_id,
                })
            }
        }
        IdentityResolution::CreateNew => Ok(IdentityMatch::Create(new_id(storage, incoming_id)?)),
    }
}

/// The incoming id if it is free locally, otherwise a fresh UUID.
fn new_id(storage: &SqliteStorage, incoming_id: Option<String>) -> SyncResult<String> {
    match incoming_id {
        Some(id) if storage.get_entity(&id)?.is_none() => Ok(id),
        _ => Ok(Uuid::new_v4().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::types::SyncEntry;
    use serde_json::json;

    fn doc(id: Option<&str>, name: &str, slug: Option<&str>) -> EntityDocument {
        EntityDocument {
            id: id.map(ToString::to_string),
            name: name.to_string(),
            slug: slug.map(ToString::to_string),
            payload: json!({}),
            export: None,
        }
    }

    fn plan(entries: &[(&str, SyncStatus)]) -> SyncPlan {
        SyncPlan {
            remote_commit: None,
            entries: entries
                .iter()
                .map(|(path, status)| SyncEntry {
                    path: (*path).to_string(),
                    local_hash: None,
                    stored_hash: None,
                    remote_hash: None,
                    status: *status,
                    entity_id: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_conflicts_need_explicit_resolution() {
        let plan = plan(&[
            ("a.py", SyncStatus::ToPush),
            ("b.py", SyncStatus::Conflict),
            ("c.py", SyncStatus::Conflict),
            ("d.py", SyncStatus::Conflict),
        ]);
        let mut request = SyncExecuteRequest {
            push_paths: vec!["a.py".into(), "b.py".into()],
            pull_paths: vec!["d.py".into()],
            ..Default::default()
        };
        request
            .conflict_resolutions
            .insert("c.py".into(), Resolution::KeepRemote);
        request
            .conflict_resolutions
            .insert("d.py".into(), Resolution::KeepLocal);

        let resolved = resolve_conflicts(&plan, &request);
        assert!(resolved.push.contains("a.py"));
        assert!(resolved.unresolved.contains("b.py"));
        assert!(resolved.pull.contains("c.py"));
        // Resolution overrides the requested direction
        assert!(resolved.push.contains("d.py"));
        assert!(!resolved.pull.contains("d.py"));
    }

    #[test]
    fn test_both_directions_without_resolution_is_held_back() {
        let plan = plan(&[("a.py", SyncStatus::ToPush)]);
        let request = SyncExecuteRequest {
            push_paths: vec!["a.py".into()],
            pull_paths: vec!["a.py".into()],
            ..Default::default()
        };
        let resolved = resolve_conflicts(&plan, &request);
        assert!(resolved.push.is_empty());
        assert!(resolved.unresolved.contains("a.py"));
    }

    #[test]
    fn test_identity_by_embedded_id() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let form = PlatformEntity::new(EntityKind::Form, "Intake".into(), json!({}));
        storage.create_entity(&form, "test").unwrap();

        let matched = resolve_identity(
            &storage,
            &form.path(),
            &doc(Some(&form.id), "Renamed", None),
            None,
            false,
        )
        .unwrap();
        assert_eq!(matched, IdentityMatch::Existing(form.id.clone()));

        // No embedded id: the id in the path is used
        let matched =
            resolve_identity(&storage, &form.path(), &doc(None, "Intake", None), None, false)
                .unwrap();
        assert_eq!(matched.id(), form.id);
    }

    #[test]
    fn test_name_match_adopts_only_when_opted_in() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let local = PlatformEntity::new(EntityKind::Agent, "Helper".into(), json!({}));
        storage.create_entity(&local, "test").unwrap();

        let incoming = Uuid::new_v4().to_string();
        let path = EntityKind::Agent.path_for(&incoming);
        let document = doc(Some(&incoming), "Helper", None);

        let matched = resolve_identity(&storage, &path, &document, None, true).unwrap();
        assert!(matched.is_adopted());
        assert_eq!(matched.id(), local.id);

        // Without opt-in an identified file is simply created
        let matched = resolve_identity(&storage, &path, &document, None, false).unwrap();
        assert_eq!(matched, IdentityMatch::Create(incoming));
    }

    #[test]
    fn test_multiple_name_matches_are_ambiguous() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        for _ in 0..2 {
            let form = PlatformEntity::new(EntityKind::Form, "Intake".into(), json!({}));
            storage.create_entity(&form, "test").unwrap();
        }
        let path = EntityKind::Form.path_for(&Uuid::new_v4().to_string());
        let err = resolve_identity(
            &storage,
            &path,
            &doc(Some(&Uuid::new_v4().to_string()), "Intake", None),
            None,
            true,
        )
        .unwrap_err();
        match err {
            SyncError::AmbiguousIdentity { candidates, .. } => assert_eq!(candidates.len(), 2),
            other => panic!("expected ambiguity, got {other}"),
        }
    }

    #[test]
    fn test_taken_slug_without_opt_in_is_ambiguous() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let app = PlatformEntity::new(EntityKind::Application, "Portal".into(), json!({}));
        storage.create_entity(&app, "test").unwrap();

        let err = resolve_identity(
            &storage,
            "apps/portal.app.json",
            &doc(Some(&Uuid::new_v4().to_string()), "Portal v2", Some("portal")),
            None,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::AmbiguousIdentity { .. }));
    }

    #[test]
    fn test_explicit_resolution_overrides() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let a = PlatformEntity::new(EntityKind::Form, "Intake".into(), json!({}));
        let b = PlatformEntity::new(EntityKind::Form, "Intake".into(), json!({}));
        storage.create_entity(&a, "test").unwrap();
        storage.create_entity(&b, "test").unwrap();

        let incoming = Uuid::new_v4().to_string();
        let path = EntityKind::Form.path_for(&incoming);
        let document = doc(Some(&incoming), "Intake", None);

        let adopt = IdentityResolution::Adopt(b.id.clone());
        let matched = resolve_identity(&storage, &path, &document, Some(&adopt), true).unwrap();
        assert_eq!(
            matched,
            IdentityMatch::Adopted {
                local_id: b.id.clone(),
                incoming_id: Some(incoming.clone()),
            }
        );

        let matched = resolve_identity(
            &storage,
            &path,
            &document,
            Some(&IdentityResolution::CreateNew),
            true,
        )
        .unwrap();
        assert_eq!(matched, IdentityMatch::Create(incoming));

        let missing = IdentityResolution::Adopt(Uuid::new_v4().to_string());
        assert!(matches!(
            resolve_identity(&storage, &path, &document, Some(&missing), true),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn test_rank_candidates_orders_exact_first() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        for name in ["Intake Forms", "Intake", "Billing"] {
            let form = PlatformEntity::new(EntityKind::Form, name.into(), json!({}));
            storage.create_entity(&form, "test").unwrap();
        }
        let ranked = rank_candidates(&storage, EntityKind::Form, "intake", None).unwrap();
        assert_eq!(ranked[0].name, "Intake");
        assert!(ranked[0].exact);
        assert!(ranked.iter().all(|c| c.name != "Billing"));
    }
}

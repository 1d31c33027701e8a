//! Virtual files: database entities presented as repository files.
//!
//! Every entity maps to one path (see [`EntityKind::path_for`]) whose content
//! is the entity serialized as canonical JSON with references in portable
//! form. The provider offers two tiers: a cheap listing that only reports
//! paths and stored hashes, and full materialization that serializes and
//! hashes content.
//!
//! [`EntityKind::path_for`]: crate::model::EntityKind::path_for

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{EntityKind, PathKey, PlatformEntity};
use crate::storage::SqliteStorage;
use crate::sync::hash::blob_hash;
use crate::sync::refs::{to_portable, WorkflowRefMap};
use crate::sync::types::{SyncError, SyncResult};

/// Envelope format version written into `_export`.
pub const EXPORT_VERSION: &str = "1";

const EXPORT_KEY: &str = "_export";

/// Metadata telling an importer which fields hold portable refs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportMeta {
    pub version: String,
    pub ref_paths: Vec<String>,
}

/// An entity document parsed from file content.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDocument {
    pub id: Option<String>,
    pub name: String,
    pub slug: Option<String>,
    /// Payload with the envelope fields removed, refs still portable.
    pub payload: Value,
    pub export: Option<ExportMeta>,
}

/// Serialize an entity to its file content.
///
/// Output is pretty-printed JSON with sorted keys and a trailing newline, so
/// unchanged entities always produce identical bytes. Passing a map turns
/// references portable and adds the `_export` block.
///
/// # Errors
///
/// Returns an error if the payload is not a JSON object or a reference
/// field has the wrong type.
pub fn serialize_entity(
    entity: &PlatformEntity,
    map: Option<&WorkflowRefMap>,
) -> SyncResult<Vec<u8>> {
    let payload = match map {
        Some(map) => to_portable(&entity.payload, entity.kind.ref_paths(), map)?,
        None => entity.payload.clone(),
    };
    let Value::Object(mut doc) = payload else {
        return Err(SyncError::MalformedPayload {
            field: "$".to_string(),
            found: "non-object payload".to_string(),
        });
    };

    doc.insert("id".to_string(), Value::String(entity.id.clone()));
    doc.insert("name".to_string(), Value::String(entity.name.clone()));
    if entity.kind.keyed_by_slug() {
        let slug = entity_slug(entity);
        doc.insert("slug".to_string(), Value::String(slug));
    } else {
        doc.remove("slug");
    }

    if map.is_some() {
        let meta = ExportMeta {
            version: EXPORT_VERSION.to_string(),
            ref_paths: entity.kind.ref_paths().iter().map(ToString::to_string).collect(),
        };
        doc.insert(EXPORT_KEY.to_string(), serde_json::to_value(meta)?);
    } else {
        doc.remove(EXPORT_KEY);
    }

    let mut bytes = serde_json::to_vec_pretty(&Value::Object(doc))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse file content back into an entity document.
///
/// # Errors
///
/// Returns [`SyncError::MalformedContent`] if the bytes are not a JSON object
/// with a string `name`.
pub fn deserialize_entity(path: &str, content: &[u8]) -> SyncResult<EntityDocument> {
    let malformed = |message: String| SyncError::MalformedContent {
        path: path.to_string(),
        message,
    };

    let value: Value = serde_json::from_slice(content).map_err(|e| malformed(e.to_string()))?;
    let Value::Object(mut doc) = value else {
        return Err(malformed("expected a JSON object".to_string()));
    };

    let name = match doc.remove("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => name,
        Some(_) => return Err(malformed("`name` must be a non-empty string".to_string())),
        None => return Err(malformed("missing `name`".to_string())),
    };
    let id = optional_string(&mut doc, "id").map_err(malformed)?;
    let slug = optional_string(&mut doc, "slug").map_err(malformed)?;
    let export = doc
        .remove(EXPORT_KEY)
        .map(serde_json::from_value::<ExportMeta>)
        .transpose()
        .map_err(|e| malformed(format!("invalid `{EXPORT_KEY}` block: {e}")))?;

    Ok(EntityDocument {
        id,
        name,
        slug,
        payload: Value::Object(doc),
        export,
    })
}

fn optional_string(doc: &mut Map<String, Value>, key: &str) -> Result<Option<String>, String> {
    match doc.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(format!("`{key}` must be a string")),
    }
}

fn entity_slug(entity: &PlatformEntity) -> String {
    entity
        .slug
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| crate::model::slugify(&entity.name))
}

/// A database entity viewed as a file.
#[derive(Debug, Clone)]
pub struct VirtualFile {
    pub path: String,
    pub entity: PlatformEntity,
    /// Hash recorded at the last sync (free to read).
    pub stored_hash: Option<String>,
    /// Serialized bytes, only after materialization.
    pub content: Option<Vec<u8>>,
    /// Hash of `content`, only after materialization.
    pub computed_hash: Option<String>,
}

impl VirtualFile {
    /// Whether the stored hash can stand in for the content hash.
    ///
    /// Only for entities that were synced and not edited since.
    #[must_use]
    pub fn stored_hash_is_current(&self) -> bool {
        self.stored_hash.is_some() && !self.entity.is_dirty()
    }

    /// Best known local hash: computed if materialized, stored if current.
    #[must_use]
    pub fn local_hash(&self) -> Option<&str> {
        self.computed_hash.as_deref().or_else(|| {
            self.stored_hash_is_current()
                .then_some(self.stored_hash.as_deref())
                .flatten()
        })
    }
}

/// Presents entities as files, using a ref map built for this run.
pub struct VirtualFileProvider<'a> {
    storage: &'a SqliteStorage,
    map: &'a WorkflowRefMap,
    workers: usize,
}

impl<'a> VirtualFileProvider<'a> {
    #[must_use]
    pub fn new(storage: &'a SqliteStorage, map: &'a WorkflowRefMap) -> Self {
        Self {
            storage,
            map,
            workers: 1,
        }
    }

    /// Bound the worker pool used for materialization.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Enumerate every entity as a virtual file.
    ///
    /// With `include_content`, every file is serialized and hashed.
    ///
    /// # Errors
    ///
    /// Returns an error if the entities cannot be loaded or serialized.
    pub fn list_all(&self, include_content: bool) -> SyncResult<Vec<VirtualFile>> {
        let mut files: Vec<VirtualFile> = self
            .storage
            .list_entities(None)?
            .into_iter()
            .map(|entity| {
                let path = entity.path();
                // A hash synced under another path is no merge base for this one
                let stored_hash = entity
                    .last_synced_hash
                    .clone()
                    .filter(|_| entity.last_synced_path.as_deref().is_none_or(|p| p == path));
                VirtualFile {
                    path,
                    stored_hash,
                    entity,
                    content: None,
                    computed_hash: None,
                }
            })
            .collect();

        if include_content {
            self.materialize(&mut files, |_| true)?;
        }
        Ok(files)
    }

    /// Serialize and hash the files selected by `filter`, in parallel.
    ///
    /// # Errors
    ///
    /// Returns the first serialization error.
    pub fn materialize<F>(&self, files: &mut [VirtualFile], filter: F) -> SyncResult<()>
    where
        F: Fn(&VirtualFile) -> bool + Sync,
    {
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
        {
            Ok(pool) => Some(pool),
            Err(e) => {
                tracing::warn!(workers = self.workers, error = %e, "Cannot start hash workers; hashing serially");
                None
            }
        };
        self.materialize_on(pool.as_ref(), files, filter)
    }

    /// Without a pool, files are hashed on the calling thread.
    fn materialize_on<F>(
        &self,
        pool: Option<&rayon::ThreadPool>,
        files: &mut [VirtualFile],
        filter: F,
    ) -> SyncResult<()>
    where
        F: Fn(&VirtualFile) -> bool + Sync,
    {
        let map = self.map;
        let work = |file: &mut VirtualFile| -> SyncResult<()> {
            if !filter(file) {
                return Ok(());
            }
            let content = serialize_entity(&file.entity, Some(map))?;
            file.computed_hash = Some(blob_hash(&content));
            file.content = Some(content);
            Ok(())
        };

        match pool {
            Some(pool) => pool.install(|| files.par_iter_mut().try_for_each(work)),
            None => files.iter_mut().try_for_each(work),
        }
    }

    /// Serialize the entity behind `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownPath`] if `path` is not a virtual-file
    /// path and [`SyncError::NotFound`] if its entity does not exist.
    pub fn get_content(&self, path: &str) -> SyncResult<(Vec<u8>, PlatformEntity)> {
        let entity = self.find_entity(path)?;
        let content = serialize_entity(&entity, Some(self.map))?;
        Ok((content, entity))
    }

    /// Load the entity a path refers to.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownPath`] or [`SyncError::NotFound`].
    pub fn find_entity(&self, path: &str) -> SyncResult<PlatformEntity> {
        let (kind, key) =
            EntityKind::parse_path(path).ok_or_else(|| SyncError::UnknownPath(path.to_string()))?;

        let entity = match key {
            PathKey::Slug(slug) => self.storage.get_entity_by_slug(&slug)?,
            PathKey::Id(id) => self.storage.get_entity(&id)?.filter(|e| e.kind == kind),
        };
        entity.ok_or_else(|| SyncError::NotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BILLING: &str = "6b1c0a52-8f0e-4f6e-9d57-3f3b8a1d2c10";

    fn map() -> WorkflowRefMap {
        let mut map = WorkflowRefMap::new();
        map.insert(BILLING, "workflows/billing.py::charge");
        map
    }

    #[test]
    fn test_serialize_is_canonical() {
        let mut entity = PlatformEntity::new(
            EntityKind::Form,
            "Intake".into(),
            json!({"zeta": 1, "alpha": {"b": 2, "a": 1}, "workflow_id": BILLING}),
        );
        entity.id = "f0000000-0000-4000-8000-000000000001".into();

        let bytes = serialize_entity(&entity, Some(&map())).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();

        assert!(text.ends_with("}\n"));
        assert!(text.find("\"_export\"").unwrap() < text.find("\"alpha\"").unwrap());
        assert!(text.find("\"alpha\"").unwrap() < text.find("\"zeta\"").unwrap());
        assert!(text.contains("workflows/billing.py::charge"));
        assert!(!text.contains("\"slug\""));

        // Same entity, same bytes
        assert_eq!(serialize_entity(&entity, Some(&map())).unwrap(), bytes);
    }

    #[test]
    fn test_serialize_without_map_has_no_envelope() {
        let entity = PlatformEntity::new(EntityKind::Agent, "Helper".into(), json!({"tool_ids": []}));
        let text = String::from_utf8(serialize_entity(&entity, None).unwrap()).unwrap();
        assert!(!text.contains("_export"));
    }

    #[test]
    fn test_application_documents_carry_slug() {
        let app = PlatformEntity::new(EntityKind::Application, "Customer Portal".into(), json!({}));
        let bytes = serialize_entity(&app, Some(&map())).unwrap();
        let doc = deserialize_entity(&app.path(), &bytes).unwrap();
        assert_eq!(doc.slug.as_deref(), Some("customer-portal"));
        assert_eq!(doc.id.as_deref(), Some(app.id.as_str()));
        assert_eq!(doc.payload, json!({}));
        assert_eq!(doc.export.unwrap().version, EXPORT_VERSION);
    }

    #[test]
    fn test_non_object_payload_is_rejected() {
        let entity = PlatformEntity::new(EntityKind::Form, "Bad".into(), json!([1, 2]));
        assert!(matches!(
            serialize_entity(&entity, None),
            Err(SyncError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_deserialize_rejects_malformed() {
        for bad in [
            &b"{not json"[..],
            &b"[]"[..],
            &b"{\"id\": \"x\"}"[..],
            &b"{\"name\": 3}"[..],
        ] {
            let err = deserialize_entity("forms/x.form.json", bad).unwrap_err();
            assert!(matches!(err, SyncError::MalformedContent { .. }), "{err}");
        }
    }

    #[test]
    fn test_provider_tiers() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let form = PlatformEntity::new(EntityKind::Form, "Intake".into(), json!({"workflow_id": BILLING}));
        storage.create_entity(&form, "test").unwrap();

        let map = map();
        let provider = VirtualFileProvider::new(&storage, &map).with_workers(2);

        let cheap = provider.list_all(false).unwrap();
        assert_eq!(cheap.len(), 1);
        assert_eq!(cheap[0].path, form.path());
        assert!(cheap[0].content.is_none());
        assert!(cheap[0].local_hash().is_none());

        let full = provider.list_all(true).unwrap();
        let content = full[0].content.clone().unwrap();
        assert_eq!(full[0].computed_hash.as_deref(), Some(blob_hash(&content).as_str()));

        let (bytes, entity) = provider.get_content(&form.path()).unwrap();
        assert_eq!(bytes, content);
        assert_eq!(entity.id, form.id);
    }

    #[test]
    fn test_serial_hashing_matches_pooled() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        for name in ["Intake", "Refunds", "Escalation"] {
            let form = PlatformEntity::new(EntityKind::Form, name.into(), json!({"workflow_id": BILLING}));
            storage.create_entity(&form, "test").unwrap();
        }

        let map = map();
        let provider = VirtualFileProvider::new(&storage, &map).with_workers(2);
        let pooled = provider.list_all(true).unwrap();

        let mut serial = provider.list_all(false).unwrap();
        provider.materialize_on(None, &mut serial, |_| true).unwrap();

        assert_eq!(serial.len(), 3);
        for (a, b) in serial.iter().zip(&pooled) {
            assert_eq!(a.path, b.path);
            assert!(a.computed_hash.is_some());
            assert_eq!(a.computed_hash, b.computed_hash);
        }
    }

    #[test]
    fn test_get_content_errors() {
        let storage = SqliteStorage::open_memory().unwrap();
        let map = WorkflowRefMap::new();
        let provider = VirtualFileProvider::new(&storage, &map);

        assert!(matches!(
            provider.get_content("workflows/billing.py"),
            Err(SyncError::UnknownPath(_))
        ));
        assert!(matches!(
            provider.get_content("apps/missing.app.json"),
            Err(SyncError::NotFound(_))
        ));
    }
}

//! SQLite storage implementation.
//!
//! This module provides the local platform store for psync using SQLite.
//! It follows the MutationContext pattern for transaction discipline and audit logging.

use crate::error::{Error, Result};
use crate::model::{EntityKind, PlatformEntity, Workflow, WorkspaceFile};
use crate::storage::events::{self, insert_event, Event, EventType};
use crate::storage::schema::apply_schema;
use crate::sync::blob_hash;
use rusqlite::{Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::time::Duration;

/// SQLite-based storage backend.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Connection,
}

/// Context for a mutation operation, tracking side effects.
///
/// Passed to mutation closures to collect audit events, which are written
/// in the same transaction as the mutation itself.
pub struct MutationContext {
    /// Name of the operation being performed.
    pub op_name: String,
    /// Actor performing the operation (user, sync run owner, etc.).
    pub actor: String,
    /// Events to write at the end of the transaction.
    pub events: Vec<Event>,
}

impl MutationContext {
    /// Create a new mutation context.
    #[must_use]
    pub fn new(op_name: &str, actor: &str) -> Self {
        Self {
            op_name: op_name.to_string(),
            actor: actor.to_string(),
            events: Vec::new(),
        }
    }

    /// Record an event for this operation.
    pub fn record_event(&mut self, record_type: &str, record_id: &str, event_type: EventType) {
        self.events
            .push(Event::new(record_type, record_id, event_type, &self.actor, &self.op_name));
    }

    /// Record an event with old/new values for field tracking.
    pub fn record_change(
        &mut self,
        record_type: &str,
        record_id: &str,
        event_type: EventType,
        old_value: Option<String>,
        new_value: Option<String>,
    ) {
        self.events.push(
            Event::new(record_type, record_id, event_type, &self.actor, &self.op_name)
                .with_values(old_value, new_value),
        );
    }
}

/// An entity arriving from the remote, already translated to internal form.
#[derive(Debug, Clone)]
pub struct EntityImport<'a> {
    /// Local id to write under (the adopted entity's id when matched by name).
    pub id: &'a str,
    pub kind: EntityKind,
    pub name: &'a str,
    pub slug: Option<&'a str>,
    pub payload: &'a serde_json::Value,
    /// Remote blob hash, recorded as the new merge base.
    pub synced_hash: &'a str,
    pub synced_path: &'a str,
    /// Adopted entities stay dirty so the corrected id is pushed next run.
    pub adopted: bool,
}

/// Post-push bookkeeping for one path.
#[derive(Debug, Clone)]
pub enum SyncedRecord {
    Entity {
        id: String,
        hash: String,
        path: String,
        /// Dirty version observed when the content was read.
        dirty_version: Option<i64>,
    },
    File {
        path: String,
        hash: String,
    },
}

const ENTITY_COLUMNS: &str = "e.id, e.kind, e.name, e.slug, e.payload, e.last_synced_hash, \
     e.last_synced_path, d.version, e.created_at, e.updated_at";

fn map_entity_row(row: &Row<'_>) -> rusqlite::Result<PlatformEntity> {
    let kind: String = row.get(1)?;
    let payload: String = row.get(4)?;

    Ok(PlatformEntity {
        id: row.get(0)?,
        kind: kind.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
        })?,
        name: row.get(2)?,
        slug: row.get(3)?,
        payload: serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        last_synced_hash: row.get(5)?,
        last_synced_path: row.get(6)?,
        dirty_version: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn map_workflow_row(row: &Row<'_>) -> rusqlite::Result<Workflow> {
    Ok(Workflow {
        id: row.get(0)?,
        path: row.get(1)?,
        function_name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

impl SqliteStorage {
    /// Open a database at the given path.
    ///
    /// Creates the database and applies schema if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, None)
    }

    /// Open a database with an optional busy timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open_with_timeout(path: &Path, timeout_ms: Option<u64>) -> Result<Self> {
        let conn = Connection::open(path)?;

        if let Some(timeout) = timeout_ms {
            conn.busy_timeout(Duration::from_millis(timeout))?;
        } else {
            // Default 5 second timeout
            conn.busy_timeout(Duration::from_secs(5))?;
        }

        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Execute a mutation with the transaction protocol.
    ///
    /// This method:
    /// 1. Begins an IMMEDIATE transaction (for write locking)
    /// 2. Executes the mutation closure
    /// 3. Writes audit events
    /// 4. Commits (or rolls back on error)
    ///
    /// Dirty tracking is handled by triggers in the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails. The transaction is rolled back on error.
    pub fn mutate<F, R>(&mut self, op: &str, actor: &str, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction, &mut MutationContext) -> Result<R>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let mut ctx = MutationContext::new(op, actor);

        let result = f(&tx, &mut ctx)?;

        for event in &ctx.events {
            insert_event(&tx, event)?;
        }

        tx.commit()?;

        Ok(result)
    }

    /// Audit history of one record (`entity`, `workflow` or `file`), newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn history(&self, record_type: &str, record_id: &str, limit: u32) -> Result<Vec<Event>> {
        Ok(events::history(&self.conn, record_type, record_id, limit)?)
    }

    // ==================
    // Workflow Operations
    // ==================

    /// Register a workflow function, or return the existing one for the same
    /// `(path, function_name)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn upsert_workflow(
        &mut self,
        id: Option<&str>,
        path: &str,
        function_name: &str,
        actor: &str,
    ) -> Result<Workflow> {
        let now = chrono::Utc::now().timestamp_millis();
        let new_id = id.map_or_else(|| uuid::Uuid::new_v4().to_string(), ToString::to_string);

        self.mutate("upsert_workflow", actor, |tx, ctx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO workflows (id, path, function_name, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![new_id, path, function_name, now],
            )?;

            let workflow = tx.query_row(
                "SELECT id, path, function_name, created_at FROM workflows
                 WHERE path = ?1 AND function_name = ?2",
                rusqlite::params![path, function_name],
                map_workflow_row,
            )?;

            if inserted > 0 {
                // Entities exported before this workflow existed still carry
                // its raw id on the branch; their virtual files change now.
                let marked = tx.execute(
                    "INSERT INTO dirty_entities (entity_id, version, marked_at)
                     SELECT id, 1, ?2 FROM entities WHERE instr(payload, ?1) > 0
                     ON CONFLICT(entity_id) DO UPDATE SET
                         version = version + 1,
                         marked_at = excluded.marked_at",
                    rusqlite::params![workflow.id, now],
                )?;
                if marked > 0 {
                    tracing::debug!(workflow = %workflow.id, entities = marked, "Marked referencing entities dirty");
                }
                ctx.record_change(
                    "workflow",
                    &workflow.id,
                    EventType::WorkflowRegistered,
                    None,
                    Some(workflow.portable_ref()),
                );
            }

            Ok(workflow)
        })
    }

    /// List all registered workflows, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, path, function_name, created_at FROM workflows
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([], map_workflow_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // ==================
    // Entity Operations
    // ==================

    /// Create a new entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails (duplicate id or application slug).
    pub fn create_entity(&mut self, entity: &PlatformEntity, actor: &str) -> Result<()> {
        let payload = serde_json::to_string(&entity.payload)?;

        self.mutate("create_entity", actor, |tx, ctx| {
            tx.execute(
                "INSERT INTO entities (id, kind, name, slug, payload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    entity.id,
                    entity.kind.as_str(),
                    entity.name,
                    entity.slug,
                    payload,
                    entity.created_at,
                    entity.updated_at,
                ],
            )?;

            ctx.record_event("entity", &entity.id, EventType::EntityCreated);
            Ok(())
        })
    }

    /// Update an entity's name, slug and/or payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity doesn't exist or the update fails.
    pub fn update_entity(
        &mut self,
        id: &str,
        name: Option<&str>,
        slug: Option<&str>,
        payload: Option<&serde_json::Value>,
        actor: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let payload = payload.map(serde_json::to_string).transpose()?;

        self.mutate("update_entity", actor, |tx, ctx| {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM entities WHERE id = ?1)",
                [id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(Error::EntityNotFound { id: id.to_string() });
            }

            tx.execute(
                "UPDATE entities SET
                    name = COALESCE(?1, name),
                    slug = COALESCE(?2, slug),
                    payload = COALESCE(?3, payload),
                    updated_at = ?4
                 WHERE id = ?5",
                rusqlite::params![name, slug, payload, now, id],
            )?;

            ctx.record_event("entity", id, EventType::EntityUpdated);
            Ok(())
        })
    }

    /// Get an entity by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_entity(&self, id: &str) -> Result<Option<PlatformEntity>> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities e
             LEFT JOIN dirty_entities d ON d.entity_id = e.id
             WHERE e.id = ?1"
        );
        let entity = self
            .conn
            .query_row(&sql, [id], map_entity_row)
            .optional()?;
        Ok(entity)
    }

    /// Get an application by slug.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_entity_by_slug(&self, slug: &str) -> Result<Option<PlatformEntity>> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities e
             LEFT JOIN dirty_entities d ON d.entity_id = e.id
             WHERE e.kind = 'application' AND e.slug = ?1"
        );
        let entity = self
            .conn
            .query_row(&sql, [slug], map_entity_row)
            .optional()?;
        Ok(entity)
    }

    /// Find entities of a kind by exact name.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn find_entities_by_name(
        &self,
        kind: EntityKind,
        name: &str,
    ) -> Result<Vec<PlatformEntity>> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities e
             LEFT JOIN dirty_entities d ON d.entity_id = e.id
             WHERE e.kind = ?1 AND e.name = ?2
             ORDER BY e.created_at ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![kind.as_str(), name], map_entity_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// List entities, optionally filtered by kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_entities(&self, kind: Option<EntityKind>) -> Result<Vec<PlatformEntity>> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities e
             LEFT JOIN dirty_entities d ON d.entity_id = e.id
             WHERE (?1 IS NULL OR e.kind = ?1)
             ORDER BY e.kind ASC, e.created_at ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([kind.map(|k| k.as_str())], map_entity_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Get all entity IDs (for fuzzy "did you mean" suggestions).
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_all_entity_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT id FROM entities")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Write a pulled entity and its new merge base in one transaction.
    ///
    /// Returns `true` if a new row was created.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails; nothing is written in that case.
    pub fn import_entity(&mut self, import: &EntityImport<'_>, actor: &str) -> Result<bool> {
        let now = chrono::Utc::now().timestamp_millis();
        let payload = serde_json::to_string(import.payload)?;

        self.mutate("import_entity", actor, |tx, ctx| {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT name FROM entities WHERE id = ?1",
                    [import.id],
                    |row| row.get(0),
                )
                .optional()?;
            let created = existing.is_none();

            tx.execute(
                "INSERT INTO entities (id, kind, name, slug, payload, last_synced_hash,
                                       last_synced_path, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    slug = excluded.slug,
                    payload = excluded.payload,
                    last_synced_hash = excluded.last_synced_hash,
                    last_synced_path = excluded.last_synced_path,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    import.id,
                    import.kind.as_str(),
                    import.name,
                    import.slug,
                    payload,
                    import.synced_hash,
                    import.synced_path,
                    now,
                ],
            )?;

            if import.adopted {
                ctx.record_change(
                    "entity",
                    import.id,
                    EventType::EntityAdopted,
                    None,
                    Some(import.synced_path.to_string()),
                );
            } else {
                tx.execute(
                    "DELETE FROM dirty_entities WHERE entity_id = ?1",
                    [import.id],
                )?;
                ctx.record_change(
                    "entity",
                    import.id,
                    EventType::EntityImported,
                    existing,
                    Some(import.name.to_string()),
                );
            }

            Ok(created)
        })
    }

    /// Record the outcome of a successful push for many paths at once.
    ///
    /// An entity is cleared from dirty tracking only if it was not edited
    /// again after its content was read for the push.
    ///
    /// # Errors
    ///
    /// Returns an error if any update fails; nothing is recorded in that case.
    pub fn record_synced(&mut self, records: &[SyncedRecord], actor: &str) -> Result<()> {
        self.mutate("record_synced", actor, |tx, ctx| {
            for record in records {
                match record {
                    SyncedRecord::Entity {
                        id,
                        hash,
                        path,
                        dirty_version,
                    } => {
                        tx.execute(
                            "UPDATE entities SET last_synced_hash = ?1, last_synced_path = ?2
                             WHERE id = ?3",
                            rusqlite::params![hash, path, id],
                        )?;
                        if let Some(version) = dirty_version {
                            tx.execute(
                                "DELETE FROM dirty_entities WHERE entity_id = ?1 AND version = ?2",
                                rusqlite::params![id, version],
                            )?;
                        }
                        ctx.record_change("entity", id, EventType::PathPushed, None, Some(hash.clone()));
                    }
                    SyncedRecord::File { path, hash } => {
                        tx.execute(
                            "UPDATE workspace_files SET last_synced_hash = ?1 WHERE path = ?2",
                            rusqlite::params![hash, path],
                        )?;
                        ctx.record_change("file", path, EventType::PathPushed, None, Some(hash.clone()));
                    }
                }
            }
            Ok(())
        })
    }

    // ==================
    // Workspace File Operations
    // ==================

    /// Write a workspace file's content.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn put_workspace_file(&mut self, path: &str, content: &[u8], actor: &str) -> Result<String> {
        let now = chrono::Utc::now().timestamp_millis();
        let hash = blob_hash(content);

        self.mutate("put_workspace_file", actor, |tx, ctx| {
            tx.execute(
                "INSERT INTO workspace_files (path, content, content_hash, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(path) DO UPDATE SET
                    content = excluded.content,
                    content_hash = excluded.content_hash,
                    updated_at = excluded.updated_at",
                rusqlite::params![path, content, hash, now],
            )?;
            ctx.record_change("file", path, EventType::FileWritten, None, Some(hash.clone()));
            Ok(hash.clone())
        })
    }

    /// Write a pulled workspace file and its new merge base in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn import_workspace_file(
        &mut self,
        path: &str,
        content: &[u8],
        remote_hash: &str,
        actor: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let hash = blob_hash(content);

        self.mutate("import_workspace_file", actor, |tx, ctx| {
            tx.execute(
                "INSERT INTO workspace_files (path, content, content_hash, last_synced_hash, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(path) DO UPDATE SET
                    content = excluded.content,
                    content_hash = excluded.content_hash,
                    last_synced_hash = excluded.last_synced_hash,
                    updated_at = excluded.updated_at",
                rusqlite::params![path, content, hash, remote_hash, now],
            )?;
            ctx.record_change(
                "file",
                path,
                EventType::FileImported,
                None,
                Some(remote_hash.to_string()),
            );
            Ok(())
        })
    }

    /// Get a workspace file including its content.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_workspace_file(&self, path: &str) -> Result<Option<WorkspaceFile>> {
        let file = self
            .conn
            .query_row(
                "SELECT path, content, content_hash, last_synced_hash, updated_at
                 FROM workspace_files WHERE path = ?1",
                [path],
                |row| {
                    Ok(WorkspaceFile {
                        path: row.get(0)?,
                        content: row.get(1)?,
                        content_hash: row.get(2)?,
                        last_synced_hash: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(file)
    }

    /// List workspace files without their content.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list_workspace_files(&self) -> Result<Vec<WorkspaceFile>> {
        let mut stmt = self.conn.prepare(
            "SELECT path, content_hash, last_synced_hash, updated_at
             FROM workspace_files ORDER BY path ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(WorkspaceFile {
                path: row.get(0)?,
                content: Vec::new(),
                content_hash: row.get(1)?,
                last_synced_hash: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // ==================
    // Sync Lock Operations
    // ==================

    /// Try to take the sync lock for a workspace.
    ///
    /// Locks older than `ttl_ms` are treated as abandoned and taken over.
    /// Returns `None` on success, or the current holder if the lock is held.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn try_acquire_sync_lock(
        &mut self,
        workspace: &str,
        owner: &str,
        ttl_ms: i64,
    ) -> Result<Option<String>> {
        let now = chrono::Utc::now().timestamp_millis();

        self.mutate("acquire_sync_lock", owner, |tx, _ctx| {
            let stale = tx.execute(
                "DELETE FROM sync_locks WHERE workspace = ?1 AND acquired_at < ?2",
                rusqlite::params![workspace, now - ttl_ms],
            )?;
            if stale > 0 {
                tracing::warn!(workspace, "Took over an expired sync lock");
            }

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO sync_locks (workspace, owner, acquired_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![workspace, owner, now],
            )?;
            if inserted > 0 {
                return Ok(None);
            }

            let holder: String = tx.query_row(
                "SELECT owner FROM sync_locks WHERE workspace = ?1",
                [workspace],
                |row| row.get(0),
            )?;
            Ok(Some(holder))
        })
    }

    /// Release the sync lock if `owner` holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn release_sync_lock(&mut self, workspace: &str, owner: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM sync_locks WHERE workspace = ?1 AND owner = ?2",
            rusqlite::params![workspace, owner],
        )?;
        Ok(())
    }
}

//! Database schema definitions.
//!
//! The complete SQLite schema for the local platform store: workflows,
//! entities with dirty tracking, workspace files, the sync lock table and
//! the audit log.

use rusqlite::{Connection, Result};

/// Current schema version for migration tracking.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// The complete SQL schema.
///
/// Timestamps are stored as INTEGER (Unix milliseconds).
pub const SCHEMA_SQL: &str = r#"
-- ====================
-- Schema Version Tracking
-- ====================

CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

-- ====================
-- Core Tables
-- ====================

-- Workflows: callable functions, the targets of entity references
CREATE TABLE IF NOT EXISTS workflows (
    id TEXT PRIMARY KEY,
    path TEXT NOT NULL,
    function_name TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE(path, function_name)
);

-- Entities: applications, forms, agents
CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL CHECK (kind IN ('application', 'form', 'agent')),
    name TEXT NOT NULL,
    slug TEXT,
    payload TEXT NOT NULL DEFAULT '{}',
    last_synced_hash TEXT,
    last_synced_path TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_kind_name ON entities(kind, name);
CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_app_slug
    ON entities(slug) WHERE kind = 'application';

-- Workspace files: literally-stored files (source code etc.)
CREATE TABLE IF NOT EXISTS workspace_files (
    path TEXT PRIMARY KEY,
    content BLOB NOT NULL,
    content_hash TEXT NOT NULL,
    last_synced_hash TEXT,
    updated_at INTEGER NOT NULL
);

-- ====================
-- Sync Tables
-- ====================

-- Entities changed since their last sync. `version` increments on every
-- change so a sync can clear only the state it actually read.
CREATE TABLE IF NOT EXISTS dirty_entities (
    entity_id TEXT PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    marked_at INTEGER NOT NULL,
    FOREIGN KEY (entity_id) REFERENCES entities(id) ON DELETE CASCADE
);

-- One in-flight sync run per workspace
CREATE TABLE IF NOT EXISTS sync_locks (
    workspace TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    acquired_at INTEGER NOT NULL
);

-- ====================
-- Audit Log
-- ====================

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_type TEXT NOT NULL,
    record_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    actor TEXT NOT NULL,
    operation TEXT NOT NULL,
    old_value TEXT,
    new_value TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_record ON events(record_type, record_id);

-- ====================
-- Triggers
-- ====================

CREATE TRIGGER IF NOT EXISTS mark_entity_dirty_insert
AFTER INSERT ON entities
BEGIN
    INSERT INTO dirty_entities (entity_id, version, marked_at)
    VALUES (NEW.id, 1, strftime('%s', 'now') * 1000)
    ON CONFLICT(entity_id) DO UPDATE SET
        version = version + 1,
        marked_at = excluded.marked_at;
END;

CREATE TRIGGER IF NOT EXISTS mark_entity_dirty_update
AFTER UPDATE OF name, slug, payload ON entities
WHEN OLD.name IS NOT NEW.name
  OR OLD.slug IS NOT NEW.slug
  OR OLD.payload IS NOT NEW.payload
BEGIN
    INSERT INTO dirty_entities (entity_id, version, marked_at)
    VALUES (NEW.id, 1, strftime('%s', 'now') * 1000)
    ON CONFLICT(entity_id) DO UPDATE SET
        version = version + 1,
        marked_at = excluded.marked_at;
END;
"#;

/// Apply the schema to a connection.
///
/// # Errors
///
/// Returns an error if a pragma or DDL statement fails.
pub fn apply_schema(conn: &Connection) -> Result<()> {
    // Set pragmas before schema creation
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;

    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![
            format!("v{CURRENT_SCHEMA_VERSION}"),
            chrono::Utc::now().timestamp_millis()
        ],
    )?;

    Ok(())
}

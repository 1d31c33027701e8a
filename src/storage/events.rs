//! Audit trail for the local store.
//!
//! Every mutation appends one row per touched record, tagged with the storage
//! operation that produced it. Sync runs write here too, so the history of an
//! entity shows which pushes and pulls changed it.

use rusqlite::{Connection, Result, Row};

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    WorkflowRegistered,
    EntityCreated,
    EntityUpdated,
    FileWritten,
    // Written by sync runs
    EntityImported,
    EntityAdopted,
    FileImported,
    PathPushed,
}

impl EventType {
    const ALL: [Self; 8] = [
        Self::WorkflowRegistered,
        Self::EntityCreated,
        Self::EntityUpdated,
        Self::FileWritten,
        Self::EntityImported,
        Self::EntityAdopted,
        Self::FileImported,
        Self::PathPushed,
    ];

    /// Stored form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowRegistered => "workflow_registered",
            Self::EntityCreated => "entity_created",
            Self::EntityUpdated => "entity_updated",
            Self::FileWritten => "file_written",
            Self::EntityImported => "entity_imported",
            Self::EntityAdopted => "entity_adopted",
            Self::FileImported => "file_imported",
            Self::PathPushed => "path_pushed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

/// One audit row.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: i64,
    /// `entity`, `workflow` or `file`.
    pub record_type: String,
    /// Entity or workflow id, or the file path.
    pub record_id: String,
    pub event_type: EventType,
    pub actor: String,
    /// Storage operation that wrote the event (`import_entity`, `record_synced`, ...).
    pub operation: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub created_at: i64,
}

impl Event {
    #[must_use]
    pub fn new(
        record_type: &str,
        record_id: &str,
        event_type: EventType,
        actor: &str,
        operation: &str,
    ) -> Self {
        Self {
            id: 0,
            record_type: record_type.to_string(),
            record_id: record_id.to_string(),
            event_type,
            actor: actor.to_string(),
            operation: operation.to_string(),
            old_value: None,
            new_value: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[must_use]
    pub fn with_values(mut self, old: Option<String>, new: Option<String>) -> Self {
        self.old_value = old;
        self.new_value = new;
        self
    }

    fn from_row(row: &Row<'_>) -> Result<Self> {
        let raw: String = row.get(3)?;
        let event_type = EventType::parse(&raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown event type '{raw}'").into(),
            )
        })?;
        Ok(Self {
            id: row.get(0)?,
            record_type: row.get(1)?,
            record_id: row.get(2)?,
            event_type,
            actor: row.get(4)?,
            operation: row.get(5)?,
            old_value: row.get(6)?,
            new_value: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

/// Append an event.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn insert_event(conn: &Connection, event: &Event) -> Result<i64> {
    conn.execute(
        "INSERT INTO events (record_type, record_id, event_type, actor, operation,
                             old_value, new_value, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            event.record_type,
            event.record_id,
            event.event_type.as_str(),
            event.actor,
            event.operation,
            event.old_value,
            event.new_value,
            event.created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// History of one record, newest first.
///
/// # Errors
///
/// Returns an error if the query fails or a row holds an unknown event type.
pub fn history(
    conn: &Connection,
    record_type: &str,
    record_id: &str,
    limit: u32,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT id, record_type, record_id, event_type, actor, operation,
                old_value, new_value, created_at
         FROM events
         WHERE record_type = ?1 AND record_id = ?2
         ORDER BY id DESC
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(rusqlite::params![record_type, record_id, limit], Event::from_row)?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::apply_schema;

    #[test]
    fn test_history_newest_first() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();

        insert_event(
            &conn,
            &Event::new("entity", "f-1", EventType::EntityCreated, "ana", "create_entity"),
        )
        .unwrap();
        insert_event(
            &conn,
            &Event::new("entity", "f-1", EventType::PathPushed, "ana", "record_synced")
                .with_values(None, Some("abc".into())),
        )
        .unwrap();
        insert_event(
            &conn,
            &Event::new("entity", "f-2", EventType::EntityCreated, "ana", "create_entity"),
        )
        .unwrap();

        let events = history(&conn, "entity", "f-1", 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::PathPushed);
        assert_eq!(events[0].operation, "record_synced");
        assert_eq!(events[0].new_value.as_deref(), Some("abc"));
        assert_eq!(events[1].event_type, EventType::EntityCreated);
    }

    #[test]
    fn test_unknown_event_type_is_an_error() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO events (record_type, record_id, event_type, actor, operation, created_at)
             VALUES ('entity', 'x', 'bogus', 'ana', 'op', 0)",
            [],
        )
        .unwrap();
        assert!(history(&conn, "entity", "x", 10).is_err());
    }
}

//! SQLite storage layer for psync.
//!
//! This module provides the local platform store using SQLite with:
//! - WAL mode for concurrent reads
//! - Transaction discipline for atomic writes
//! - Trigger-based dirty tracking for sync
//! - Audit events for history
//!
//! # Submodules
//!
//! - [`events`] - Audit event storage
//! - [`schema`] - Database schema definitions
//! - [`sqlite`] - Main SQLite storage implementation

pub mod events;
pub mod schema;
pub mod sqlite;

pub use sqlite::{EntityImport, MutationContext, SqliteStorage, SyncedRecord};

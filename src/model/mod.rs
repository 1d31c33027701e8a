//! Data models for psync.
//!
//! This module contains all domain models:
//! - PlatformEntity (applications, forms, agents)
//! - Workflow (reference targets)
//! - WorkspaceFile

pub mod entity;

pub use entity::{slugify, EntityKind, PathKey, PlatformEntity, Workflow, WorkspaceFile};

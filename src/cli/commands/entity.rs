//! Local store commands: workflows, entities and workspace files.
//!
//! These stand in for the platform's own editors so a workspace can be
//! populated and inspected before it is synced.

use crate::cli::{EntityCommands, FileCommands, WorkflowCommands};
use crate::config::default_actor;
use crate::error::{Error, Result};
use crate::model::PlatformEntity;
use crate::sync::{build_ref_map, deserialize_entity, has_changed, to_internal};
use crate::validate::validate_workspace_path;
use colored::Colorize;
use serde::Serialize;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use super::open_storage;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImportOutput {
    id: String,
    created: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    unresolved_refs: Vec<String>,
}

#[derive(Serialize)]
struct PutOutput<'a> {
    path: &'a str,
    hash: String,
}

fn actor_or_default(actor: Option<&str>) -> String {
    actor.map_or_else(default_actor, ToString::to_string)
}

// ============================================================================
// Workflows
// ============================================================================

/// Execute workflow commands.
///
/// # Errors
///
/// Returns an error if the database operation fails.
pub fn execute_workflow(
    command: &WorkflowCommands,
    db_path: Option<&PathBuf>,
    actor: Option<&str>,
    json: bool,
) -> Result<()> {
    let mut storage = open_storage(db_path)?;

    match command {
        WorkflowCommands::Add { path, function, id } => {
            if path.is_empty() || function.is_empty() || function.contains("::") {
                return Err(Error::InvalidArgument(
                    "workflow path and function must be non-empty, without '::'".to_string(),
                ));
            }
            let workflow =
                storage.upsert_workflow(id.as_deref(), path, function, &actor_or_default(actor))?;
            if json {
                println!("{}", serde_json::to_string(&workflow)?);
            } else {
                println!("{} {}", workflow.id, workflow.portable_ref().cyan());
            }
        }
        WorkflowCommands::List => {
            let workflows = storage.list_workflows()?;
            if json {
                println!("{}", serde_json::to_string(&workflows)?);
            } else if workflows.is_empty() {
                println!("No workflows registered.");
            } else {
                for workflow in &workflows {
                    println!("  {} {}", workflow.id.dimmed(), workflow.portable_ref());
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Entities
// ============================================================================

/// Execute entity commands.
///
/// # Errors
///
/// Returns an error if the document is malformed or the database write fails.
pub fn execute_entity(
    command: &EntityCommands,
    db_path: Option<&PathBuf>,
    actor: Option<&str>,
    json: bool,
) -> Result<()> {
    let mut storage = open_storage(db_path)?;

    match command {
        EntityCommands::Import { kind, file } => {
            let content = fs::read(file)?;
            let doc = deserialize_entity(&file.display().to_string(), &content)?;

            // Documents exported by psync carry portable refs; translate them back.
            let (payload, unresolved) = match &doc.export {
                Some(meta) => {
                    let map = build_ref_map(&storage.list_workflows()?);
                    let ref_paths: Vec<&str> = meta.ref_paths.iter().map(String::as_str).collect();
                    to_internal(&doc.payload, &ref_paths, &map)?
                }
                None => (doc.payload.clone(), Vec::new()),
            };

            let actor = actor_or_default(actor);
            let existing = match &doc.id {
                Some(id) => storage.get_entity(id)?,
                None => None,
            };

            let output = match existing {
                Some(entity) if entity.kind != *kind => {
                    return Err(Error::InvalidArgument(format!(
                        "{} is a {}, not a {kind}",
                        entity.id, entity.kind
                    )));
                }
                Some(entity) => {
                    let slug = if kind.keyed_by_slug() { doc.slug.as_deref() } else { None };
                    storage.update_entity(&entity.id, Some(&doc.name), slug, Some(&payload), &actor)?;
                    ImportOutput {
                        id: entity.id,
                        created: false,
                        unresolved_refs: unresolved,
                    }
                }
                None => {
                    let mut entity = PlatformEntity::new(*kind, doc.name.clone(), payload);
                    if let Some(id) = &doc.id {
                        entity.id.clone_from(id);
                    }
                    if kind.keyed_by_slug() && doc.slug.is_some() {
                        entity.slug.clone_from(&doc.slug);
                    }
                    storage.create_entity(&entity, &actor)?;
                    ImportOutput {
                        id: entity.id,
                        created: true,
                        unresolved_refs: unresolved,
                    }
                }
            };

            if json {
                println!("{}", serde_json::to_string(&output)?);
            } else {
                let verb = if output.created { "Created" } else { "Updated" };
                println!("{verb} {kind} {}", output.id);
                for portable in &output.unresolved_refs {
                    println!("  {} {portable}", "unresolved".yellow());
                }
            }
        }
        EntityCommands::List { kind } => {
            let entities = storage.list_entities(*kind)?;
            if json {
                println!("{}", serde_json::to_string(&entities)?);
            } else if entities.is_empty() {
                println!("No entities.");
            } else {
                for entity in &entities {
                    let marker = if entity.is_dirty() { "*".yellow() } else { " ".normal() };
                    println!(
                        "{marker} {} {:<12} {}",
                        entity.id.dimmed(),
                        entity.kind.as_str(),
                        entity.name
                    );
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Workspace files
// ============================================================================

fn read_source(source: Option<&Path>) -> Result<Vec<u8>> {
    match source {
        Some(path) => Ok(fs::read(path)?),
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

/// Execute workspace file commands.
///
/// # Errors
///
/// Returns an error if the path is reserved or invalid, or the write fails.
pub fn execute_file(
    command: &FileCommands,
    db_path: Option<&PathBuf>,
    actor: Option<&str>,
    json: bool,
) -> Result<()> {
    match command {
        FileCommands::Put { path, source } => {
            validate_workspace_path(path).map_err(Error::InvalidArgument)?;
            let mut storage = open_storage(db_path)?;
            let content = read_source(source.as_deref())?;
            let hash = storage.put_workspace_file(path, &content, &actor_or_default(actor))?;

            if json {
                println!("{}", serde_json::to_string(&PutOutput { path, hash })?);
            } else {
                println!("Stored {path} ({})", hash.dimmed());
            }
        }
        FileCommands::List => {
            let storage = open_storage(db_path)?;
            let files = storage.list_workspace_files()?;
            if json {
                println!("{}", serde_json::to_string(&files)?);
            } else if files.is_empty() {
                println!("No workspace files.");
            } else {
                for file in &files {
                    let changed = has_changed(&file.content_hash, file.last_synced_hash.as_deref());
                    let marker = if changed { "*".yellow() } else { " ".normal() };
                    println!("{marker} {}", file.path);
                }
            }
        }
    }
    Ok(())
}

//! Sync command implementations (preview, execute, candidates, refs).
//!
//! Remote settings come from `~/.psync/config.json` (see [`crate::config`]).
//! Every remote call goes through [`Retrying`] so transient failures are
//! retried with backoff before a command gives up.

use crate::cli::ExecuteArgs;
use crate::config::{default_actor, load_settings, SyncSettings};
use crate::error::{Error, Result};
use crate::model::{EntityKind, PathKey};
use crate::sync::{
    self, build_ref_map, deserialize_entity, rank_candidates, GitHost, GitHubHost,
    IdentityResolution, Resolution, RetryPolicy, Retrying, SyncExecuteRequest, SyncExecuteResult,
    SyncOptions, SyncPlan, SyncStatus,
};
use crate::storage::SqliteStorage;
use crate::validate::{find_similar_ids, normalize_status};
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::open_storage;

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| Error::Other(format!("Failed to create runtime: {e}")))
}

/// Build the retrying GitHub client for the configured remote.
fn build_host(settings: &SyncSettings) -> Result<Retrying<GitHubHost>> {
    let remote = settings.remote.require()?;
    let host = GitHubHost::new(remote, Duration::from_secs(settings.timeout_secs));
    Ok(Retrying::new(host, RetryPolicy::from_settings(settings)))
}

// ============================================================================
// Preview
// ============================================================================

/// Execute the preview command.
///
/// # Errors
///
/// Returns an error if the status filter is invalid, the remote is not
/// configured, or the preview fails.
pub fn preview(
    status: Option<&str>,
    save: Option<&PathBuf>,
    db_path: Option<&PathBuf>,
    json: bool,
) -> Result<()> {
    let filter = status
        .map(|s| {
            normalize_status(s).map_err(|(input, suggestion)| {
                let hint = suggestion.map_or_else(String::new, |s| format!(" (did you mean '{s}'?)"));
                Error::InvalidArgument(format!("Unknown status '{input}'{hint}"))
            })
        })
        .transpose()?
        .map(|s| s.parse::<SyncStatus>().map_err(Error::InvalidArgument))
        .transpose()?;

    let settings = load_settings()?;
    let host = build_host(&settings)?;
    let mut storage = open_storage(db_path)?;
    let options = SyncOptions::from_settings(&settings, "psync");

    let plan = runtime()?.block_on(sync::preview(&mut storage, &host, &options))?;

    if let Some(path) = save {
        fs::write(path, serde_json::to_string_pretty(&plan)?)?;
        tracing::info!(path = %path.display(), "Plan saved");
    }

    let entries: Vec<_> = plan
        .entries
        .iter()
        .filter(|e| filter.is_none_or(|f| e.status == f))
        .collect();

    if json {
        let output = serde_json::json!({
            "remoteCommit": plan.remote_commit,
            "counts": plan.counts(),
            "entries": entries,
        });
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    if plan.is_clean() && filter.is_none() {
        println!("Everything up to date ({} paths).", plan.entries.len());
        return Ok(());
    }

    for entry in entries {
        if filter.is_none() && entry.status == SyncStatus::Unchanged {
            continue;
        }
        let label = format!("{:<10}", entry.status.as_str());
        let label = match entry.status {
            SyncStatus::ToPush => label.green(),
            SyncStatus::ToPull => label.cyan(),
            SyncStatus::Conflict => label.red().bold(),
            SyncStatus::ToDelete => label.yellow(),
            SyncStatus::Unchanged => label.dimmed(),
        };
        println!("  {label} {}", entry.path);
    }

    println!();
    let summary: Vec<String> = plan
        .counts()
        .iter()
        .map(|(status, n)| format!("{n} {status}"))
        .collect();
    println!("{}", summary.join(", ").dimmed());
    if plan.paths_with(SyncStatus::Conflict).next().is_some() {
        println!(
            "Resolve conflicts with {} or {}.",
            "--keep-local <path>".cyan(),
            "--keep-remote <path>".cyan()
        );
    }
    Ok(())
}

// ============================================================================
// Execute
// ============================================================================

/// Build the request from a request file plus command-line flags.
fn build_request(
    args: &ExecuteArgs,
    settings: &SyncSettings,
    storage: &SqliteStorage,
) -> Result<SyncExecuteRequest> {
    let mut request: SyncExecuteRequest = match &args.request {
        Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
        None => SyncExecuteRequest::default(),
    };

    request.push_paths.extend(args.push.iter().cloned());
    request.pull_paths.extend(args.pull.iter().cloned());
    for path in &args.keep_local {
        request
            .conflict_resolutions
            .insert(path.clone(), Resolution::KeepLocal);
    }
    for path in &args.keep_remote {
        request
            .conflict_resolutions
            .insert(path.clone(), Resolution::KeepRemote);
    }
    for pair in &args.adopt {
        let (path, id) = pair
            .split_once('=')
            .filter(|(p, id)| !p.is_empty() && !id.is_empty())
            .ok_or_else(|| Error::InvalidArgument(format!("--adopt expects PATH=UUID, got '{pair}'")))?;
        check_adopt_target(storage, id)?;
        request
            .identity_resolutions
            .insert(path.to_string(), IdentityResolution::Adopt(id.to_string()));
    }
    for path in &args.create_new {
        request
            .identity_resolutions
            .insert(path.clone(), IdentityResolution::CreateNew);
    }
    request.allow_name_matching |= args.match_by_name || settings.allow_name_matching;
    Ok(request)
}

/// Fail early on a mistyped adopt target, suggesting close ids.
fn check_adopt_target(storage: &SqliteStorage, id: &str) -> Result<()> {
    if storage.get_entity(id)?.is_some() {
        return Ok(());
    }
    let similar = find_similar_ids(id, &storage.get_all_entity_ids()?, 3);
    if similar.is_empty() {
        Err(Error::EntityNotFound { id: id.to_string() })
    } else {
        Err(Error::EntityNotFoundSimilar {
            id: id.to_string(),
            similar,
        })
    }
}

fn load_plan(path: &Path) -> Result<SyncPlan> {
    let mut plan: SyncPlan = serde_json::from_str(&fs::read_to_string(path)?)?;
    plan.entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(plan)
}

/// Execute the execute command.
///
/// # Errors
///
/// Returns an error if the request is invalid or empty, the remote is not
/// configured, or the run cannot start. Per-path failures are reported in
/// the output, not as errors.
pub fn execute(
    args: &ExecuteArgs,
    db_path: Option<&PathBuf>,
    actor: Option<&str>,
    json: bool,
) -> Result<()> {
    let settings = load_settings()?;
    let host = build_host(&settings)?;
    let mut storage = open_storage(db_path)?;

    let mut request = build_request(args, &settings, &storage)?;
    let mut plan = args.plan.as_deref().map(load_plan).transpose()?;
    let actor = actor.map_or_else(default_actor, ToString::to_string);
    let options = SyncOptions::from_settings(&settings, &actor);
    let rt = runtime()?;

    if args.all {
        if plan.is_none() {
            plan = Some(rt.block_on(sync::preview(&mut storage, &host, &options))?);
        }
        if let Some(plan) = &plan {
            request.push_paths.extend(
                plan.paths_with(SyncStatus::ToPush)
                    .chain(plan.paths_with(SyncStatus::ToDelete))
                    .map(ToString::to_string),
            );
            request
                .pull_paths
                .extend(plan.paths_with(SyncStatus::ToPull).map(ToString::to_string));
        }
    }

    if request.push_paths.is_empty()
        && request.pull_paths.is_empty()
        && request.conflict_resolutions.is_empty()
    {
        if json {
            println!("{}", serde_json::to_string(&SyncExecuteResult::default())?);
        } else {
            println!("Nothing to execute. Pass --push/--pull paths or --all.");
        }
        return Ok(());
    }

    let result = rt.block_on(sync::execute(
        &mut storage,
        &host,
        &options,
        plan.as_ref(),
        &request,
    ))?;

    if json {
        println!("{}", serde_json::to_string(&result)?);
    } else {
        print_result(&result);
    }
    Ok(())
}

fn print_result(result: &SyncExecuteResult) {
    for path in &result.pushed {
        println!("  {} {path}", "pushed ".green());
    }
    for path in &result.pulled {
        println!("  {} {path}", "pulled ".cyan());
    }
    for adopted in &result.adopted {
        println!(
            "  {} {} -> local {}",
            "adopted".yellow(),
            adopted.path,
            adopted.local_id
        );
    }
    for path in &result.conflicts {
        println!("  {} {path}", "conflict".red().bold());
    }
    for failure in &result.failed {
        println!("  {} {}: {}", "failed ".red(), failure.path, failure.error);
        for candidate in &failure.candidates {
            println!("           candidate {}", candidate.dimmed());
        }
    }
    for unresolved in &result.unresolved_refs {
        println!(
            "  {} {} in {}",
            "unresolved".yellow(),
            unresolved.portable_ref,
            unresolved.path
        );
    }

    if let Some(commit) = &result.commit {
        println!();
        println!("Commit: {commit}");
    }
    if !result.is_complete() {
        println!();
        println!(
            "{} Run `psync preview` to review what is left.",
            "Incomplete.".yellow()
        );
    }
}

// ============================================================================
// Candidates
// ============================================================================

/// Execute the candidates command.
///
/// # Errors
///
/// Returns an error if the path is not an entity path, is missing from the
/// remote branch, or its content is malformed.
pub fn candidates(path: &str, db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let (kind, _) = EntityKind::parse_path(path).ok_or_else(|| Error::PathNotFound {
        path: path.to_string(),
    })?;

    let settings = load_settings()?;
    let host = build_host(&settings)?;
    let storage = open_storage(db_path)?;

    let content = runtime()?.block_on(async {
        let tree = host.fetch_tree().await?;
        let sha = tree.blobs.get(path).ok_or_else(|| Error::PathNotFound {
            path: path.to_string(),
        })?;
        Ok::<_, Error>(host.fetch_blob(sha).await?)
    })?;

    let doc = deserialize_entity(path, &content)?;
    let slug = doc.slug.clone().or_else(|| match EntityKind::parse_path(path) {
        Some((_, PathKey::Slug(slug))) => Some(slug),
        _ => None,
    });
    let ranked = rank_candidates(&storage, kind, &doc.name, slug.as_deref())?;

    if json {
        let output = serde_json::json!({
            "path": path,
            "incoming": {"id": doc.id, "name": doc.name, "slug": slug},
            "candidates": ranked,
        });
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!("Incoming {kind} \"{}\" ({path})", doc.name);
    if ranked.is_empty() {
        println!("  No similar local entities. Pulling it creates a new one.");
        return Ok(());
    }
    for candidate in &ranked {
        let marker = if candidate.exact { "=" } else { "~" };
        println!(
            "  {marker} {} {} {}",
            candidate.id,
            candidate.name.bold(),
            format!("({:.2})", candidate.score).dimmed()
        );
    }
    println!();
    println!(
        "Choose with {} or {}.",
        format!("--adopt {path}=<id>").cyan(),
        format!("--create-new {path}").cyan()
    );
    Ok(())
}

// ============================================================================
// Refs
// ============================================================================

/// Execute the refs command.
///
/// # Errors
///
/// Returns an error if the database cannot be read.
pub fn refs(db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let storage = open_storage(db_path)?;
    let map = build_ref_map(&storage.list_workflows()?);

    if json {
        let entries: Vec<_> = map
            .entries()
            .into_iter()
            .map(|(id, portable)| serde_json::json!({"id": id, "ref": portable}))
            .collect();
        println!("{}", serde_json::to_string(&entries)?);
        return Ok(());
    }

    if map.is_empty() {
        println!("No workflows registered. Use `psync workflow add <path> <function>`.");
        return Ok(());
    }
    for (id, portable) in map.entries() {
        println!("  {} {portable}", id.dimmed());
    }
    Ok(())
}

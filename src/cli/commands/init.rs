//! Initialize the local psync database.
//!
//! Creates the database (schema is applied on open) and, when no config file
//! exists yet, a `~/.psync/config.json` template carrying any remote given on
//! the command line.

use crate::cli::InitArgs;
use crate::config::{global_psync_dir, load_settings_from, resolve_db_path, save_settings_to};
use crate::error::{Error, Result};
use crate::storage::SqliteStorage;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

#[derive(Serialize)]
struct InitOutput {
    database: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<PathBuf>,
}

/// Execute the init command.
///
/// # Errors
///
/// Returns [`Error::AlreadyInitialized`] if the database exists and `--force`
/// was not given, or an error if the database or config cannot be written.
pub fn execute(args: &InitArgs, db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let db_path = resolve_db_path(db_path.map(PathBuf::as_path)).ok_or_else(|| {
        Error::Config("Could not determine the psync data directory".to_string())
    })?;

    if db_path.exists() && !args.force {
        return Err(Error::AlreadyInitialized { path: db_path });
    }

    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if args.force && db_path.exists() {
        fs::remove_file(&db_path)?;
    }
    SqliteStorage::open(&db_path)?;

    let config = write_config_template(args)?;

    if json {
        let output = InitOutput {
            database: db_path,
            config,
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("Initialized psync database");
        println!("  Database: {}", db_path.display());
        if let Some(config) = config {
            println!("  Config:   {}", config.display());
        }
        println!();
        println!("Next: register workflows with 'psync workflow add', then 'psync preview'.");
    }

    Ok(())
}

/// Write the config file unless one exists. Returns its path when written.
fn write_config_template(args: &InitArgs) -> Result<Option<PathBuf>> {
    let Some(path) = global_psync_dir().map(|dir| dir.join("config.json")) else {
        return Ok(None);
    };
    if path.exists() && args.owner.is_none() && args.repo.is_none() && args.branch.is_none() {
        return Ok(None);
    }

    let mut settings = load_settings_from(&path)?;
    if let Some(owner) = &args.owner {
        settings.remote.owner.clone_from(owner);
    }
    if let Some(repo) = &args.repo {
        settings.remote.repo.clone_from(repo);
    }
    if let Some(branch) = &args.branch {
        settings.remote.branch.clone_from(branch);
    }
    save_settings_to(&path, &settings)?;
    Ok(Some(path))
}

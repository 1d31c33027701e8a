//! CLI definitions using clap.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::model::EntityKind;

pub mod commands;

/// psync - mirror platform entities into Git
#[derive(Parser, Debug)]
#[command(name = "psync", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database path (default: ~/.psync/data/psync.db)
    #[arg(long, global = true, env = "PSYNC_DB")]
    pub db: Option<PathBuf>,

    /// Actor name for audit trail
    #[arg(long, global = true, env = "PSYNC_ACTOR")]
    pub actor: Option<String>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the local database and a config template
    Init(InitArgs),

    /// Print version information
    Version,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Classify every path against the remote branch
    Preview {
        /// Only show entries with this status (to_push, to_pull, conflict, ...)
        #[arg(long, short)]
        status: Option<String>,

        /// Write the plan to a file for a later `execute --plan`
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Push and pull selected paths
    Execute(ExecuteArgs),

    /// Rank local entities an incoming remote file could match
    Candidates {
        /// Remote path of an entity file
        path: String,
    },

    /// Print the workflow reference map
    Refs,

    /// Workflow registration
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },

    /// Local entity management
    Entity {
        #[command(subcommand)]
        command: EntityCommands,
    },

    /// Workspace file management
    File {
        #[command(subcommand)]
        command: FileCommands,
    },
}

/// Supported shells for completion generation.
#[derive(ValueEnum, Clone, Debug)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing database
    #[arg(long)]
    pub force: bool,

    /// Remote repository owner written to the config template
    #[arg(long)]
    pub owner: Option<String>,

    /// Remote repository name written to the config template
    #[arg(long)]
    pub repo: Option<String>,

    /// Branch to sync with
    #[arg(long)]
    pub branch: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct ExecuteArgs {
    /// Path to push (repeatable)
    #[arg(long = "push", value_name = "PATH")]
    pub push: Vec<String>,

    /// Path to pull (repeatable)
    #[arg(long = "pull", value_name = "PATH")]
    pub pull: Vec<String>,

    /// Resolve a conflict by pushing the local side
    #[arg(long = "keep-local", value_name = "PATH")]
    pub keep_local: Vec<String>,

    /// Resolve a conflict by pulling the remote side
    #[arg(long = "keep-remote", value_name = "PATH")]
    pub keep_remote: Vec<String>,

    /// Update this local entity from the remote file (PATH=UUID)
    #[arg(long = "adopt", value_name = "PATH=UUID")]
    pub adopt: Vec<String>,

    /// Import the remote file as a new entity
    #[arg(long = "create-new", value_name = "PATH")]
    pub create_new: Vec<String>,

    /// Adopt same-named local entities on pull
    #[arg(long)]
    pub match_by_name: bool,

    /// Read a request body (pushPaths, pullPaths, ...) from a JSON file
    #[arg(long)]
    pub request: Option<PathBuf>,

    /// Execute against a plan saved by `preview --save`
    #[arg(long)]
    pub plan: Option<PathBuf>,

    /// Push every to_push/to_delete path and pull every to_pull path
    #[arg(long)]
    pub all: bool,
}

// ============================================================================
// Workflow Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum WorkflowCommands {
    /// Register a workflow function
    Add {
        /// Source file path relative to the workspace root
        path: String,

        /// Function name inside the file
        function: String,

        /// Use this UUID instead of a generated one
        #[arg(long)]
        id: Option<String>,
    },

    /// List registered workflows
    List,
}

// ============================================================================
// Entity Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum EntityCommands {
    /// Create or update an entity from a JSON document
    Import {
        /// Entity kind (application, form, agent)
        kind: EntityKind,

        /// JSON file with `name`, optional `id`/`slug`, and payload fields
        file: PathBuf,
    },

    /// List local entities
    List {
        /// Only this kind
        #[arg(long)]
        kind: Option<EntityKind>,
    },
}

// ============================================================================
// File Commands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum FileCommands {
    /// Store a workspace file
    Put {
        /// Repository path to store the file under
        path: String,

        /// Local file to read (stdin when omitted)
        source: Option<PathBuf>,
    },

    /// List workspace files
    List,
}

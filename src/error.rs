//! Error types for the psync CLI and library.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Category-based exit codes (2=db, 3=not_found, 4=validation, 6=sync, ...)
//! - Retryability flags so scripted callers know when to try again
//! - Context-aware recovery hints
//! - Structured JSON output for piped / non-TTY consumers

use std::path::PathBuf;
use thiserror::Error;

use crate::sync::{RemoteError, SyncError};

/// Result type alias for psync operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
///
/// Each code maps to a SCREAMING_SNAKE string and a category-based
/// exit code. Scripts match on the string or on the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Database (exit 2)
    NotInitialized,
    AlreadyInitialized,
    DatabaseError,

    // Not Found (exit 3)
    EntityNotFound,
    PathNotFound,

    // Validation (exit 4)
    InvalidArgument,
    MalformedContent,
    AmbiguousIdentity,

    // Sync (exit 6)
    SyncError,
    SyncInProgress,
    StalePreview,
    RemoteError,

    // Config (exit 7)
    ConfigError,

    // I/O (exit 8)
    IoError,
    JsonError,

    // Internal (exit 1)
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::AlreadyInitialized => "ALREADY_INITIALIZED",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::EntityNotFound => "ENTITY_NOT_FOUND",
            Self::PathNotFound => "PATH_NOT_FOUND",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::MalformedContent => "MALFORMED_CONTENT",
            Self::AmbiguousIdentity => "AMBIGUOUS_IDENTITY",
            Self::SyncError => "SYNC_ERROR",
            Self::SyncInProgress => "SYNC_IN_PROGRESS",
            Self::StalePreview => "STALE_PREVIEW",
            Self::RemoteError => "REMOTE_ERROR",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category-based exit code (1-8).
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InternalError => 1,
            Self::NotInitialized | Self::AlreadyInitialized | Self::DatabaseError => 2,
            Self::EntityNotFound | Self::PathNotFound => 3,
            Self::InvalidArgument | Self::MalformedContent | Self::AmbiguousIdentity => 4,
            Self::SyncError | Self::SyncInProgress | Self::StalePreview | Self::RemoteError => 6,
            Self::ConfigError => 7,
            Self::IoError | Self::JsonError => 8,
        }
    }

    /// Whether the caller may retry the same operation later.
    ///
    /// A held lock or a stale preview clears up on its own (re-run preview);
    /// remote errors only surface here after the client's own retries.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SyncInProgress | Self::StalePreview | Self::RemoteError | Self::DatabaseError
        )
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in psync operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not initialized: run `psync init` first")]
    NotInitialized,

    #[error("Already initialized at {path}")]
    AlreadyInitialized { path: PathBuf },

    #[error("Entity not found: {id}")]
    EntityNotFound { id: String },

    #[error("Entity not found: {id} (did you mean: {}?)", similar.join(", "))]
    EntityNotFoundSimilar { id: String, similar: Vec<String> },

    #[error("Path not found: {path}")]
    PathNotFound { path: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        Self::Sync(SyncError::Remote(err))
    }
}

impl Error {
    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::AlreadyInitialized { .. } => ErrorCode::AlreadyInitialized,
            Self::Database(_) => ErrorCode::DatabaseError,
            Self::EntityNotFound { .. } | Self::EntityNotFoundSimilar { .. } => {
                ErrorCode::EntityNotFound
            }
            Self::PathNotFound { .. } => ErrorCode::PathNotFound,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::Sync(inner) => match inner {
                SyncError::SyncInProgress { .. } => ErrorCode::SyncInProgress,
                SyncError::StalePreview { .. } => ErrorCode::StalePreview,
                SyncError::Remote(_) => ErrorCode::RemoteError,
                SyncError::AmbiguousIdentity { .. } => ErrorCode::AmbiguousIdentity,
                SyncError::MalformedContent { .. } | SyncError::MalformedPayload { .. } => {
                    ErrorCode::MalformedContent
                }
                SyncError::UnknownPath(_) | SyncError::NotFound(_) => ErrorCode::PathNotFound,
                SyncError::Database(_) => ErrorCode::DatabaseError,
                SyncError::Json(_) => ErrorCode::JsonError,
            },
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Category-based exit code, delegating to the `ErrorCode`.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.error_code().exit_code()
    }

    /// Context-aware recovery hint.
    ///
    /// Returns `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::NotInitialized => Some("Run `psync init` to create the local database".to_string()),

            Self::AlreadyInitialized { path } => Some(format!(
                "Database already exists at {}. Use `--force` to reinitialize.",
                path.display()
            )),

            Self::EntityNotFound { id } => Some(format!(
                "No entity with ID '{id}'. Use `psync preview` to see tracked paths."
            )),
            Self::EntityNotFoundSimilar { similar, .. } => {
                Some(format!("Did you mean: {}?", similar.join(", ")))
            }

            Self::PathNotFound { path } => Some(format!(
                "'{path}' is neither a tracked workspace file nor a known entity path \
                 (apps/<slug>.app.json, forms/<uuid>.form.json, agents/<uuid>.agent.json)."
            )),

            Self::Sync(SyncError::SyncInProgress { workspace, .. }) => Some(format!(
                "Another sync run holds the lock for workspace '{workspace}'. \
                 Wait for it to finish, then re-run `psync preview`."
            )),

            Self::Sync(SyncError::StalePreview { .. }) => Some(
                "The remote branch moved since the preview. Run `psync preview` again.".to_string(),
            ),

            Self::Sync(SyncError::AmbiguousIdentity { path, candidates }) => {
                let mut hint = format!("Choose a target for '{path}':\n");
                for candidate in candidates {
                    hint.push_str(&format!("    --adopt {path}={candidate}\n"));
                }
                hint.push_str(&format!("    --create-new {path}"));
                Some(hint)
            }

            Self::Config(_) => {
                Some("Check ~/.psync/config.json or the PSYNC_* environment variables".to_string())
            }

            Self::Database(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Sync(_)
            | Self::InvalidArgument(_)
            | Self::Other(_) => None,
        }
    }

    /// Structured JSON representation for machine consumption.
    ///
    /// Includes error code, message, retryability, exit code, and
    /// optional recovery hint.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": code.is_retryable(),
                "exit_code": code.exit_code(),
            }
        });

        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}

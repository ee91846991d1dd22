//! Error types for sync operations.
//!
//! Every variant renders a context-rich message. Variants the user can act on
//! carry a `Suggestion:` line, the same way failures are presented in the CLI.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::api::ApiError;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for staging, transfer and commit failures.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("A sync was already started with this engine\nSuggestion: Create a new SyncEngine for every sync run")]
    AlreadyStarted,

    #[error(
        "Invalid control directory \"{value}\": it must be a single directory name inside the project\n\
         Suggestion: Set control_dir to a plain name such as \".fieldsync\""
    )]
    InvalidControlDir { value: String },

    #[error("Invalid file record \"{name}\": {reason}")]
    InvalidRecord { name: String, reason: String },

    #[error("I/O error while {operation} {}: {source}", .path.display())]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Request for \"{name}\" failed: {source}")]
    Api {
        name: String,
        #[source]
        source: ApiError,
    },

    #[error("Downloaded file \"{}\" not found", .path.display())]
    MissingDownload { name: String, path: PathBuf },

    #[error("Failed to copy downloaded files into the project: {source}")]
    Commit {
        #[source]
        source: Box<SyncError>,
    },

    #[error(
        "Failed to rollback the backup. Your project might be corrupted: {source}\n\
         Suggestion: Check the \"{}\" directory and copy the files back manually",
        .backup_dir.display()
    )]
    RollbackFailed {
        backup_dir: PathBuf,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Transport event channel closed before the sync completed")]
    TransportClosed,
}

impl SyncError {
    /// Wrap an io::Error with the operation and the path it was performed on.
    pub fn io(source: io::Error, operation: &str, path: impl Into<PathBuf>) -> Self {
        SyncError::Io {
            operation: operation.to_string(),
            path: path.into(),
            source,
        }
    }

    pub fn api(name: impl Into<String>, source: ApiError) -> Self {
        SyncError::Api {
            name: name.into(),
            source,
        }
    }

    /// Whether the working directory may be left in an inconsistent state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::RollbackFailed { .. })
    }
}

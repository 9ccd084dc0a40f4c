//! Storage layer error types
//!
//! All errors that can occur in the object store, the staged index and the
//! repository wrapper are defined here. We use `thiserror` so every layer
//! above can chain them with `#[from]`.

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::types::InvalidNameError;

/// the main error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// error from the underlying Git library
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// I/O error (filesystem level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// a path handed to the index cannot be stored in a tree
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// a branch or tag name is unusable even after sanitizing
    #[error("invalid ref name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// the specified branch/ref was not found
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// the commit was not found
    #[error("commit not found: {0}")]
    CommitNotFound(String),

    /// repo is empty (no commits)
    #[error("repository is empty: no commits found")]
    EmptyRepository,

    /// repo is not initialized
    #[error("repository not initialized: {0}")]
    NotInitialized(PathBuf),

    /// the merge machinery refused to combine two branches
    #[error("merge of '{branch}' failed, conflicting paths: {}", paths_display(.conflicting_paths))]
    MergeConflict {
        branch: String,
        conflicting_paths: Vec<PathBuf>,
    },

    /// internal error (bug)
    #[error("internal storage error: {0}")]
    Internal(String),
}

fn paths_display(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// check if this is a "not found" type error
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::RefNotFound(_)
                | StorageError::CommitNotFound(_)
                | StorageError::NotInitialized(_)
        )
    }

    /// check if this error was raised by a failed merge
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::MergeConflict { .. })
    }

    pub(crate) fn invalid_path(path: &str, reason: &'static str) -> Self {
        StorageError::InvalidPath {
            path: path.escape_default().to_string(),
            reason,
        }
    }
}

//! Explicit outcomes of a unit of work.
//!
//! A transaction body never unwinds to stop early: it returns `Err(Abort)`.
//! The runner matches on that value, so a rollback is an ordinary return
//! value rather than a dedicated error type caught somewhere up the stack.

use std::fmt;

use crate::db::DatabaseError;
use crate::model::ModelError;
use crate::storage::{CommitId, StorageError};

/// Why a transaction body stopped.
#[derive(Debug)]
pub enum Abort {
    /// caller-initiated rollback; not a fault
    Rollback(String),
    /// anything else that went wrong
    Fail(DatabaseError),
}

impl Abort {
    pub fn rollback(reason: impl Into<String>) -> Self {
        Abort::Rollback(reason.into())
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self, Abort::Rollback(_))
    }
}

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Abort::Rollback(reason) => write!(f, "rolled back: {}", reason),
            Abort::Fail(err) => write!(f, "{}", err),
        }
    }
}

impl From<DatabaseError> for Abort {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::RolledBack(reason) => Abort::Rollback(reason),
            other => Abort::Fail(other),
        }
    }
}

impl From<StorageError> for Abort {
    fn from(err: StorageError) -> Self {
        Abort::Fail(DatabaseError::Storage(err))
    }
}

impl From<ModelError> for Abort {
    fn from(err: ModelError) -> Self {
        Abort::from(DatabaseError::from(err))
    }
}

impl From<Abort> for DatabaseError {
    fn from(abort: Abort) -> Self {
        match abort {
            Abort::Rollback(reason) => DatabaseError::RolledBack(reason),
            Abort::Fail(err) => err,
        }
    }
}

/// What a finished transaction did.
#[derive(Debug)]
pub enum Outcome {
    /// committed; `None` when nothing changed or the transaction was nested
    Commit(Option<CommitId>),
    Rollback(String),
    /// failed without `propagate`
    Fail(DatabaseError),
}

impl Outcome {
    pub fn is_commit(&self) -> bool {
        matches!(self, Outcome::Commit(_))
    }

    pub fn commit_id(&self) -> Option<CommitId> {
        match self {
            Outcome::Commit(id) => *id,
            _ => None,
        }
    }

    /// Turn rollbacks and failures back into errors.
    pub fn into_result(self) -> Result<Option<CommitId>, DatabaseError> {
        match self {
            Outcome::Commit(id) => Ok(id),
            Outcome::Rollback(reason) => Err(DatabaseError::RolledBack(reason)),
            Outcome::Fail(err) => Err(err),
        }
    }
}

/// Result of a branch-and-merge transaction.
#[derive(Debug)]
pub enum BranchOutcome {
    /// the branch was merged back; `commit` is the merge commit, if one was needed
    Merged {
        branch: String,
        commit: Option<CommitId>,
    },
    /// the branch was left unmerged and the default branch is unchanged
    Failed { branch: String, cause: DatabaseError },
}

impl BranchOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, BranchOutcome::Merged { .. })
    }

    pub fn branch(&self) -> &str {
        match self {
            BranchOutcome::Merged { branch, .. } | BranchOutcome::Failed { branch, .. } => branch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_round_trips_through_database_error() {
        let err: DatabaseError = Abort::rollback("nope").into();
        assert!(matches!(err, DatabaseError::RolledBack(ref r) if r == "nope"));

        let back: Abort = err.into();
        assert!(back.is_rollback());
    }

    #[test]
    fn test_model_errors_become_failures() {
        let abort: Abort = ModelError::InvalidPath("a\0b".into()).into();
        match abort {
            Abort::Fail(DatabaseError::Model(ModelError::InvalidPath(_))) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_outcome_into_result() {
        assert!(Outcome::Commit(None).into_result().unwrap().is_none());
        assert!(matches!(
            Outcome::Rollback("x".into()).into_result(),
            Err(DatabaseError::RolledBack(_))
        ));
        assert!(!Outcome::Fail(DatabaseError::Closed).is_commit());
    }
}
